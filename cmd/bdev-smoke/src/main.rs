//! Block device end-to-end smoke test
//!
//! Exercises a `KernelDevice` against a real file or block device:
//!   Part A — open, geometry, exclusive lock
//!   Part B — synchronous reads and writes, flush
//!   Part C — aio through the configured backend
//!   Part D — discard queue
//!   Part E — stats and metadata
//!   Part F — close and reopen
//!
//! Run: ./target/release/bdev-smoke [PATH]
//! Without PATH a 16 MiB scratch file is used. The backend and the other
//! knobs come from the BDEV_* environment variables; RUST_LOG controls
//! logging. WARNING: PATH is overwritten.

use bdev_core::block_device::BlockDevice;
use bdev_core::config::DeviceConfig;
use bdev_core::interval_set::IntervalSet;
use bdev_core::io_context::IoContext;
use bdev_kernel::KernelDevice;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const SCRATCH_SIZE: u64 = 16 << 20;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

// ════════════════════════════════════════════════════════════
// Part A: Open
// ════════════════════════════════════════════════════════════

fn test_open(t: &mut TestRunner, path: &Path, config: &DeviceConfig) -> Option<KernelDevice> {
    t.section("Part A: Open");

    let dev = match KernelDevice::open(path, config.clone()) {
        Ok(d) => { t.pass("open"); d }
        Err(e) => {
            t.fail("open", &e.to_string());
            return None;
        }
    };

    let bs = dev.get_block_size();
    t.check("size is block aligned", dev.get_size() % bs == 0, &format!("size={}", dev.get_size()));
    t.check("size > 0", dev.get_size() > 0, "empty device");
    t.check("healthy after open", dev.is_healthy(), "unhealthy");
    println!(
        "       kind={:?} size={} block_size={} direct={} rotational={} devname={:?}",
        dev.kind(), dev.get_size(), bs, dev.is_direct(), dev.is_rotational(), dev.get_devname()
    );

    match KernelDevice::open(path, config.clone()) {
        Ok(_) => t.fail("second open is refused", "opened twice"),
        Err(e) => t.check("second open is refused", e.to_string().contains("busy"), &e.to_string()),
    }

    Some(dev)
}

// ════════════════════════════════════════════════════════════
// Part B: Synchronous I/O
// ════════════════════════════════════════════════════════════

fn test_sync(t: &mut TestRunner, dev: &KernelDevice) {
    t.section("Part B: Synchronous I/O");
    let bs = dev.get_block_size();
    let data = pattern((bs * 4) as usize, 1);

    let r = dev.write(0, &data, false);
    t.check("aligned direct write", r.is_ok(), &format!("{:?}", r.err()));
    match dev.read(0, bs * 4, false) {
        Ok(got) => t.check("direct read matches", got == data, "data mismatch"),
        Err(e) => t.fail("direct read matches", &e.to_string()),
    }

    let direct = dev.read(7, 100, false);
    let buffered = dev.read(7, 100, true);
    t.check(
        "unaligned read: direct == buffered",
        matches!((&direct, &buffered), (Ok(a), Ok(b)) if a == b && a[..] == data[7..107]),
        "mismatch",
    );

    let r = dev.write(3, b"smoke", false);
    t.check("unaligned direct write refused", r.is_err(), "accepted");
    let r = dev.write(3, b"smoke", true);
    t.check("unaligned buffered write", r.is_ok(), &format!("{:?}", r.err()));

    let r = dev.flush();
    t.check("flush", r.is_ok(), &format!("{:?}", r.err()));
    let r = dev.invalidate_cache(0, bs * 4);
    t.check("invalidate_cache", r.is_ok(), &format!("{:?}", r.err()));

    let r = dev.read(dev.get_size(), 1, true);
    t.check("read past end refused", r.is_err(), "accepted");
}

// ════════════════════════════════════════════════════════════
// Part C: AIO
// ════════════════════════════════════════════════════════════

fn test_aio(t: &mut TestRunner, dev: &KernelDevice) {
    t.section("Part C: AIO");
    let bs = dev.get_block_size();
    const OPS: u64 = 32;

    let callbacks = Arc::new(AtomicU64::new(0));
    let c = callbacks.clone();
    let ioc = Arc::new(IoContext::with_callback(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    }));
    for i in 0..OPS {
        if let Err(e) = dev.aio_write(i * bs, &pattern(bs as usize, i as u8), &ioc) {
            t.fail("queue aio writes", &e.to_string());
            return;
        }
    }
    t.check("queue aio writes", ioc.num_pending() == OPS as usize, "pending count");

    let start = Instant::now();
    let r = dev.aio_submit(&ioc);
    t.check("submit batch", r.is_ok(), &format!("{:?}", r.err()));
    let done = ioc.aio_wait_timeout(Duration::from_secs(10));
    t.check("batch completes", done, "timed out");
    println!("       {} writes in {:?}", OPS, start.elapsed());
    t.check("no errors", ioc.return_value() == 0, &format!("ret={}", ioc.return_value()));
    t.check("all ops returned", ioc.take_completed().len() == OPS as usize, "missing ops");

    let deadline = Instant::now() + Duration::from_secs(1);
    while callbacks.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    t.check("callback fired once", callbacks.load(Ordering::SeqCst) == 1, "callback count");

    let rctx = Arc::new(IoContext::new());
    for i in 0..OPS {
        let _ = dev.aio_read(i * bs, bs, &rctx);
    }
    let r = dev.aio_submit(&rctx);
    t.check("submit reads", r.is_ok(), &format!("{:?}", r.err()));
    rctx.aio_wait();
    let ok = rctx.take_completed().iter().all(|op| {
        let i = op.offset / bs;
        op.data() == &pattern(bs as usize, i as u8)[..]
    });
    t.check("aio reads match writes", ok, "data mismatch");

    let r = dev.aio_read(1, bs, &rctx);
    t.check("misaligned aio refused", r.is_err(), "accepted");
    t.check("nothing in flight", dev.ops_in_flight() == 0, &format!("{}", dev.ops_in_flight()));
    t.check("still healthy", dev.is_healthy(), "unhealthy");
}

// ════════════════════════════════════════════════════════════
// Part D: Discard
// ════════════════════════════════════════════════════════════

fn test_discard(t: &mut TestRunner, dev: &KernelDevice, seen: &Mutex<Vec<(u64, u64)>>) {
    t.section("Part D: Discard");
    let bs = dev.get_block_size();

    let mut set = IntervalSet::new();
    set.insert(bs * 8, bs);
    set.insert(bs * 9, bs);
    let r = dev.queue_discard(&set);
    t.check("queue_discard", r.is_ok(), &format!("{:?}", r.err()));
    dev.discard_drain();

    let got = seen.lock().unwrap_or_else(|e| e.into_inner()).clone();
    t.check(
        "adjacent ranges coalesced",
        got.contains(&(bs * 8, bs * 2)),
        &format!("{:?}", got),
    );
    let r = dev.discard(dev.get_size(), bs);
    t.check("discard past end refused", r.is_err(), "accepted");
}

// ════════════════════════════════════════════════════════════
// Part E: Stats and metadata
// ════════════════════════════════════════════════════════════

fn test_stats(t: &mut TestRunner, dev: &KernelDevice) {
    t.section("Part E: Stats and metadata");

    let stats = dev.get_stats();
    println!(
        "       length max={} mean={:.2}  latency max={}us mean={:.1}us",
        stats.length_max, stats.length_mean, stats.last_completed_max_us, stats.last_completed_mean_us
    );
    t.check("queue length observed", stats.length_max >= 1, "no samples");

    let meta = dev.collect_metadata("bdev_");
    for (k, v) in &meta {
        println!("       {} = {}", k, v);
    }
    t.check(
        "metadata has geometry",
        meta.get("bdev_size") == Some(&dev.get_size().to_string()),
        "bdev_size",
    );
    t.check("metadata has backend", meta.contains_key("bdev_backend"), "bdev_backend");
}

// ════════════════════════════════════════════════════════════
// Part F: Close
// ════════════════════════════════════════════════════════════

fn test_close(t: &mut TestRunner, dev: KernelDevice, path: &Path, config: &DeviceConfig) {
    t.section("Part F: Close");

    let r = dev.close();
    t.check("close", r.is_ok(), &format!("{:?}", r.err()));
    t.check("close is idempotent", dev.close().is_ok(), "second close failed");
    t.check("io after close refused", dev.read(0, 1, true).is_err(), "accepted");
    drop(dev);

    match KernelDevice::open(path, config.clone()) {
        Ok(d) => {
            let bs = d.get_block_size();
            let ok = d.read(bs, bs, false).map(|b| b == pattern(bs as usize, 1)).unwrap_or(false);
            t.check("reopen sees aio data", ok, "data mismatch");
        }
        Err(e) => t.fail("reopen", &e.to_string()),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let scratch;
    let path: PathBuf = match std::env::args().nth(1) {
        Some(p) => PathBuf::from(p),
        None => {
            scratch = match tempfile::NamedTempFile::new() {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("cannot create scratch file: {}", e);
                    std::process::exit(2);
                }
            };
            if let Err(e) = scratch.as_file().set_len(SCRATCH_SIZE) {
                eprintln!("cannot size scratch file: {}", e);
                std::process::exit(2);
            }
            scratch.path().to_path_buf()
        }
    };
    let config = DeviceConfig::from_env();

    println!("bdev smoke test: {} (backend {})", path.display(), config.backend.name());
    tracing::info!(path = %path.display(), ?config, "smoke start");

    let mut t = TestRunner::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let opened = test_open(&mut t, &path, &config).and_then(|probe| {
        // Reopen with a discard observer now that the lock check has run.
        drop(probe);
        KernelDevice::builder(&path)
            .config(config.clone())
            .on_discard(move |set| s.lock().unwrap_or_else(|e| e.into_inner()).extend(set.iter()))
            .open()
            .map_err(|e| t.fail("reopen with discard observer", &e.to_string()))
            .ok()
    });

    if let Some(dev) = opened {
        test_sync(&mut t, &dev);
        test_aio(&mut t, &dev);
        test_discard(&mut t, &dev, &seen);
        test_stats(&mut t, &dev);
        test_close(&mut t, dev, &path, &config);
    }

    t.summary();
    if t.failed > 0 {
        std::process::exit(1);
    }
}
