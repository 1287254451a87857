//! `DeviceBuilder` — wires a `KernelDevice` together.
//!
//! This is the dependency-injection point. Everything has a production
//! default; tests swap in an `EmulatedEngine`, a recording supervisor or a
//! fast backoff schedule without touching the device code.
//!
//! ```text
//! DeviceBuilder::new(path)
//!     .config(DeviceConfig)            default: DeviceConfig::default()
//!     .engine(Box<dyn AioEngine>)      default: from config.backend
//!     .supervisor(Arc<dyn Supervisor>) default: AbortSupervisor
//!     .backoff(single, batch)          default: SINGLE / BATCH
//!     .on_discard(callback)            default: none
//!     .open()
//! ```

use crate::aio_queue::{AioQueue, BackoffPolicy};
use crate::completion;
use crate::discard::{DiscardCallback, DiscardFn, DiscardQueue};
use crate::emulated::EmulatedEngine;
use crate::kernel_device::{sys, DeviceInner, DeviceKind, KernelDevice};
use crate::libaio::LibAioEngine;
use crate::supervisor::AbortSupervisor;

use bdev_core::buffer::align_down;
use bdev_core::config::{AioBackend, DeviceConfig};
use bdev_core::engine::AioEngine;
use bdev_core::error::{BdevError, Result};
use bdev_core::interval_set::IntervalSet;
use bdev_core::metrics::MetricsAggregator;
use bdev_core::stall::StallTracker;
use bdev_core::supervisor::Supervisor;

use nix::errno::Errno;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

pub struct DeviceBuilder {
    path: PathBuf,
    config: DeviceConfig,
    engine: Option<Box<dyn AioEngine>>,
    supervisor: Option<Arc<dyn Supervisor>>,
    single: BackoffPolicy,
    batch: BackoffPolicy,
    on_discard: Option<DiscardCallback>,
}

impl DeviceBuilder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: DeviceConfig::default(),
            engine: None,
            supervisor: None,
            single: BackoffPolicy::SINGLE,
            batch: BackoffPolicy::BATCH,
            on_discard: None,
        }
    }

    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `engine` instead of building one from `config.backend`.
    pub fn engine(mut self, engine: Box<dyn AioEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn backoff(mut self, single: BackoffPolicy, batch: BackoffPolicy) -> Self {
        self.single = single;
        self.batch = batch;
        self
    }

    /// Called on the discard thread with every batch of discarded ranges.
    pub fn on_discard<F>(mut self, f: F) -> Self
    where
        F: Fn(&IntervalSet) + Send + Sync + 'static,
    {
        self.on_discard = Some(Box::new(f));
        self
    }

    /// Open the device and start its threads.
    ///
    /// 1. Validates the configuration
    /// 2. Opens the direct and buffered descriptors
    /// 3. Takes the exclusive lock
    /// 4. Probes size, block size and sysfs attributes
    /// 5. Builds the AIO engine
    /// 6. Starts the completion and discard threads
    pub fn open(self) -> Result<KernelDevice> {
        let name = self.path.display().to_string();
        let span = tracing::info_span!("bdev", path = %name);
        let _enter = span.enter();
        let start = Instant::now();

        // 1. Config
        self.config.validate()?;

        // 2. Descriptors
        let (fd_direct, direct) = open_direct(&self.path, self.config.direct_io)?;
        let fd_buffered = open_file(&self.path, false)
            .map_err(|errno| BdevError::from_open(&name, errno))?;

        // 3. Lock
        let ret = unsafe { libc::flock(fd_buffered.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        match Errno::result(ret) {
            Ok(_) => {}
            Err(Errno::EWOULDBLOCK) => {
                return Err(BdevError::Config(format!(
                    "device busy: {} is locked by another process",
                    name
                )))
            }
            Err(errno) => return Err(BdevError::from_open(&name, errno)),
        }

        // 4. Geometry
        let geo = probe_geometry(&fd_direct, &name, self.config.block_size)?;

        // 5. Engine
        let engine = match self.engine {
            Some(e) => e,
            None => build_engine(&self.config)?,
        };
        let queue = AioQueue::with_backoff(engine, self.single, self.batch);

        let inner = Arc::new(DeviceInner {
            path: self.path.clone(),
            name: name.clone(),
            metrics: MetricsAggregator::new(self.config.aio_stats_min_period),
            debug_inflight: self
                .config
                .debug_inflight_ios
                .then(|| Mutex::new(IntervalSet::new())),
            stall: Mutex::new(StallTracker::with_capacity(self.config.aio_queue_max_iodepth)),
            config: self.config,
            fd_direct,
            fd_buffered,
            direct,
            kind: geo.kind,
            size: geo.size,
            block_size: geo.block_size,
            devname: geo.devname,
            rotational: geo.rotational,
            queue,
            discard: Arc::new(DiscardQueue::new()),
            supervisor: self
                .supervisor
                .unwrap_or_else(|| Arc::new(AbortSupervisor)),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            io_since_flush: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            submit_gate: RwLock::new(()),
            submit_retries: AtomicU64::new(0),
        });

        // 6. Threads
        let aio = completion::spawn(Arc::clone(&inner)).map_err(|e| BdevError::Resource {
            what: "threads",
            errno: Errno::from_raw(e.raw_os_error().unwrap_or(libc::EAGAIN)),
        })?;
        let dev = Arc::clone(&inner);
        let issue: DiscardFn = Box::new(move |offset, len| dev.discard_range(offset, len));
        let discard = match inner.discard.spawn(issue, self.on_discard) {
            Ok(h) => h,
            Err(e) => {
                inner.stop.store(true, Ordering::Release);
                let _ = aio.join();
                return Err(BdevError::Resource {
                    what: "threads",
                    errno: Errno::from_raw(e.raw_os_error().unwrap_or(libc::EAGAIN)),
                });
            }
        };

        tracing::info!(
            size = inner.size,
            block_size = inner.block_size,
            kind = ?inner.kind,
            backend = inner.queue.engine_name(),
            direct = inner.direct,
            rotational = inner.rotational,
            elapsed_us = start.elapsed().as_micros() as u64,
            "opened"
        );
        Ok(KernelDevice::from_parts(inner, aio, discard))
    }
}

fn open_file(path: &Path, direct: bool) -> std::result::Result<File, Errno> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if direct {
        opts.custom_flags(libc::O_DIRECT);
    }
    opts.open(path)
        .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
}

/// Open with `O_DIRECT`, falling back to buffered when the filesystem
/// rejects it (tmpfs, some FUSE mounts).
fn open_direct(path: &Path, want_direct: bool) -> Result<(File, bool)> {
    let name = path.display().to_string();
    if !want_direct {
        let f = open_file(path, false).map_err(|errno| BdevError::from_open(&name, errno))?;
        return Ok((f, false));
    }
    match open_file(path, true) {
        Ok(f) => Ok((f, true)),
        Err(Errno::EINVAL) => {
            tracing::warn!("O_DIRECT not supported, falling back to buffered io");
            let f = open_file(path, false).map_err(|errno| BdevError::from_open(&name, errno))?;
            Ok((f, false))
        }
        Err(errno) => Err(BdevError::from_open(&name, errno)),
    }
}

struct Geometry {
    kind: DeviceKind,
    size: u64,
    block_size: u64,
    devname: Option<String>,
    rotational: bool,
}

fn probe_geometry(file: &File, name: &str, block_size: u64) -> Result<Geometry> {
    let meta = file.metadata().map_err(|e| BdevError::Io {
        op: "fstat",
        errno: Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
    })?;
    let ft = meta.file_type();

    let (kind, raw_size, devname, rotational) = if ft.is_block_device() {
        let mut size: u64 = 0;
        unsafe { sys::blkgetsize64(file.as_raw_fd(), &mut size) }
            .map_err(|errno| BdevError::Io { op: "BLKGETSIZE64", errno })?;
        let (devname, rotational) = sysfs_attrs(meta.rdev());
        (DeviceKind::Block, size, devname, rotational)
    } else if ft.is_file() {
        // No way to tell what backs a regular file; assume spinning media.
        (DeviceKind::File, meta.len(), None, true)
    } else {
        return Err(BdevError::Config(format!(
            "{} is neither a block device nor a regular file",
            name
        )));
    };

    let size = align_down(raw_size, block_size);
    if size != raw_size {
        tracing::warn!(raw_size, size, block_size, "size rounded down to block size");
    }
    Ok(Geometry {
        kind,
        size,
        block_size,
        devname,
        rotational,
    })
}

/// Kernel name and rotational flag from `/sys/dev/block/MAJ:MIN`.
/// Partitions keep `queue/` in their parent directory.
fn sysfs_attrs(rdev: u64) -> (Option<String>, bool) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    let dir = PathBuf::from(format!("/sys/dev/block/{}:{}", major, minor));

    let devname = fs::read_link(&dir)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));

    let rotational = [dir.join("queue/rotational"), dir.join("../queue/rotational")]
        .iter()
        .find_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim() != "0")
        .unwrap_or(true);

    (devname, rotational)
}

fn build_engine(config: &DeviceConfig) -> Result<Box<dyn AioEngine>> {
    let depth = config.aio_queue_max_iodepth;
    match config.backend {
        AioBackend::Libaio => Ok(Box::new(LibAioEngine::new(depth)?)),
        AioBackend::IoUring => uring_engine(depth),
        AioBackend::Emulated => Ok(Box::new(EmulatedEngine::new(depth))),
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "io-uring")] {
        fn uring_engine(depth: usize) -> Result<Box<dyn AioEngine>> {
            Ok(Box::new(crate::uring::IoUringEngine::new(depth)?))
        }
    } else {
        fn uring_engine(_depth: usize) -> Result<Box<dyn AioEngine>> {
            Err(BdevError::Config("built without io_uring support".into()))
        }
    }
}
