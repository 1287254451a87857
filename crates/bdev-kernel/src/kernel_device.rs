//! `KernelDevice` — the `BlockDevice` implementation over a raw block
//! device or a regular file.
//!
//! ```text
//!   callers ──aio_read/aio_write──▶ IoContext (pending)
//!           ──aio_submit──▶ StallTracker + AioQueue ──▶ engine
//!                                                      │
//!   bdev-aio thread ◀──────────── completions ◀────────┘
//!           └─▶ IoContext (completed, callback, wake)
//!
//!   callers ──discard──▶ DiscardQueue ──▶ bdev-discard thread ──▶ BLKDISCARD
//! ```
//!
//! Two descriptors are kept: a direct one (`O_DIRECT` unless the
//! filesystem refuses it) used for aio and aligned synchronous I/O, and a
//! buffered one for buffered reads/writes and cache invalidation.
//!
//! Health is sticky: after any failed completion every `aio_submit` fails
//! with `Unhealthy` without reaching the kernel, until the device is
//! reopened.

use crate::aio_queue::AioQueue;
use crate::builder::DeviceBuilder;
use crate::completion::InflightOp;
use crate::discard::DiscardQueue;

use bdev_core::block_device::BlockDevice;
use bdev_core::buffer::{align_down, align_up, AlignedBuf};
use bdev_core::config::DeviceConfig;
use bdev_core::error::{BdevError, Result};
use bdev_core::interval_set::IntervalSet;
use bdev_core::io_context::IoContext;
use bdev_core::metrics::{AioQueueStats, MetricsAggregator};
use bdev_core::op::{AioOp, AioOpcode, IoRequest};
use bdev_core::stall::StallTracker;
use bdev_core::supervisor::Supervisor;

use nix::errno::Errno;
use nix::sys::uio::{pread, pwrite};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

pub(crate) mod sys {
    // BLKGETSIZE64 = _IOR(0x12, 114, size_t)
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    // BLKDISCARD = _IO(0x12, 119), takes uint64_t[2] = { offset, len }
    nix::ioctl_write_ptr_bad!(blkdiscard, nix::request_code_none!(0x12, 119), [u64; 2]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    File,
}

/// State shared by the device handle and its two background threads.
pub(crate) struct DeviceInner {
    pub path: PathBuf,
    /// Label for logs and the supervisor.
    pub name: String,
    pub config: DeviceConfig,
    pub fd_direct: File,
    pub fd_buffered: File,
    /// Whether `fd_direct` really is `O_DIRECT`.
    pub direct: bool,
    pub kind: DeviceKind,
    pub size: u64,
    pub block_size: u64,
    pub devname: Option<String>,
    pub rotational: bool,

    pub queue: AioQueue,
    pub stall: Mutex<StallTracker>,
    pub debug_inflight: Option<Mutex<IntervalSet>>,
    pub metrics: MetricsAggregator,
    pub discard: Arc<DiscardQueue>,
    pub supervisor: Arc<dyn Supervisor>,

    pub healthy: AtomicBool,
    pub closed: AtomicBool,
    /// Tells the completion thread to exit once nothing is in flight.
    pub stop: AtomicBool,
    pub io_since_flush: AtomicBool,
    pub flush_lock: Mutex<()>,
    /// Held shared by every `aio_submit`; `close` takes it exclusively so
    /// no submission is still inside the kernel when `stop` is set.
    pub submit_gate: RwLock<()>,
    pub submit_retries: AtomicU64,
}

impl DeviceInner {
    pub fn stall_lock(&self) -> MutexGuard<'_, StallTracker> {
        self.stall.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BdevError::Closed);
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BdevError::OutOfRange {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn is_aligned(&self, offset: u64, len: u64) -> bool {
        offset % self.block_size == 0 && len % self.block_size == 0
    }

    fn check_aligned(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 || !self.is_aligned(offset, len) {
            return Err(BdevError::Misaligned {
                offset,
                len,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    fn direct_fd(&self) -> RawFd {
        self.fd_direct.as_raw_fd()
    }

    /// Issue one discard. Runs on the discard thread.
    pub fn discard_range(&self, offset: u64, len: u64) -> Result<()> {
        match self.kind {
            DeviceKind::Block => {
                let range = [offset, len];
                unsafe { sys::blkdiscard(self.direct_fd(), &range) }
                    .map(drop)
                    .map_err(|errno| BdevError::Io {
                        op: "BLKDISCARD",
                        errno,
                    })
            }
            DeviceKind::File => {
                let ret = unsafe {
                    libc::fallocate(
                        self.direct_fd(),
                        libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                        offset as libc::off_t,
                        len as libc::off_t,
                    )
                };
                Errno::result(ret).map(drop).map_err(|errno| BdevError::Io {
                    op: "fallocate",
                    errno,
                })
            }
        }
    }

    // ── Synchronous I/O helpers ──

    fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match pread(file, &mut buf[done..], (offset + done as u64) as libc::off_t) {
                Ok(0) => {
                    return Err(BdevError::ShortIo {
                        op: "read",
                        expected: buf.len(),
                        actual: done,
                    })
                }
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(BdevError::Io { op: "pread", errno }),
            }
        }
        Ok(())
    }

    fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match pwrite(file, &buf[done..], (offset + done as u64) as libc::off_t) {
                Ok(0) => {
                    return Err(BdevError::ShortIo {
                        op: "write",
                        expected: buf.len(),
                        actual: done,
                    })
                }
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(BdevError::Io { op: "pwrite", errno }),
            }
        }
        Ok(())
    }

    /// Read the block-aligned range covering `[offset, offset + buf.len())`
    /// through the direct descriptor and copy out the requested bytes.
    fn direct_read_unaligned(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = align_down(offset, self.block_size);
        let end = align_up(offset + buf.len() as u64, self.block_size);
        let mut scratch = AlignedBuf::zeroed((end - start) as usize, self.block_size as usize);
        Self::pread_exact(&self.fd_direct, &mut scratch, start)?;
        let skip = (offset - start) as usize;
        buf.copy_from_slice(&scratch[skip..skip + buf.len()]);
        Ok(())
    }
}

struct Threads {
    aio: Option<JoinHandle<()>>,
    discard: Option<JoinHandle<()>>,
}

pub struct KernelDevice {
    pub(crate) inner: Arc<DeviceInner>,
    threads: Mutex<Threads>,
}

impl KernelDevice {
    pub fn builder(path: impl AsRef<Path>) -> DeviceBuilder {
        DeviceBuilder::new(path)
    }

    pub(crate) fn from_parts(
        inner: Arc<DeviceInner>,
        aio: JoinHandle<()>,
        discard: JoinHandle<()>,
    ) -> Self {
        Self {
            inner,
            threads: Mutex::new(Threads {
                aio: Some(aio),
                discard: Some(discard),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn kind(&self) -> DeviceKind {
        self.inner.kind
    }

    pub fn is_rotational(&self) -> bool {
        self.inner.rotational
    }

    /// Whether the direct descriptor really bypasses the page cache.
    pub fn is_direct(&self) -> bool {
        self.inner.direct
    }

    pub fn ops_in_flight(&self) -> u64 {
        self.inner.queue.ops_in_flight()
    }

    pub fn aio_submit_retries(&self) -> u64 {
        self.inner.submit_retries.load(Ordering::Relaxed)
    }

    /// Reject `ops` that overlap each other or anything in flight, else
    /// record them as in flight.
    fn claim_inflight(&self, ops: &[AioOp]) -> Result<()> {
        let Some(set) = &self.inner.debug_inflight else {
            return Ok(());
        };
        let mut set = set.lock().unwrap_or_else(|e| e.into_inner());
        let mut claimed = IntervalSet::new();
        for op in ops {
            let len = op.len() as u64;
            if set.intersects(op.offset, len) || claimed.intersects(op.offset, len) {
                tracing::error!(offset = op.offset, len, "overlapping in-flight aio");
                return Err(BdevError::OverlappingIo {
                    offset: op.offset,
                    len,
                });
            }
            claimed.insert(op.offset, len);
        }
        set.insert_set(&claimed);
        Ok(())
    }

    fn release_inflight(&self, op: &AioOp) {
        if let Some(set) = &self.inner.debug_inflight {
            set.lock()
                .unwrap_or_else(|e| e.into_inner())
                .erase(op.offset, op.len() as u64);
        }
    }
}

impl BlockDevice for KernelDevice {
    fn open(path: &Path, config: DeviceConfig) -> Result<Self> {
        DeviceBuilder::new(path).config(config).open()
    }

    fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let span = tracing::info_span!("bdev", path = %self.inner.name);
        let _enter = span.enter();
        let start = Instant::now();

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        // Wait out submitters that got past the closed check.
        drop(self.inner.submit_gate.write().unwrap_or_else(|e| e.into_inner()));
        self.inner.discard.stop();
        if let Some(h) = threads.discard.take() {
            if h.join().is_err() {
                tracing::error!("discard thread panicked");
            }
        }
        self.inner.stop.store(true, Ordering::Release);
        if let Some(h) = threads.aio.take() {
            if h.join().is_err() {
                tracing::error!("completion thread panicked");
            }
        }

        let ret = unsafe { libc::flock(self.inner.fd_buffered.as_raw_fd(), libc::LOCK_UN) };
        if let Err(errno) = Errno::result(ret) {
            tracing::warn!(%errno, "unlock failed");
        }
        tracing::info!(elapsed_us = start.elapsed().as_micros() as u64, "closed");
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.inner.size
    }

    fn get_block_size(&self) -> u64 {
        self.inner.block_size
    }

    fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    fn get_devname(&self) -> Option<String> {
        self.inner.devname.clone()
    }

    fn get_stats(&self) -> Arc<AioQueueStats> {
        self.inner.metrics.get_stats()
    }

    fn collect_metadata(&self, prefix: &str) -> BTreeMap<String, String> {
        let d = &self.inner;
        let mut pm = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            pm.insert(format!("{}{}", prefix, k), v);
        };
        put("driver", "KernelDevice".into());
        put("backend", d.queue.engine_name().into());
        put("size", d.size.to_string());
        put("block_size", d.block_size.to_string());
        put("rotational", (d.rotational as u8).to_string());
        put("type", if d.rotational { "hdd" } else { "ssd" }.into());
        put("direct_io", d.direct.to_string());
        put("support_discard", "true".into());
        put("aio_submit_retries", self.aio_submit_retries().to_string());
        match d.kind {
            DeviceKind::Block => {
                put("access_mode", "blk".into());
                put("dev_node", d.path.display().to_string());
                if let Some(name) = &d.devname {
                    put("devname", name.clone());
                }
            }
            DeviceKind::File => {
                put("access_mode", "file".into());
                put("path", d.path.display().to_string());
            }
        }
        pm
    }

    fn read(&self, offset: u64, len: u64, buffered: bool) -> Result<Vec<u8>> {
        let d = &self.inner;
        d.check_open()?;
        d.check_range(offset, len)?;
        let n = usize::try_from(len).map_err(|_| BdevError::OutOfRange {
            offset,
            len,
            size: d.size,
        })?;
        let mut out = vec![0u8; n];
        self.read_random(offset, &mut out, buffered)?;
        Ok(out)
    }

    fn read_random(&self, offset: u64, buf: &mut [u8], buffered: bool) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        d.check_range(offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }
        if buffered {
            return DeviceInner::pread_exact(&d.fd_buffered, buf, offset);
        }
        let ptr_aligned = buf.as_ptr() as u64 % d.block_size == 0;
        if ptr_aligned && d.is_aligned(offset, buf.len() as u64) {
            DeviceInner::pread_exact(&d.fd_direct, buf, offset)
        } else {
            d.direct_read_unaligned(offset, buf)
        }
    }

    fn write(&self, offset: u64, data: &[u8], buffered: bool) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        let len = data.len() as u64;
        d.check_range(offset, len)?;
        if data.is_empty() {
            return Ok(());
        }
        if !buffered && !d.is_aligned(offset, len) {
            return Err(BdevError::Misaligned {
                offset,
                len,
                block_size: d.block_size,
            });
        }

        d.io_since_flush.store(true, Ordering::Release);
        if buffered {
            DeviceInner::pwrite_all(&d.fd_buffered, data, offset)?;
            // Start writeback now so a later flush has less to wait for.
            let ret = unsafe {
                libc::sync_file_range(
                    d.fd_buffered.as_raw_fd(),
                    offset as libc::off64_t,
                    len as libc::off64_t,
                    libc::SYNC_FILE_RANGE_WRITE,
                )
            };
            if let Err(errno) = Errno::result(ret) {
                return Err(BdevError::Io {
                    op: "sync_file_range",
                    errno,
                });
            }
            Ok(())
        } else if data.as_ptr() as u64 % d.block_size == 0 {
            DeviceInner::pwrite_all(&d.fd_direct, data, offset)
        } else {
            let buf = AlignedBuf::copy_from(data, d.block_size as usize);
            DeviceInner::pwrite_all(&d.fd_direct, &buf, offset)
        }
    }

    fn flush(&self) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        if !d.io_since_flush.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = d.flush_lock.lock().unwrap_or_else(|e| e.into_inner());
        if d
            .io_since_flush
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another flush covered our writes while we waited.
            return Ok(());
        }

        let span = tracing::debug_span!("flush", path = %d.name);
        let _enter = span.enter();
        let start = Instant::now();
        let ret = unsafe { libc::fdatasync(d.direct_fd()) };
        if let Err(errno) = Errno::result(ret) {
            d.healthy.store(false, Ordering::Release);
            tracing::error!(%errno, "fdatasync failed, device marked unhealthy");
            return Err(BdevError::Io {
                op: "fdatasync",
                errno,
            });
        }
        tracing::debug!(elapsed_us = start.elapsed().as_micros() as u64, "fdatasync");
        Ok(())
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        d.check_range(offset, len)?;
        let r = unsafe {
            libc::posix_fadvise(
                d.fd_buffered.as_raw_fd(),
                offset as libc::off_t,
                len as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            )
        };
        if r != 0 {
            return Err(BdevError::Io {
                op: "posix_fadvise",
                errno: Errno::from_raw(r),
            });
        }
        Ok(())
    }

    fn aio_read(&self, offset: u64, len: u64, ioc: &IoContext) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        d.check_aligned(offset, len)?;
        d.check_range(offset, len)?;
        let buf = AlignedBuf::zeroed(len as usize, d.block_size as usize);
        ioc.push_pending(AioOp::new(d.direct_fd(), offset, AioOpcode::Read, buf));
        Ok(())
    }

    fn aio_write(&self, offset: u64, data: &[u8], ioc: &IoContext) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        d.check_aligned(offset, data.len() as u64)?;
        d.check_range(offset, data.len() as u64)?;
        let buf = AlignedBuf::copy_from(data, d.block_size as usize);
        ioc.push_pending(AioOp::new(d.direct_fd(), offset, AioOpcode::Write, buf));
        d.io_since_flush.store(true, Ordering::Release);
        Ok(())
    }

    fn aio_submit(&self, ioc: &Arc<IoContext>) -> Result<()> {
        let d = &self.inner;
        let _gate = d.submit_gate.read().unwrap_or_else(|e| e.into_inner());
        d.check_open()?;
        if !self.is_healthy() {
            return Err(BdevError::Unhealthy);
        }

        let ops = ioc.take_pending();
        if ops.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.claim_inflight(&ops) {
            ioc.restore_pending(ops, 0);
            return Err(e);
        }

        // Box every op before the first kernel call: a completion may be
        // reaped before submit returns.
        let mut raws: Vec<*mut InflightOp> = Vec::with_capacity(ops.len());
        let mut reqs: Vec<IoRequest> = Vec::with_capacity(ops.len());
        {
            let mut stall = d.stall_lock();
            for mut op in ops {
                op.link = Some(stall.link());
                op.mark_queued();
                let raw = InflightOp {
                    op,
                    ctx: Arc::clone(ioc),
                }
                .into_raw();
                // Safety: `raw` is live until the completion thread reclaims it.
                reqs.push(unsafe { (*raw).op.request(raw as u64) });
                raws.push(raw);
            }
        }

        let res = if reqs.len() == 1 {
            d.queue.submit(&reqs[0])
        } else {
            d.queue.submit_batch(&reqs)
        };

        match res {
            Ok(outcome) => {
                if outcome.retries > 0 {
                    d.submit_retries
                        .fetch_add(outcome.retries as u64, Ordering::Relaxed);
                    tracing::warn!(
                        retries = outcome.retries,
                        ops = outcome.accepted,
                        "aio submit retried"
                    );
                }
                Ok(())
            }
            Err(e) => {
                // Ops past `accepted` never reached the kernel; take them back.
                let accepted = e.accepted();
                let mut returned = Vec::with_capacity(raws.len() - accepted);
                {
                    let mut stall = d.stall_lock();
                    for &raw in &raws[accepted..] {
                        // Safety: the kernel never saw this token.
                        let inflight = unsafe { InflightOp::from_token(raw as u64) };
                        let InflightOp { mut op, .. } = *inflight;
                        if let Some(link) = op.link {
                            stall.unlink(link);
                        }
                        self.release_inflight(&op);
                        op.mark_unsubmitted();
                        returned.push(op);
                    }
                }
                tracing::error!(error = %e, accepted, returned = returned.len(), "aio submit failed");
                ioc.restore_pending(returned, accepted);
                Err(e)
            }
        }
    }

    fn discard(&self, offset: u64, len: u64) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        d.check_range(offset, len)?;
        d.discard.queue(offset, len);
        Ok(())
    }

    fn queue_discard(&self, ranges: &IntervalSet) -> Result<()> {
        let d = &self.inner;
        d.check_open()?;
        if let Some((offset, len)) = ranges.iter().last() {
            d.check_range(offset, len)?;
        }
        d.discard.queue_set(ranges);
        Ok(())
    }

    fn discard_drain(&self) {
        self.inner.discard.drain();
    }
}

impl Drop for KernelDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for KernelDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDevice")
            .field("path", &self.inner.path)
            .field("kind", &self.inner.kind)
            .field("size", &self.inner.size)
            .field("block_size", &self.inner.block_size)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio_queue::BackoffPolicy;
    use crate::emulated::EmulatedEngine;
    use bdev_core::config::AioBackend;
    use bdev_core::error::ErrorKind;
    use std::sync::atomic::AtomicI64;
    use std::thread;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MIB: u64 = 1 << 20;
    const FAST: BackoffPolicy = BackoffPolicy {
        initial: Duration::from_micros(1),
        max_retries: 16,
    };

    fn scratch(size: u64) -> NamedTempFile {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(size).unwrap();
        f
    }

    fn test_config() -> DeviceConfig {
        DeviceConfig::new()
            .backend(AioBackend::Emulated)
            .aio_poll(Duration::from_millis(5))
            .aio_stats_min_period(Duration::ZERO)
    }

    type Fatals = Arc<Mutex<Vec<(ErrorKind, String)>>>;

    fn recording_supervisor() -> (Fatals, Arc<dyn Supervisor>) {
        let fatals: Fatals = Arc::new(Mutex::new(Vec::new()));
        let log = fatals.clone();
        let sup = move |_dev: &str, err: &BdevError| {
            log.lock().unwrap().push((err.kind(), err.to_string()));
        };
        (fatals, Arc::new(sup))
    }

    struct Harness {
        file: NamedTempFile,
        dev: KernelDevice,
        engine: Arc<EmulatedEngine>,
        fatals: Fatals,
    }

    fn harness_with(size: u64, config: DeviceConfig) -> Harness {
        let file = scratch(size);
        let engine = Arc::new(EmulatedEngine::new(64));
        let (fatals, sup) = recording_supervisor();
        let dev = KernelDevice::builder(file.path())
            .config(config)
            .engine(Box::new(engine.clone()))
            .supervisor(sup)
            .backoff(FAST, FAST)
            .open()
            .unwrap();
        Harness {
            file,
            dev,
            engine,
            fatals,
        }
    }

    fn harness() -> Harness {
        harness_with(MIB, test_config())
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_open_geometry() {
        let h = harness_with(MIB + 1000, test_config());
        assert_eq!(h.dev.get_size(), MIB);
        assert_eq!(h.dev.get_block_size(), 4096);
        assert_eq!(h.dev.kind(), DeviceKind::File);
        assert!(h.dev.is_healthy());
        assert_eq!(h.dev.get_devname(), None);
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = KernelDevice::open(&dir.path().join("nope"), test_config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_open_invalid_config() {
        let file = scratch(MIB);
        let err = KernelDevice::open(file.path(), test_config().block_size(3000)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_exclusive_lock() {
        let file = scratch(MIB);
        let first = KernelDevice::open(file.path(), test_config()).unwrap();
        let err = KernelDevice::open(file.path(), test_config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("busy"));

        first.close().unwrap();
        let again = KernelDevice::open(file.path(), test_config()).unwrap();
        again.close().unwrap();
    }

    #[test]
    fn test_aio_write_then_read() {
        let h = harness();
        let data = pattern(4096, 7);

        let status = Arc::new(AtomicI64::new(1));
        let s = status.clone();
        let ioc = Arc::new(IoContext::with_callback(move |ctx| {
            s.store(ctx.return_value(), Ordering::SeqCst);
        }));
        h.dev.aio_write(0, &data, &ioc).unwrap();
        assert_eq!(ioc.num_pending(), 1);
        h.dev.aio_submit(&ioc).unwrap();
        ioc.aio_wait();
        // The callback runs on the completion thread after the last op lands.
        let deadline = Instant::now() + Duration::from_secs(5);
        while status.load(Ordering::SeqCst) != 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(status.load(Ordering::SeqCst), 0);
        assert!(h.dev.is_healthy());

        let rctx = Arc::new(IoContext::new());
        h.dev.aio_read(0, 4096, &rctx).unwrap();
        h.dev.aio_submit(&rctx).unwrap();
        rctx.aio_wait();
        let done = rctx.take_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data(), &data[..]);
        assert_eq!(h.dev.ops_in_flight(), 0);
    }

    #[test]
    fn test_aio_batch_partial_accepts() {
        let h = harness();
        h.engine.limit_accept(1);
        let ioc = Arc::new(IoContext::new());
        for i in 0..4u64 {
            h.dev.aio_write(i * 4096, &pattern(4096, i as u8), &ioc).unwrap();
        }
        h.dev.aio_submit(&ioc).unwrap();
        assert!(ioc.aio_wait_timeout(Duration::from_secs(5)));
        assert_eq!(ioc.take_completed().len(), 4);
        assert_eq!(ioc.return_value(), 0);
        for i in 0..4u64 {
            assert_eq!(h.dev.read(i * 4096, 4096, true).unwrap(), pattern(4096, i as u8));
        }
    }

    #[test]
    fn test_failed_completion_marks_unhealthy() {
        let h = harness();
        h.engine.fail_next_completion(Errno::EIO);
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(4096, 1), &ioc).unwrap();
        h.dev.aio_submit(&ioc).unwrap();
        ioc.aio_wait();
        assert_eq!(ioc.return_value(), -(libc::EIO as i64));
        assert!(!h.dev.is_healthy());

        let calls = h.engine.submit_calls();
        let next = Arc::new(IoContext::new());
        h.dev.aio_write(4096, &pattern(4096, 2), &next).unwrap();
        let err = h.dev.aio_submit(&next).unwrap_err();
        assert!(matches!(err, BdevError::Unhealthy));
        assert_eq!(h.engine.submit_calls(), calls);
        assert_eq!(next.num_pending(), 1);
    }

    #[test]
    fn test_short_transfer_is_error() {
        // Reading past EOF of the backing file transfers nothing.
        let h = harness();
        h.file.as_file().set_len(4096).unwrap();
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_read(8192, 4096, &ioc).unwrap();
        h.dev.aio_submit(&ioc).unwrap();
        ioc.aio_wait();
        assert_eq!(ioc.return_value(), -(libc::EIO as i64));
        assert!(!h.dev.is_healthy());
    }

    #[test]
    fn test_submit_failure_returns_ops() {
        let h = harness();
        h.engine.fail_next_submit(Errno::EBADF);
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(4096, 3), &ioc).unwrap();
        h.dev.aio_write(4096, &pattern(4096, 4), &ioc).unwrap();

        let err = h.dev.aio_submit(&ioc).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(ioc.num_pending(), 2);
        assert_eq!(ioc.num_running(), 0);
        assert!(h.dev.inner.stall_lock().is_empty());

        // Retrying the same context goes through.
        h.dev.aio_submit(&ioc).unwrap();
        ioc.aio_wait();
        assert_eq!(ioc.take_completed().len(), 2);
        assert!(h.dev.is_healthy());
    }

    #[test]
    fn test_backpressure_retries_counted() {
        let h = harness();
        h.engine.inject_backpressure(3);
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(4096, 5), &ioc).unwrap();
        h.dev.aio_submit(&ioc).unwrap();
        ioc.aio_wait();
        assert_eq!(h.dev.aio_submit_retries(), 3);
        let meta = h.dev.collect_metadata("bluestore_bdev_");
        assert_eq!(meta["bluestore_bdev_aio_submit_retries"], "3");
    }

    #[test]
    fn test_misaligned_and_out_of_range_aio() {
        let h = harness();
        let ioc = IoContext::new();
        assert!(matches!(
            h.dev.aio_read(100, 4096, &ioc),
            Err(BdevError::Misaligned { .. })
        ));
        assert!(matches!(
            h.dev.aio_write(0, &[0u8; 100], &ioc),
            Err(BdevError::Misaligned { .. })
        ));
        assert!(matches!(
            h.dev.aio_read(MIB, 4096, &ioc),
            Err(BdevError::OutOfRange { .. })
        ));
        assert_eq!(ioc.num_pending(), 0);
    }

    #[test]
    fn test_unaligned_reads_match_buffered() {
        let h = harness();
        let data = pattern(64 * 1024, 9);
        h.dev.write(0, &data, false).unwrap();

        assert_eq!(h.dev.read(5, 10, false).unwrap(), &data[5..15]);
        for &off in &[0u64, 1, 5, 511, 4095, 4096, 5000, 12287] {
            for &len in &[1u64, 10, 4096, 5000, 8192] {
                let direct = h.dev.read(off, len, false).unwrap();
                let buffered = h.dev.read(off, len, true).unwrap();
                assert_eq!(direct, buffered, "off {} len {}", off, len);
                assert_eq!(direct, &data[off as usize..(off + len) as usize]);
            }
        }

        let mut buf = [0u8; 33];
        h.dev.read_random(4090, &mut buf, false).unwrap();
        assert_eq!(&buf[..], &data[4090..4123]);
    }

    #[test]
    fn test_sync_write_rules() {
        let h = harness();
        assert!(matches!(
            h.dev.write(10, b"hello", false),
            Err(BdevError::Misaligned { .. })
        ));
        h.dev.write(10, b"hello", true).unwrap();
        assert_eq!(h.dev.read(10, 5, false).unwrap(), b"hello");
        assert!(matches!(
            h.dev.write(MIB - 2, b"abc", true),
            Err(BdevError::OutOfRange { .. })
        ));
        assert!(matches!(
            h.dev.read(MIB - 2, 3, true),
            Err(BdevError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_flush_clears_dirty() {
        let h = harness();
        h.dev.flush().unwrap();
        assert!(!h.dev.inner.io_since_flush.load(Ordering::SeqCst));
        h.dev.write(0, &pattern(4096, 2), false).unwrap();
        assert!(h.dev.inner.io_since_flush.load(Ordering::SeqCst));
        h.dev.flush().unwrap();
        assert!(!h.dev.inner.io_since_flush.load(Ordering::SeqCst));
        assert!(h.dev.is_healthy());
    }

    #[test]
    fn test_invalidate_cache() {
        let h = harness();
        h.dev.write(0, &pattern(4096, 4), true).unwrap();
        h.dev.invalidate_cache(0, 4096).unwrap();
        assert_eq!(h.dev.read(0, 4096, true).unwrap(), pattern(4096, 4));
    }

    #[test]
    fn test_discard_coalesced_and_reported() {
        let file = scratch(MIB);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let dev = KernelDevice::builder(file.path())
            .config(test_config())
            .on_discard(move |set| s.lock().unwrap().extend(set.iter()))
            .open()
            .unwrap();

        let mut set = IntervalSet::new();
        set.insert(0, 4096);
        set.insert(4096, 4096);
        dev.queue_discard(&set).unwrap();
        dev.discard_drain();
        dev.discard(64 * 1024, 4096).unwrap();
        dev.discard_drain();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (0, 8192));
        assert_eq!(*seen.last().unwrap(), (64 * 1024, 4096));
        assert!(dev.inner.discard.is_idle());
    }

    #[test]
    fn test_overlapping_inflight_rejected() {
        let h = harness_with(MIB, test_config().debug_inflight_ios(true));
        h.engine.hold_completions(true);
        let first = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(8192, 1), &first).unwrap();
        h.dev.aio_submit(&first).unwrap();

        let second = Arc::new(IoContext::new());
        h.dev.aio_read(4096, 4096, &second).unwrap();
        let err = h.dev.aio_submit(&second).unwrap_err();
        assert!(matches!(err, BdevError::OverlappingIo { .. }));
        assert_eq!(second.num_pending(), 1);

        h.engine.hold_completions(false);
        first.aio_wait();
        h.dev.aio_submit(&second).unwrap();
        second.aio_wait();
        assert!(h.dev.is_healthy());
    }

    #[test]
    fn test_stats_follow_queue() {
        let h = harness();
        let ioc = Arc::new(IoContext::new());
        for i in 0..8u64 {
            h.dev.aio_write(i * 4096, &pattern(4096, 0), &ioc).unwrap();
        }
        h.dev.aio_submit(&ioc).unwrap();
        ioc.aio_wait();
        let stats = h.dev.get_stats();
        assert!(stats.length_max >= 1);
        assert!(stats.length_mean > 0.0);
    }

    #[test]
    fn test_stall_warning_is_not_fatal() {
        let config = test_config()
            .aio_op_timeout(Duration::from_millis(10))
            .aio_op_suicide_timeout(Duration::ZERO);
        let h = harness_with(MIB, config);
        h.engine.hold_completions(true);
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(4096, 1), &ioc).unwrap();
        h.dev.aio_submit(&ioc).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(h.fatals.lock().unwrap().is_empty());
        assert!(h.dev.is_healthy());
        h.engine.hold_completions(false);
        ioc.aio_wait();
    }

    #[test]
    fn test_fatal_stall_reaches_supervisor() {
        let config = test_config()
            .aio_op_timeout(Duration::from_millis(10))
            .aio_op_suicide_timeout(Duration::from_millis(40));
        let h = harness_with(MIB, config);
        h.engine.hold_completions(true);
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(4096, 1), &ioc).unwrap();
        h.dev.aio_submit(&ioc).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.fatals.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let fatals = h.fatals.lock().unwrap();
        assert_eq!(fatals.len(), 1);
        assert_eq!(fatals[0].0, ErrorKind::Fatal);
        assert!(fatals[0].1.contains("stalled"));
        drop(fatals);
        assert!(!h.dev.is_healthy());
    }

    #[test]
    fn test_close_drains_in_flight() {
        let h = harness();
        h.engine.hold_completions(true);
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(4096, 1), &ioc).unwrap();
        h.dev.aio_submit(&ioc).unwrap();

        let engine = h.engine.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            engine.hold_completions(false);
        });
        h.dev.close().unwrap();
        releaser.join().unwrap();
        assert_eq!(ioc.num_running(), 0);
        assert_eq!(h.dev.ops_in_flight(), 0);
    }

    #[test]
    fn test_close_waits_for_submit_in_kernel() {
        let h = harness();
        h.engine.delay_accept(Duration::from_millis(100));
        let ioc = Arc::new(IoContext::new());
        h.dev.aio_write(0, &pattern(4096, 6), &ioc).unwrap();

        thread::scope(|s| {
            let submitter = s.spawn(|| h.dev.aio_submit(&ioc));
            let deadline = Instant::now() + Duration::from_secs(5);
            while h.engine.submit_calls() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            h.dev.close().unwrap();
            assert!(submitter.join().unwrap().is_ok());
        });

        assert!(ioc.aio_wait_timeout(Duration::from_secs(1)));
        assert_eq!(ioc.num_running(), 0);
        assert_eq!(ioc.take_completed().len(), 1);
        assert_eq!(h.dev.ops_in_flight(), 0);
    }

    #[test]
    fn test_read_huge_length_is_out_of_range() {
        let h = harness();
        assert!(matches!(
            h.dev.read(0, u64::MAX, true),
            Err(BdevError::OutOfRange { .. })
        ));
        assert!(matches!(
            h.dev.read(4096, MIB, false),
            Err(BdevError::OutOfRange { .. })
        ));
        h.dev.close().unwrap();
        assert!(matches!(h.dev.read(0, u64::MAX, true), Err(BdevError::Closed)));
    }

    #[test]
    fn test_closed_device_rejects_io() {
        let h = harness();
        h.dev.close().unwrap();
        h.dev.close().unwrap();
        let ioc = Arc::new(IoContext::new());
        assert!(matches!(h.dev.aio_submit(&ioc), Err(BdevError::Closed)));
        assert!(matches!(h.dev.read(0, 10, true), Err(BdevError::Closed)));
        assert!(matches!(h.dev.discard(0, 4096), Err(BdevError::Closed)));
    }

    #[test]
    fn test_collect_metadata() {
        let h = harness();
        let meta = h.dev.collect_metadata("bdev_");
        assert_eq!(meta["bdev_driver"], "KernelDevice");
        assert_eq!(meta["bdev_backend"], "emulated");
        assert_eq!(meta["bdev_size"], MIB.to_string());
        assert_eq!(meta["bdev_block_size"], "4096");
        assert_eq!(meta["bdev_access_mode"], "file");
        assert_eq!(meta["bdev_type"], "hdd");
        assert_eq!(meta["bdev_support_discard"], "true");
        assert!(meta.contains_key("bdev_path"));
    }

    #[test]
    fn test_default_backend_from_config() {
        // Built from config.backend rather than injected.
        let file = scratch(MIB);
        let dev = KernelDevice::open(file.path(), test_config()).unwrap();
        let ioc = Arc::new(IoContext::new());
        dev.aio_write(4096, &pattern(4096, 8), &ioc).unwrap();
        dev.aio_submit(&ioc).unwrap();
        ioc.aio_wait();
        assert_eq!(dev.read(4096, 4096, false).unwrap(), pattern(4096, 8));
    }
}
