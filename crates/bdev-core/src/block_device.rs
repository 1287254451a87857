//! The block-device capability contract.
//!
//! This is everything the allocator / extent-map layer may ask of a
//! device. Offsets and lengths are bytes. Asynchronous ops are staged on an
//! [`IoContext`] with `aio_read` / `aio_write` and sent with `aio_submit`;
//! their results come back through the context, never as errors from the
//! submitting call.
//!
//! Backends (kernel AIO, io_uring, emulation) are chosen when the device is
//! opened, not by implementing this trait again.

use crate::config::DeviceConfig;
use crate::error::Result;
use crate::interval_set::IntervalSet;
use crate::io_context::IoContext;
use crate::metrics::AioQueueStats;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub trait BlockDevice: Send + Sync {
    /// Open the device at `path` and start its background threads.
    fn open(path: &Path, config: DeviceConfig) -> Result<Self>
    where
        Self: Sized;

    /// Stop background threads, drain outstanding work, release descriptors.
    /// Idempotent.
    fn close(&self) -> Result<()>;

    /// Usable size in bytes (a multiple of the block size).
    fn get_size(&self) -> u64;

    fn get_block_size(&self) -> u64;

    /// False once any completion has failed; stays false until reopened.
    fn is_healthy(&self) -> bool;

    /// Kernel device name (`sda`, `nvme0n1`) for block devices.
    fn get_devname(&self) -> Option<String>;

    fn get_stats(&self) -> Arc<AioQueueStats>;

    /// Descriptive key/value pairs, each key prefixed with `prefix`.
    fn collect_metadata(&self, prefix: &str) -> BTreeMap<String, String>;

    // ── Synchronous I/O ──

    /// Read `len` bytes at `offset`. Any byte range is accepted.
    fn read(&self, offset: u64, len: u64, buffered: bool) -> Result<Vec<u8>>;

    /// Read `buf.len()` bytes at `offset` into `buf`. Any byte range is accepted.
    fn read_random(&self, offset: u64, buf: &mut [u8], buffered: bool) -> Result<()>;

    /// Write `data` at `offset`. Must be block-aligned unless `buffered`.
    fn write(&self, offset: u64, data: &[u8], buffered: bool) -> Result<()>;

    /// Make every write since the previous flush durable.
    fn flush(&self) -> Result<()>;

    /// Drop cached pages of the buffered descriptor for the range.
    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()>;

    // ── Asynchronous I/O ──

    /// Stage a block-aligned read on `ioc`.
    fn aio_read(&self, offset: u64, len: u64, ioc: &IoContext) -> Result<()>;

    /// Stage a block-aligned write of `data` on `ioc`.
    fn aio_write(&self, offset: u64, data: &[u8], ioc: &IoContext) -> Result<()>;

    /// Send every staged op on `ioc` to the kernel. Never waits for completion.
    fn aio_submit(&self, ioc: &Arc<IoContext>) -> Result<()>;

    // ── Discard ──

    /// Queue a range for discard. Never blocks on the discard itself.
    fn discard(&self, offset: u64, len: u64) -> Result<()>;

    /// Queue every range in `ranges` for discard.
    fn queue_discard(&self, ranges: &IntervalSet) -> Result<()>;

    /// Block until every discard queued so far has been issued.
    fn discard_drain(&self);
}
