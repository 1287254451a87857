//! Kernel AIO engine abstraction.
//!
//! An `AioEngine` is the thinnest possible wrapper around one kernel
//! asynchronous-I/O interface: hand it requests, collect completion events.
//! Retry, backoff and in-flight accounting live one level up in the AIO
//! queue, so every engine stays a direct translation of its syscalls.
//!
//! # Implementors
//!
//! - `LibAioEngine` (default): Linux native AIO via `io_setup(2)`,
//!   `io_submit(2)`, `io_getevents(2)`. Works on every kernel; only truly
//!   asynchronous with `O_DIRECT`.
//!
//! - `IoUringEngine`: io_uring. A full submission queue shows up as a
//!   partial accept, which the AIO queue retries like any other.
//!
//! - `EmulatedEngine` (testing): performs the I/O synchronously with
//!   `pread`/`pwrite` at submit time and parks the completions in a bounded
//!   queue. Supports fault injection.

use crate::op::{IoEvent, IoRequest};

use nix::errno::Errno;
use std::sync::Arc;
use std::time::Duration;

/// Raw submission and completion for one kernel AIO context.
///
/// **Contract:**
/// - `submit()` never blocks waiting for I/O. It returns how many of the
///   leading requests the kernel accepted (at least one when `Ok`), or
///   `Err(EAGAIN)` when the kernel is out of queue slots. Any other error
///   means nothing from this call was accepted.
/// - Every accepted request produces exactly one [`IoEvent`] carrying its
///   `token`.
/// - `get_events()` waits up to `timeout` for at least `min` events and
///   fills at most `events.len()`. Returns `Ok(0)` on timeout and
///   `Err(EINTR)` on a signal.
/// - `submit()` may be called from many threads at once; `get_events()` is
///   called from exactly one.
pub trait AioEngine: Send + Sync {
    /// Short name for logs and metadata.
    fn name(&self) -> &'static str;

    fn submit(&self, reqs: &[IoRequest]) -> Result<usize, Errno>;

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> Result<usize, Errno>;

    /// Maximum number of requests the context can hold in flight.
    fn depth(&self) -> usize;
}

/// Lets a caller keep a handle on the engine it gave away, e.g. to drive
/// fault injection from a test.
impl<E: AioEngine + ?Sized> AioEngine for Arc<E> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn submit(&self, reqs: &[IoRequest]) -> Result<usize, Errno> {
        (**self).submit(reqs)
    }

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> Result<usize, Errno> {
        (**self).get_events(min, events, timeout)
    }

    fn depth(&self) -> usize {
        (**self).depth()
    }
}
