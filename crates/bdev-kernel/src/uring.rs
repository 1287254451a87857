//! `IoUringEngine` — io_uring `AioEngine` implementation.
//!
//! Wraps the `io-uring` crate. Submitters push READ/WRITE SQEs under the SQ
//! lock and call `io_uring_enter()`; the completion thread waits with a
//! timeout and drains the CQ. No SQPOLL, no fixed files, no fixed buffers.
//!
//! A full submission queue is reported as a partial accept (or `EAGAIN`
//! when nothing fit), which the AIO queue retries exactly like libaio
//! backpressure.

use bdev_core::engine::AioEngine;
use bdev_core::error::{BdevError, Result};
use bdev_core::op::{AioOpcode, IoEvent, IoRequest};

use io_uring::{opcode, squeue, types, IoUring, Probe};
use nix::errno::Errno;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct IoUringEngine {
    ring: IoUring,
    /// Serializes access to the SQ ring memory. Never held across a wait.
    sq_lock: Mutex<()>,
    depth: usize,
    /// Last CQ overflow count seen by the completion thread.
    cq_overflow: AtomicU32,
}

// Safety: SQ access is serialized by `sq_lock`; the CQ is only touched by
// the single completion thread calling `get_events`.
unsafe impl Send for IoUringEngine {}
unsafe impl Sync for IoUringEngine {}

impl IoUringEngine {
    /// Build a ring with `depth` SQ entries (rounded up to a power of two
    /// by the kernel) and check READ/WRITE support.
    ///
    /// SQ slots free up as soon as the kernel consumes them, so the ring
    /// itself does not bound ops in flight; `AioQueue` caps them at
    /// `depth()`, which keeps the CQ (twice as large) from overflowing.
    pub fn new(depth: usize) -> Result<Self> {
        let entries = depth.next_power_of_two().min(u32::MAX as usize) as u32;
        let ring = IoUring::builder()
            .setup_cqsize(entries.saturating_mul(2))
            .build(entries)
            .map_err(|e| BdevError::Resource {
                what: "io_uring instances",
                errno: Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
            })?;

        let mut probe = Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(|e| BdevError::Config(format!("io_uring probe failed: {}", e)))?;
        if !probe.is_supported(opcode::Read::CODE) || !probe.is_supported(opcode::Write::CODE) {
            return Err(BdevError::Config(
                "io_uring lacks READ/WRITE support (kernel < 5.6)".into(),
            ));
        }

        let depth = ring.params().sq_entries() as usize;
        tracing::debug!(depth, "io_uring ready");
        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            depth,
            cq_overflow: AtomicU32::new(0),
        })
    }

    /// Translate a request to an SQE. `user_data` carries the token.
    fn build_sqe(req: &IoRequest) -> squeue::Entry {
        let fd = types::Fd(req.fd);
        let sqe = match req.opcode {
            AioOpcode::Read => opcode::Read::new(fd, req.buf, req.len as u32)
                .offset(req.offset)
                .build(),
            AioOpcode::Write => opcode::Write::new(fd, req.buf as *const u8, req.len as u32)
                .offset(req.offset)
                .build(),
        };
        sqe.user_data(req.token)
    }
}

impl AioEngine for IoUringEngine {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn submit(&self, reqs: &[IoRequest]) -> std::result::Result<usize, Errno> {
        if reqs.is_empty() {
            return Ok(0);
        }
        let _guard = self.sq_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut pushed = 0;
        {
            // Safety: `sq_lock` makes this the only live SQ handle.
            let mut sq = unsafe { self.ring.submission_shared() };
            for req in reqs {
                let sqe = Self::build_sqe(req);
                // Safety: the buffer stays valid until the CQE is reaped.
                if unsafe { sq.push(&sqe) }.is_err() {
                    break;
                }
                pushed += 1;
            }
            // Dropping `sq` publishes the new tail.
        }
        if pushed == 0 {
            return Err(Errno::EAGAIN);
        }

        // Once published, the SQEs belong to the kernel even if the enter
        // fails; a later enter (including the completion thread's wait)
        // picks them up.
        match self.ring.submit() {
            Ok(_) => {}
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::EINTR) => {}
                other => {
                    tracing::warn!(errno = ?other, pushed, "io_uring_enter failed after push");
                }
            },
        }
        Ok(pushed)
    }

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> std::result::Result<usize, Errno> {
        let mut n = self.drain_cq(events);
        if n >= min || n == events.len() {
            return Ok(n);
        }

        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(min - n, &args) {
            Ok(_) => {}
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EBUSY) => {}
                Some(code) => return Err(Errno::from_raw(code)),
                None => return Err(Errno::EIO),
            },
        }
        n += self.drain_cq(&mut events[n..]);
        Ok(n)
    }

    fn depth(&self) -> usize {
        self.depth
    }
}

impl IoUringEngine {
    fn drain_cq(&self, events: &mut [IoEvent]) -> usize {
        // Safety: only the completion thread reads the CQ.
        let cq = unsafe { self.ring.completion_shared() };
        let overflow = cq.overflow();
        let seen = self.cq_overflow.swap(overflow, Ordering::Relaxed);
        if overflow != seen {
            tracing::warn!(
                overflow,
                new = overflow.wrapping_sub(seen),
                "io_uring completion queue overflowed"
            );
        }
        let mut count = 0;
        for (dst, cqe) in events.iter_mut().zip(cq) {
            *dst = IoEvent {
                token: cqe.user_data(),
                result: cqe.result() as i64,
            };
            count += 1;
        }
        count
    }
}
