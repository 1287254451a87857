//! Asynchronous operation types.
//!
//! `AioOp` is the unit every component hands around: the device builds it,
//! the AIO queue turns it into an [`IoRequest`] for the engine, the engine
//! reports an [`IoEvent`], and the completion thread writes the result back
//! into the op before returning it to its `IoContext`.
//!
//! ```text
//!   Unsubmitted ──aio_submit──▶ Queued ──completion thread──▶ Completed
//! ```

use crate::buffer::AlignedBuf;
use crate::stall::StallLink;

use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioOpcode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioState {
    Unsubmitted,
    Queued,
    Completed,
}

/// One asynchronous read or write.
#[derive(Debug)]
pub struct AioOp {
    /// Target descriptor (the device's direct descriptor).
    pub fd: RawFd,
    pub offset: u64,
    pub opcode: AioOpcode,
    /// Source data for writes, destination for reads. `buf.len()` is the
    /// transfer length.
    pub buf: AlignedBuf,
    /// Kernel return value: bytes transferred, or negative errno.
    pub result: i64,
    /// Position in the device's stall tracker while queued.
    pub link: Option<StallLink>,
    state: AioState,
}

impl AioOp {
    pub fn new(fd: RawFd, offset: u64, opcode: AioOpcode, buf: AlignedBuf) -> Self {
        Self {
            fd,
            offset,
            opcode,
            buf,
            result: 0,
            link: None,
            state: AioState::Unsubmitted,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn state(&self) -> AioState {
        self.state
    }

    pub fn mark_queued(&mut self) {
        debug_assert_eq!(self.state, AioState::Unsubmitted, "aio op submitted twice");
        self.state = AioState::Queued;
    }

    /// Return a queued op that the kernel never accepted to the unsubmitted state.
    pub fn mark_unsubmitted(&mut self) {
        debug_assert_eq!(self.state, AioState::Queued);
        self.link = None;
        self.state = AioState::Unsubmitted;
    }

    pub fn mark_completed(&mut self, result: i64) {
        debug_assert_eq!(self.state, AioState::Queued, "aio op completed while not queued");
        self.result = result;
        self.link = None;
        self.state = AioState::Completed;
    }

    /// True when the kernel reported an error or transferred fewer bytes
    /// than requested.
    pub fn failed(&self) -> bool {
        self.result < 0 || self.result as usize != self.buf.len()
    }

    /// Data of a completed read.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Build the engine request for this op. `token` is handed back
    /// unchanged in the matching [`IoEvent`].
    pub fn request(&mut self, token: u64) -> IoRequest {
        IoRequest {
            token,
            fd: self.fd,
            opcode: self.opcode,
            buf: self.buf.as_mut_ptr(),
            len: self.buf.len(),
            offset: self.offset,
        }
    }
}

/// Engine-level view of an op: raw pointer and length, no ownership.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest {
    pub token: u64,
    pub fd: RawFd,
    pub opcode: AioOpcode,
    pub buf: *mut u8,
    pub len: usize,
    pub offset: u64,
}

// Safety: the pointed-to buffer is owned by a boxed AioOp that stays alive
// until the matching completion is reaped.
unsafe impl Send for IoRequest {}
unsafe impl Sync for IoRequest {}

/// A completed request as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub token: u64,
    /// Bytes transferred, or negative errno.
    pub result: i64,
}

impl IoEvent {
    pub const EMPTY: Self = Self { token: 0, result: 0 };
}
