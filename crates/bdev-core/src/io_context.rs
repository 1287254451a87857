//! Caller-owned batch of asynchronous operations.
//!
//! A submitter fills an `IoContext` through `aio_read` / `aio_write`, then
//! hands it to `aio_submit`. The completion thread returns each finished op
//! to the context; when the last running op comes back it runs the
//! completion closure (if any) and wakes threads blocked in `aio_wait`.
//!
//! ```text
//!  submitter                     completion thread
//!  ─────────                     ─────────────────
//!  push_pending(op) ×N
//!  take_pending() ──▶ kernel
//!                                complete(op) ×N
//!                                  last one → on_complete(&ctx), wake
//!  aio_wait() / take_completed()
//! ```
//!
//! The closure runs on the completion thread and must not block. When a
//! submission is only partly accepted and the accepted part finishes first,
//! it runs on the submitter instead, from `restore_pending`.

use crate::op::AioOp;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub type CompletionFn = Box<dyn Fn(&IoContext) + Send + Sync>;

pub struct IoContext {
    pending: Mutex<Vec<AioOp>>,
    completed: Mutex<Vec<AioOp>>,
    num_pending: AtomicUsize,
    num_running: AtomicUsize,
    /// First negative result seen, 0 if none.
    error: AtomicI64,
    on_complete: Option<CompletionFn>,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
}

impl IoContext {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Context whose `f` runs once every submitted op has completed. That
    /// is normally on the completion thread; see
    /// [`restore_pending`](Self::restore_pending) for the exception.
    pub fn with_callback<F>(f: F) -> Self
    where
        F: Fn(&IoContext) + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(f)))
    }

    fn build(on_complete: Option<CompletionFn>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            num_pending: AtomicUsize::new(0),
            num_running: AtomicUsize::new(0),
            error: AtomicI64::new(0),
            on_complete,
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
        }
    }

    // ── Submission side ──

    pub fn push_pending(&self, op: AioOp) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(op);
        self.num_pending.store(pending.len(), Ordering::Release);
    }

    /// Move every pending op out and count them as running.
    pub fn take_pending(&self) -> Vec<AioOp> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let ops = std::mem::take(&mut *pending);
        self.num_pending.store(0, Ordering::Release);
        self.num_running.fetch_add(ops.len(), Ordering::AcqRel);
        ops
    }

    /// Put ops the kernel never accepted back at the front of the pending list.
    ///
    /// `accepted` is how many ops of the same submission the kernel did
    /// take. If those have all completed already, the completion closure
    /// runs here, on the calling thread, since no later completion will
    /// run it.
    pub fn restore_pending(&self, ops: Vec<AioOp>, accepted: usize) {
        if ops.is_empty() {
            return;
        }
        let n = ops.len();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let later = std::mem::replace(&mut *pending, ops);
        pending.extend(later);
        self.num_pending.store(pending.len(), Ordering::Release);
        drop(pending);
        if self.num_running.fetch_sub(n, Ordering::AcqRel) != n {
            return;
        }
        if accepted > 0 {
            if let Some(f) = &self.on_complete {
                f(self);
            }
        }
        let _guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wait_cond.notify_all();
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending.load(Ordering::Acquire)
    }

    pub fn num_running(&self) -> usize {
        self.num_running.load(Ordering::Acquire)
    }

    pub fn has_pending_aios(&self) -> bool {
        self.num_pending() > 0
    }

    // ── Completion side ──

    /// Return a finished op. Called only by the completion thread.
    ///
    /// Returns true when this was the last running op.
    pub fn complete(&self, op: AioOp) -> bool {
        if op.result < 0 {
            let _ = self
                .error
                .compare_exchange(0, op.result, Ordering::AcqRel, Ordering::Acquire);
        }
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);

        if self.num_running.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        if let Some(f) = &self.on_complete {
            f(self);
        }
        let _guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wait_cond.notify_all();
        true
    }

    /// Block until no op is running.
    pub fn aio_wait(&self) {
        let mut guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.num_running() > 0 {
            guard = self.wait_cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`aio_wait`](Self::aio_wait) with an upper bound. Returns false on timeout.
    pub fn aio_wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, res) = self
            .wait_cond
            .wait_timeout_while(guard, timeout, |_| self.num_running() > 0)
            .unwrap_or_else(|e| e.into_inner());
        !res.timed_out()
    }

    /// Drain completed ops (in completion order).
    pub fn take_completed(&self) -> Vec<AioOp> {
        std::mem::take(&mut *self.completed.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// First error reported by a completed op, or 0.
    pub fn return_value(&self) -> i64 {
        self.error.load(Ordering::Acquire)
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("num_pending", &self.num_pending())
            .field("num_running", &self.num_running())
            .field("error", &self.return_value())
            .finish()
    }
}
