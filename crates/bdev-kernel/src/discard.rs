//! Background discard coalescing.
//!
//! Freed ranges are queued from any thread without blocking; one discard
//! thread per device periodically swaps the whole `queued` set into
//! `finishing` and issues one discard per disjoint range. Adjacent and
//! overlapping ranges queued between two swaps therefore cost a single
//! syscall.
//!
//! ```text
//!  discard(off,len) ──▶ queued ──swap──▶ finishing ──issue──▶ cleared
//!                                                   └─▶ on_finished(&set)
//! ```
//!
//! A range is never in both sets: ranges overlapping `finishing` are
//! trimmed when queued, since the in-progress discard already covers them.

use bdev_core::error::Result;
use bdev_core::interval_set::IntervalSet;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Issues one discard for `(offset, len)`.
pub type DiscardFn = Box<dyn Fn(u64, u64) -> Result<()> + Send>;

/// Told which ranges were just discarded, before they leave `finishing`.
pub type DiscardCallback = Box<dyn Fn(&IntervalSet) + Send + Sync>;

#[derive(Default)]
struct State {
    queued: IntervalSet,
    finishing: IntervalSet,
    stop: bool,
}

pub struct DiscardQueue {
    state: Mutex<State>,
    /// Signals both "work queued" and "batch finished".
    cond: Condvar,
    issued_ranges: AtomicU64,
    issued_bytes: AtomicU64,
    failed_ranges: AtomicU64,
}

impl DiscardQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            issued_ranges: AtomicU64::new(0),
            issued_bytes: AtomicU64::new(0),
            failed_ranges: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut st = self.lock();
        let mut add = IntervalSet::new();
        add.insert(offset, len);
        add.subtract(&st.finishing);
        st.queued.insert_set(&add);
        self.cond.notify_all();
    }

    pub fn queue_set(&self, ranges: &IntervalSet) {
        if ranges.is_empty() {
            return;
        }
        let mut st = self.lock();
        let mut add = ranges.clone();
        add.subtract(&st.finishing);
        st.queued.insert_set(&add);
        self.cond.notify_all();
    }

    /// Block until everything queued so far has been issued.
    pub fn drain(&self) {
        let mut st = self.lock();
        while !st.queued.is_empty() || !st.finishing.is_empty() {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`drain`](Self::drain) with an upper bound. Returns false on timeout.
    pub fn drain_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        while !st.queued.is_empty() || !st.finishing.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .cond
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Ask the discard thread to exit once `queued` is empty.
    pub fn stop(&self) {
        self.lock().stop = true;
        self.cond.notify_all();
    }

    pub fn is_idle(&self) -> bool {
        let st = self.lock();
        st.queued.is_empty() && st.finishing.is_empty()
    }

    /// `(queued, finishing)` at this instant.
    pub fn snapshot(&self) -> (IntervalSet, IntervalSet) {
        let st = self.lock();
        (st.queued.clone(), st.finishing.clone())
    }

    pub fn issued_ranges(&self) -> u64 {
        self.issued_ranges.load(Ordering::Relaxed)
    }

    pub fn issued_bytes(&self) -> u64 {
        self.issued_bytes.load(Ordering::Relaxed)
    }

    pub fn failed_ranges(&self) -> u64 {
        self.failed_ranges.load(Ordering::Relaxed)
    }

    /// Start the discard thread.
    pub fn spawn(
        self: &Arc<Self>,
        issue: DiscardFn,
        on_finished: Option<DiscardCallback>,
    ) -> io::Result<JoinHandle<()>> {
        let queue = Arc::clone(self);
        thread::Builder::new()
            .name("bdev-discard".into())
            .spawn(move || queue.run(issue, on_finished))
    }

    fn run(&self, issue: DiscardFn, on_finished: Option<DiscardCallback>) {
        tracing::debug!("discard thread start");
        let mut st = self.lock();
        loop {
            while st.queued.is_empty() && !st.stop {
                st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
            }
            if st.queued.is_empty() {
                break;
            }

            debug_assert!(st.finishing.is_empty());
            let batch = std::mem::take(&mut st.queued);
            st.finishing = batch.clone();
            drop(st);

            for (offset, len) in batch.iter() {
                match issue(offset, len) {
                    Ok(()) => {
                        self.issued_ranges.fetch_add(1, Ordering::Relaxed);
                        self.issued_bytes.fetch_add(len, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.failed_ranges.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(offset, len, error = %e, "discard failed");
                    }
                }
            }
            if let Some(cb) = &on_finished {
                cb(&batch);
            }

            st = self.lock();
            st.finishing.clear();
            self.cond.notify_all();
        }
        tracing::debug!("discard thread exit");
    }
}

impl Default for DiscardQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdev_core::error::BdevError;
    use nix::errno::Errno;

    type Issued = Arc<Mutex<Vec<(u64, u64)>>>;

    fn recorder() -> (Issued, DiscardFn) {
        let issued: Issued = Arc::new(Mutex::new(Vec::new()));
        let log = issued.clone();
        let f: DiscardFn = Box::new(move |off, len| {
            log.lock().unwrap().push((off, len));
            Ok(())
        });
        (issued, f)
    }

    fn stop_and_join(q: &DiscardQueue, h: JoinHandle<()>) {
        q.stop();
        h.join().unwrap();
    }

    #[test]
    fn test_adjacent_ranges_coalesce() {
        let q = Arc::new(DiscardQueue::new());
        q.queue(0, 100);
        q.queue(100, 100);
        let (issued, f) = recorder();
        let h = q.spawn(f, None).unwrap();
        q.drain();
        assert_eq!(*issued.lock().unwrap(), vec![(0, 200)]);
        assert_eq!(q.issued_bytes(), 200);
        stop_and_join(&q, h);
    }

    #[test]
    fn test_disjoint_ranges_issued_separately() {
        let q = Arc::new(DiscardQueue::new());
        let mut set = IntervalSet::new();
        set.insert(4096, 4096);
        set.insert(0, 1024);
        q.queue_set(&set);
        let (issued, f) = recorder();
        let h = q.spawn(f, None).unwrap();
        q.drain();
        assert_eq!(*issued.lock().unwrap(), vec![(0, 1024), (4096, 4096)]);
        stop_and_join(&q, h);
    }

    #[test]
    fn test_queued_and_finishing_disjoint() {
        let q = Arc::new(DiscardQueue::new());
        q.queue(0, 200);
        let inner = q.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let first = std::sync::atomic::AtomicBool::new(true);
        let f: DiscardFn = Box::new(move |off, len| {
            // Re-queue an overlapping range while [0,200) is finishing.
            if first.swap(false, Ordering::SeqCst) {
                inner.queue(50, 300);
            }
            let (queued, finishing) = inner.snapshot();
            s.lock().unwrap().push((off, len, queued.intersects_set(&finishing)));
            Ok(())
        });
        let h = q.spawn(f, None).unwrap();
        q.drain();
        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|&(_, _, overlap)| !overlap));
        // The overlap was trimmed to [200,350) for the second batch.
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[1].0, seen[1].1), (200, 150));
        drop(seen);
        stop_and_join(&q, h);
    }

    #[test]
    fn test_failure_logged_and_skipped() {
        let q = Arc::new(DiscardQueue::new());
        q.queue(0, 512);
        q.queue(4096, 512);
        let f: DiscardFn = Box::new(|off, _| {
            if off == 0 {
                Err(BdevError::Io { op: "discard", errno: Errno::EOPNOTSUPP })
            } else {
                Ok(())
            }
        });
        let h = q.spawn(f, None).unwrap();
        q.drain();
        assert_eq!(q.failed_ranges(), 1);
        assert_eq!(q.issued_ranges(), 1);
        stop_and_join(&q, h);
    }

    #[test]
    fn test_callback_sees_finished_set() {
        let q = Arc::new(DiscardQueue::new());
        q.queue(8192, 4096);
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        let cb: DiscardCallback = Box::new(move |set| {
            g.lock().unwrap().extend(set.iter());
        });
        let (_, f) = recorder();
        let h = q.spawn(f, Some(cb)).unwrap();
        q.drain();
        assert_eq!(*got.lock().unwrap(), vec![(8192, 4096)]);
        stop_and_join(&q, h);
    }

    #[test]
    fn test_stop_drains_queued() {
        let q = Arc::new(DiscardQueue::new());
        let (issued, f) = recorder();
        for i in 0..32 {
            q.queue(i * 8192, 4096);
        }
        let h = q.spawn(f, None).unwrap();
        stop_and_join(&q, h);
        assert_eq!(issued.lock().unwrap().len(), 32);
        assert!(q.is_idle());
    }

    #[test]
    fn test_drain_timeout_without_thread() {
        let q = DiscardQueue::new();
        assert!(q.drain_timeout(Duration::from_millis(1)));
        q.queue(0, 1);
        assert!(!q.drain_timeout(Duration::from_millis(5)));
    }
}
