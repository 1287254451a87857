//! `EmulatedEngine` — in-process `AioEngine` for tests.
//!
//! Performs each accepted request synchronously with `pread`/`pwrite` at
//! submit time and parks the resulting event in a bounded lock-free queue
//! of `depth` slots until `get_events` collects it. Behaves like a kernel
//! context that completes instantly, unless told otherwise:
//!
//! | Knob                      | Effect                                          |
//! |---------------------------|-------------------------------------------------|
//! | `inject_backpressure(n)`  | next `n` submit calls return `EAGAIN`           |
//! | `fail_next_submit(errno)` | next submit call fails hard with `errno`        |
//! | `limit_accept(n)`         | each submit call accepts at most `n` requests   |
//! | `fail_next_completion(e)` | next accepted request completes with `-e`       |
//! | `hold_completions(true)`  | completions are withheld (a hung device)        |
//! | `interrupt_next_wait()`   | next `get_events` returns `EINTR`               |
//! | `delay_accept(d)`         | submit sleeps `d` before taking any request     |
//! | `linger_after_submit(d)`  | submit sleeps `d` after completing, then returns |
//!
//! Every call is counted so tests can assert how often the kernel would have
//! been entered.

use bdev_core::engine::AioEngine;
use bdev_core::op::{AioOpcode, IoEvent, IoRequest};

use crossbeam_queue::ArrayQueue;
use nix::errno::Errno;
use nix::sys::uio::{pread, pwrite};
use std::os::unix::io::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_micros(200);

pub struct EmulatedEngine {
    depth: usize,
    ready: ArrayQueue<IoEvent>,
    held: Mutex<Vec<IoEvent>>,
    /// Accepted and not yet returned by `get_events`.
    inflight: AtomicUsize,

    backpressure: AtomicU32,
    fail_submit: AtomicI32,
    accept_limit: AtomicUsize,
    fail_completion: AtomicI32,
    hold: AtomicBool,
    accept_delay_ns: AtomicU64,
    linger_ns: AtomicU64,
    interrupt: AtomicBool,

    submit_calls: AtomicUsize,
    get_events_calls: AtomicUsize,
}

impl EmulatedEngine {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            ready: ArrayQueue::new(depth),
            held: Mutex::new(Vec::new()),
            inflight: AtomicUsize::new(0),
            backpressure: AtomicU32::new(0),
            fail_submit: AtomicI32::new(0),
            accept_limit: AtomicUsize::new(0),
            fail_completion: AtomicI32::new(0),
            hold: AtomicBool::new(false),
            accept_delay_ns: AtomicU64::new(0),
            linger_ns: AtomicU64::new(0),
            interrupt: AtomicBool::new(false),
            submit_calls: AtomicUsize::new(0),
            get_events_calls: AtomicUsize::new(0),
        }
    }

    // ── Fault injection ──

    /// Reject the next `calls` submit calls with `EAGAIN`. `u32::MAX` means
    /// for the foreseeable future.
    pub fn inject_backpressure(&self, calls: u32) {
        self.backpressure.store(calls, Ordering::Release);
    }

    pub fn fail_next_submit(&self, errno: Errno) {
        self.fail_submit.store(errno as i32, Ordering::Release);
    }

    /// Accept at most `n` requests per submit call. Zero removes the limit.
    pub fn limit_accept(&self, n: usize) {
        self.accept_limit.store(n, Ordering::Release);
    }

    pub fn fail_next_completion(&self, errno: Errno) {
        self.fail_completion.store(errno as i32, Ordering::Release);
    }

    /// While holding, completed requests are kept back from `get_events`.
    /// Releasing makes every held event visible.
    pub fn hold_completions(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
        if !hold {
            let held = std::mem::take(&mut *self.held.lock().unwrap_or_else(|e| e.into_inner()));
            for ev in held {
                self.park(ev);
            }
        }
    }

    /// Every submit call sleeps `d` before looking at its requests.
    pub fn delay_accept(&self, d: Duration) {
        self.accept_delay_ns.store(d.as_nanos() as u64, Ordering::Release);
    }

    /// Every submit call sleeps `d` after its requests have completed and
    /// become visible to `get_events`, as if the submitting thread were
    /// preempted on the way out of the kernel.
    pub fn linger_after_submit(&self, d: Duration) {
        self.linger_ns.store(d.as_nanos() as u64, Ordering::Release);
    }

    fn pause(ns: &AtomicU64) {
        let ns = ns.load(Ordering::Acquire);
        if ns > 0 {
            thread::sleep(Duration::from_nanos(ns));
        }
    }

    pub fn interrupt_next_wait(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    // ── Counters ──

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::Acquire)
    }

    pub fn get_events_calls(&self) -> usize {
        self.get_events_calls.load(Ordering::Acquire)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    fn park(&self, ev: IoEvent) {
        // `inflight` never exceeds `depth`, so the queue has room; if it
        // somehow does not, keep the event rather than lose it.
        if let Err(ev) = self.ready.push(ev) {
            self.held.lock().unwrap_or_else(|e| e.into_inner()).push(ev);
        }
    }

    fn execute(req: &IoRequest) -> i64 {
        // Safety: the descriptor is owned by the device and outlives every
        // in-flight request; the buffer belongs to the boxed op.
        let fd = unsafe { BorrowedFd::borrow_raw(req.fd) };
        let offset = req.offset as libc::off_t;
        let res = match req.opcode {
            AioOpcode::Read => {
                let buf = unsafe { std::slice::from_raw_parts_mut(req.buf, req.len) };
                pread(fd, buf, offset)
            }
            AioOpcode::Write => {
                let buf = unsafe { std::slice::from_raw_parts(req.buf as *const u8, req.len) };
                pwrite(fd, buf, offset)
            }
        };
        match res {
            Ok(n) => n as i64,
            Err(e) => -(e as i64),
        }
    }
}

impl AioEngine for EmulatedEngine {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn submit(&self, reqs: &[IoRequest]) -> Result<usize, Errno> {
        self.submit_calls.fetch_add(1, Ordering::AcqRel);
        if reqs.is_empty() {
            return Ok(0);
        }
        Self::pause(&self.accept_delay_ns);

        let pressured = self
            .backpressure
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if pressured {
            return Err(Errno::EAGAIN);
        }
        let hard = self.fail_submit.swap(0, Ordering::AcqRel);
        if hard != 0 {
            return Err(Errno::from_raw(hard));
        }

        let room = self.depth.saturating_sub(self.inflight());
        let limit = match self.accept_limit.load(Ordering::Acquire) {
            0 => usize::MAX,
            n => n,
        };
        let n = reqs.len().min(room).min(limit);
        if n == 0 {
            return Err(Errno::EAGAIN);
        }

        for req in &reqs[..n] {
            let mut result = Self::execute(req);
            let injected = self.fail_completion.swap(0, Ordering::AcqRel);
            if injected != 0 {
                result = -(injected as i64);
            }
            self.inflight.fetch_add(1, Ordering::AcqRel);
            let ev = IoEvent {
                token: req.token,
                result,
            };
            if self.hold.load(Ordering::Acquire) {
                self.held.lock().unwrap_or_else(|e| e.into_inner()).push(ev);
            } else {
                self.park(ev);
            }
        }
        Self::pause(&self.linger_ns);
        Ok(n)
    }

    fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> Result<usize, Errno> {
        self.get_events_calls.fetch_add(1, Ordering::AcqRel);
        if self.interrupt.swap(false, Ordering::AcqRel) {
            return Err(Errno::EINTR);
        }

        let deadline = Instant::now() + timeout;
        let mut n = 0;
        loop {
            while n < events.len() {
                match self.ready.pop() {
                    Some(ev) => {
                        events[n] = ev;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n >= min.min(events.len()) && (n > 0 || min == 0) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
        self.inflight.fetch_sub(n, Ordering::AcqRel);
        Ok(n)
    }

    fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdev_core::buffer::AlignedBuf;
    use std::os::unix::io::AsRawFd;

    fn request(fd: i32, token: u64, opcode: AioOpcode, buf: &mut AlignedBuf, offset: u64) -> IoRequest {
        IoRequest {
            token,
            fd,
            opcode,
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            offset,
        }
    }

    #[test]
    fn test_write_read() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(8192).unwrap();
        let fd = file.as_raw_fd();
        let engine = EmulatedEngine::new(4);

        let mut w = AlignedBuf::copy_from(&[9u8; 512], 512);
        assert_eq!(engine.submit(&[request(fd, 1, AioOpcode::Write, &mut w, 512)]), Ok(1));
        let mut r = AlignedBuf::zeroed(512, 512);
        assert_eq!(engine.submit(&[request(fd, 2, AioOpcode::Read, &mut r, 512)]), Ok(1));
        assert_eq!(engine.inflight(), 2);

        let mut events = [IoEvent::EMPTY; 8];
        let n = engine.get_events(1, &mut events, Duration::from_millis(100)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(events[0], IoEvent { token: 1, result: 512 });
        assert_eq!(events[1], IoEvent { token: 2, result: 512 });
        assert!(r.iter().all(|&b| b == 9));
        assert_eq!(engine.inflight(), 0);
    }

    #[test]
    fn test_backpressure_counts_calls() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let engine = EmulatedEngine::new(4);
        engine.inject_backpressure(2);
        let mut b = AlignedBuf::zeroed(512, 512);
        let req = request(file.as_raw_fd(), 1, AioOpcode::Read, &mut b, 0);

        assert_eq!(engine.submit(&[req]), Err(Errno::EAGAIN));
        assert_eq!(engine.submit(&[req]), Err(Errno::EAGAIN));
        assert_eq!(engine.submit(&[req]), Ok(1));
        assert_eq!(engine.submit_calls(), 3);
    }

    #[test]
    fn test_depth_limits_accept() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let fd = file.as_raw_fd();
        let engine = EmulatedEngine::new(2);
        let mut bufs: Vec<AlignedBuf> = (0..3).map(|_| AlignedBuf::zeroed(512, 512)).collect();
        let reqs: Vec<IoRequest> = bufs
            .iter_mut()
            .enumerate()
            .map(|(i, b)| request(fd, i as u64, AioOpcode::Read, b, 0))
            .collect();

        assert_eq!(engine.submit(&reqs), Ok(2));
        assert_eq!(engine.submit(&reqs[2..]), Err(Errno::EAGAIN));

        engine.limit_accept(1);
        let mut events = [IoEvent::EMPTY; 4];
        engine.get_events(2, &mut events, Duration::from_millis(50)).unwrap();
        assert_eq!(engine.submit(&reqs[..2]), Ok(1));
    }

    #[test]
    fn test_fail_next_completion() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let engine = EmulatedEngine::new(4);
        engine.fail_next_completion(Errno::EIO);
        let mut b = AlignedBuf::zeroed(512, 512);
        engine
            .submit(&[request(file.as_raw_fd(), 5, AioOpcode::Read, &mut b, 0)])
            .unwrap();
        let mut events = [IoEvent::EMPTY; 1];
        engine.get_events(1, &mut events, Duration::from_millis(50)).unwrap();
        assert_eq!(events[0].result, -(libc::EIO as i64));
    }

    #[test]
    fn test_hold_and_release() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let engine = EmulatedEngine::new(4);
        engine.hold_completions(true);
        let mut b = AlignedBuf::zeroed(512, 512);
        engine
            .submit(&[request(file.as_raw_fd(), 5, AioOpcode::Read, &mut b, 0)])
            .unwrap();

        let mut events = [IoEvent::EMPTY; 1];
        assert_eq!(engine.get_events(1, &mut events, Duration::from_millis(5)), Ok(0));
        engine.hold_completions(false);
        assert_eq!(engine.get_events(1, &mut events, Duration::from_millis(5)), Ok(1));
        assert_eq!(events[0].token, 5);
    }

    #[test]
    fn test_interrupt() {
        let engine = EmulatedEngine::new(1);
        engine.interrupt_next_wait();
        let mut events = [IoEvent::EMPTY; 1];
        assert_eq!(
            engine.get_events(1, &mut events, Duration::from_millis(1)),
            Err(Errno::EINTR)
        );
        assert_eq!(engine.get_events(1, &mut events, Duration::from_millis(1)), Ok(0));
        assert_eq!(engine.get_events_calls(), 2);
    }
}
