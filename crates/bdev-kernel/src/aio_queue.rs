//! `AioQueue` — in-flight accounting and backpressure over an `AioEngine`.
//!
//! ```text
//!   submitters ──submit/submit_batch──▶ AioQueue ──▶ engine ──▶ kernel
//!                                        │  ops_in_flight += offered  (before the call)
//!                                        │  ops_in_flight -= refused  (after the call)
//!   completion thread ◀─get_next_completed┘  ops_in_flight -= reaped
//! ```
//!
//! Ops are counted before they reach the engine, so an op the kernel
//! completes before `submit` returns is never reaped uncounted and
//! `ops_in_flight == submitted - completed` holds at every instant. The
//! count is also capped at the engine depth; a full queue is treated like
//! `EAGAIN`.
//!
//! `EAGAIN` from the engine is transient: the queue sleeps on an
//! exponential schedule and retries. Nothing above this module ever sees
//! backpressure unless the schedule is exhausted.

use bdev_core::engine::AioEngine;
use bdev_core::error::{BdevError, Result};
use bdev_core::op::{IoEvent, IoRequest};

use nix::errno::Errno;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Exponential retry schedule for `EAGAIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry; doubles for every retry after it.
    pub initial: Duration,
    pub max_retries: u32,
}

impl BackoffPolicy {
    /// Single-op submission: 16 retries, about 8s of sleeping.
    pub const SINGLE: Self = Self {
        initial: Duration::from_micros(125),
        max_retries: 16,
    };

    /// Batch submission: 19 retries, about 64s of sleeping.
    pub const BATCH: Self = Self {
        initial: Duration::from_micros(125),
        max_retries: 19,
    };

    /// Sleep before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.initial.saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
    }

    /// Total sleep across the first `retries` retries: `initial·(2^k − 1)`.
    pub fn cumulative_delay(&self, retries: u32) -> Duration {
        let factor = 1u64
            .checked_shl(retries)
            .map(|v| v - 1)
            .unwrap_or(u64::MAX);
        let nanos = (self.initial.as_nanos() as u64).saturating_mul(factor);
        Duration::from_nanos(nanos)
    }
}

/// Result of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: usize,
    /// `EAGAIN` retries it took.
    pub retries: u32,
}

/// One reap of the completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionBatch {
    pub count: usize,
    /// `ops_in_flight` just before this batch was subtracted.
    pub queue_length: u64,
    /// Time since the previous queue event (first submit or last reap).
    pub latency: Duration,
}

pub struct AioQueue {
    engine: Box<dyn AioEngine>,
    single: BackoffPolicy,
    batch: BackoffPolicy,
    /// Offered to or accepted by the engine, not yet reaped.
    ops_in_flight: AtomicU64,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last queue event.
    last_op_ns: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl AioQueue {
    pub fn new(engine: Box<dyn AioEngine>) -> Self {
        Self::with_backoff(engine, BackoffPolicy::SINGLE, BackoffPolicy::BATCH)
    }

    pub fn with_backoff(
        engine: Box<dyn AioEngine>,
        single: BackoffPolicy,
        batch: BackoffPolicy,
    ) -> Self {
        Self {
            engine,
            single,
            batch,
            ops_in_flight: AtomicU64::new(0),
            epoch: Instant::now(),
            last_op_ns: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn depth(&self) -> usize {
        self.engine.depth()
    }

    // ── Submission ──

    /// Submit one request, absorbing `EAGAIN` with [`BackoffPolicy::SINGLE`].
    pub fn submit(&self, req: &IoRequest) -> Result<SubmitOutcome> {
        let mut retries = 0;
        loop {
            match self.submit_once(std::slice::from_ref(req)) {
                Ok(n) if n > 0 => {
                    return Ok(SubmitOutcome {
                        accepted: n,
                        retries,
                    });
                }
                Ok(_) | Err(Errno::EAGAIN) => {
                    if retries >= self.single.max_retries {
                        return Err(BdevError::SubmitExhausted {
                            accepted: 0,
                            requested: 1,
                            retries,
                        });
                    }
                    thread::sleep(self.single.delay(retries));
                    retries += 1;
                }
                Err(errno) => return Err(BdevError::Submit { errno, accepted: 0 }),
            }
        }
    }

    /// Submit all of `reqs`, absorbing `EAGAIN` and partial accepts with
    /// [`BackoffPolicy::BATCH`]. The retry budget covers the whole batch.
    ///
    /// On error, [`BdevError::accepted`] tells how many leading requests
    /// the kernel took; those will complete normally.
    pub fn submit_batch(&self, reqs: &[IoRequest]) -> Result<SubmitOutcome> {
        let mut done = 0;
        let mut retries = 0;
        while done < reqs.len() {
            match self.submit_once(&reqs[done..]) {
                Ok(n) if n > 0 => {
                    done += n;
                }
                Ok(_) | Err(Errno::EAGAIN) => {
                    if retries >= self.batch.max_retries {
                        return Err(BdevError::SubmitExhausted {
                            accepted: done,
                            requested: reqs.len(),
                            retries,
                        });
                    }
                    thread::sleep(self.batch.delay(retries));
                    retries += 1;
                }
                Err(errno) => {
                    return Err(BdevError::Submit {
                        errno,
                        accepted: done,
                    })
                }
            }
        }
        Ok(SubmitOutcome {
            accepted: done,
            retries,
        })
    }

    /// One engine call. The offered requests are counted in flight before
    /// the call and whatever the engine refused is taken back after it.
    fn submit_once(&self, reqs: &[IoRequest]) -> std::result::Result<usize, Errno> {
        let offered = self.reserve(reqs.len());
        if offered == 0 {
            return Err(Errno::EAGAIN);
        }
        let res = self.engine.submit(&reqs[..offered]);
        let accepted = match res {
            Ok(n) => n.min(offered),
            Err(_) => 0,
        };
        if accepted < offered {
            let refused = (offered - accepted) as u64;
            self.submitted.fetch_sub(refused, Ordering::AcqRel);
            self.ops_in_flight.fetch_sub(refused, Ordering::AcqRel);
        }
        res.map(|_| accepted)
    }

    /// Claim up to `want` in-flight slots below the engine depth. Touches
    /// the timestamp on the transition from idle.
    fn reserve(&self, want: usize) -> usize {
        let depth = self.engine.depth().max(1) as u64;
        let mut claimed = 0;
        let prev = self
            .ops_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                claimed = (want as u64).min(depth.saturating_sub(cur));
                (claimed > 0).then_some(cur + claimed)
            });
        let Ok(prev) = prev else {
            return 0;
        };
        if prev == 0 {
            self.touch();
        }
        self.submitted.fetch_add(claimed, Ordering::AcqRel);
        claimed as usize
    }

    // ── Completion ──

    /// Wait up to `timeout` for completions, filling at most
    /// `events.len()`. Retries transparently on `EINTR`. A timeout with
    /// nothing reaped is `Ok` with `count == 0`.
    pub fn get_next_completed(
        &self,
        timeout: Duration,
        events: &mut [IoEvent],
    ) -> Result<CompletionBatch> {
        let n = loop {
            match self.engine.get_events(1, events, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(BdevError::Kernel {
                        op: "io_getevents",
                        errno,
                    })
                }
            }
        };
        if n == 0 {
            return Ok(CompletionBatch {
                count: 0,
                queue_length: self.ops_in_flight(),
                latency: Duration::ZERO,
            });
        }

        let latency = self.since_last_op();
        self.completed.fetch_add(n as u64, Ordering::AcqRel);
        let before = self.ops_in_flight.fetch_sub(n as u64, Ordering::AcqRel);
        self.touch();

        Ok(CompletionBatch {
            count: n,
            queue_length: before,
            latency,
        })
    }

    // ── Observability ──

    pub fn ops_in_flight(&self) -> u64 {
        self.ops_in_flight.load(Ordering::Acquire)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Time of the last queue event (first submit after idle, or last reap).
    pub fn last_op_timestamp(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_op_ns.load(Ordering::Acquire))
    }

    fn touch(&self) {
        let ns = self.epoch.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.last_op_ns.store(ns, Ordering::Release);
    }

    fn since_last_op(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_op_timestamp())
    }
}
