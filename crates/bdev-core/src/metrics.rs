//! Rolling AIO queue metrics.
//!
//! The completion thread feeds one observation per reap: the queue length
//! it saw and how long the queue waited since its previous event. Readers
//! call `get_stats()`, which folds the accumulators into a snapshot at most
//! once per `min_period` and otherwise hands back the cached snapshot, so a
//! dashboard polling every millisecond neither pays for nor sees the noise
//! of per-reap values.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Immutable snapshot of queue behaviour over one period.
#[derive(Debug, Clone, PartialEq)]
pub struct AioQueueStats {
    pub length_max: u64,
    pub length_mean: f64,
    pub last_completed_max_us: u64,
    pub last_completed_mean_us: f64,
    /// When this snapshot was taken.
    pub timestamp: Instant,
    /// Time covered by this snapshot.
    pub period: Duration,
}

impl AioQueueStats {
    fn empty(at: Instant) -> Self {
        Self {
            length_max: 0,
            length_mean: 0.0,
            last_completed_max_us: 0,
            last_completed_mean_us: 0.0,
            timestamp: at,
            period: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Accumulators {
    length_max: u64,
    length_sum: u64,
    length_count: u64,
    latency_max_us: u64,
    latency_sum_us: u64,
    latency_count: u64,
}

struct Snapshot {
    taken: Instant,
    stats: Arc<AioQueueStats>,
}

pub struct MetricsAggregator {
    min_period: Duration,
    acc: Mutex<Accumulators>,
    snapshot: Mutex<Snapshot>,
}

impl MetricsAggregator {
    pub fn new(min_period: Duration) -> Self {
        Self::new_at(min_period, Instant::now())
    }

    pub fn new_at(min_period: Duration, now: Instant) -> Self {
        Self {
            min_period,
            acc: Mutex::new(Accumulators::default()),
            snapshot: Mutex::new(Snapshot {
                taken: now,
                stats: Arc::new(AioQueueStats::empty(now)),
            }),
        }
    }

    pub fn min_period(&self) -> Duration {
        self.min_period
    }

    pub fn observe(&self, queue_length: u64, completion_latency: Duration) {
        let us = completion_latency.as_micros().min(u64::MAX as u128) as u64;
        let mut acc = self.acc.lock().unwrap_or_else(|e| e.into_inner());
        acc.length_max = acc.length_max.max(queue_length);
        acc.length_sum = acc.length_sum.saturating_add(queue_length);
        acc.length_count += 1;
        acc.latency_max_us = acc.latency_max_us.max(us);
        acc.latency_sum_us = acc.latency_sum_us.saturating_add(us);
        acc.latency_count += 1;
    }

    pub fn get_stats(&self) -> Arc<AioQueueStats> {
        self.get_stats_at(Instant::now())
    }

    /// Snapshot as of `now`; recomputed only once `min_period` has passed
    /// since the previous recomputation.
    pub fn get_stats_at(&self, now: Instant) -> Arc<AioQueueStats> {
        let mut snap = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let period = now.saturating_duration_since(snap.taken);
        if period < self.min_period {
            return Arc::clone(&snap.stats);
        }

        let acc = {
            let mut acc = self.acc.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *acc)
        };
        let mean = |sum: u64, count: u64| {
            if count == 0 {
                0.0
            } else {
                sum as f64 / count as f64
            }
        };

        let stats = Arc::new(AioQueueStats {
            length_max: acc.length_max,
            length_mean: mean(acc.length_sum, acc.length_count),
            last_completed_max_us: acc.latency_max_us,
            last_completed_mean_us: mean(acc.latency_sum_us, acc.latency_count),
            timestamp: now,
            period,
        });
        snap.taken = now;
        snap.stats = Arc::clone(&stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_period_returns_cached() {
        let base = Instant::now();
        let m = MetricsAggregator::new_at(Duration::from_secs(5), base);
        m.observe(4, Duration::from_micros(100));

        let a = m.get_stats_at(base + Duration::from_secs(1));
        let b = m.get_stats_at(base + Duration::from_secs(2));
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a, &b));
        // Nothing folded yet.
        assert_eq!(a.length_max, 0);
    }

    #[test]
    fn test_after_period_recomputes() {
        let base = Instant::now();
        let m = MetricsAggregator::new_at(Duration::from_secs(5), base);
        m.observe(2, Duration::from_micros(100));
        m.observe(6, Duration::from_micros(300));

        let s = m.get_stats_at(base + Duration::from_secs(5));
        assert_eq!(s.length_max, 6);
        assert_eq!(s.length_mean, 4.0);
        assert_eq!(s.last_completed_max_us, 300);
        assert_eq!(s.last_completed_mean_us, 200.0);
        assert_eq!(s.period, Duration::from_secs(5));

        // Accumulators were reset; new observations show up next period.
        m.observe(10, Duration::from_micros(50));
        let cached = m.get_stats_at(base + Duration::from_secs(6));
        assert_eq!(cached.length_max, 6);
        let next = m.get_stats_at(base + Duration::from_secs(11));
        assert_eq!(next.length_max, 10);
        assert_eq!(next.length_mean, 10.0);
        assert_eq!(next.last_completed_mean_us, 50.0);
    }

    #[test]
    fn test_empty_period_has_zero_means() {
        let base = Instant::now();
        let m = MetricsAggregator::new_at(Duration::ZERO, base);
        let s = m.get_stats_at(base + Duration::from_millis(1));
        assert_eq!(s.length_mean, 0.0);
        assert_eq!(s.last_completed_mean_us, 0.0);
    }
}
