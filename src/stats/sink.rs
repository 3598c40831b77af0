use parking_lot::Mutex;

use super::Stats;

/// Counters a circuit breaker reports its call outcomes into.
pub trait BreakerMetrics: Send + Sync {
    fn inc_success(&self);
    fn inc_failure(&self);
    /// Returns the counts accumulated since the previous call and zeroes them.
    fn clear(&self) -> Stats;
}

/// Thread-safe success/failure counters.
/// Request completions call `inc_*`, the publisher calls `clear()` once per period.
#[derive(Debug, Default)]
pub struct MetricsSink {
    inner: Mutex<Stats>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerMetrics for MetricsSink {
    fn inc_success(&self) {
        let mut stats = self.inner.lock();
        stats.successes = stats.successes.saturating_add(1);
    }

    fn inc_failure(&self) {
        let mut stats = self.inner.lock();
        stats.fails = stats.fails.saturating_add(1);
    }

    fn clear(&self) -> Stats {
        std::mem::take(&mut *self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn clear_returns_counts_and_resets() {
        let sink = MetricsSink::new();
        sink.inc_success();
        sink.inc_success();
        sink.inc_failure();

        assert_eq!(sink.clear(), Stats { successes: 2, fails: 1 });
        assert_eq!(sink.clear(), Stats::default());
    }

    #[test]
    fn concurrent_increments_survive_concurrent_clears() {
        let sink = MetricsSink::new();
        let writers_done = AtomicBool::new(false);

        let collected = std::thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut total = Stats::default();
                while !writers_done.load(Ordering::Acquire) {
                    let stats = sink.clear();
                    total.successes += stats.successes;
                    total.fails += stats.fails;
                }
                total
            });

            let writers: Vec<_> = (0..8)
                .map(|i| {
                    let sink = &sink;
                    s.spawn(move || {
                        for n in 0..500 {
                            if (i * 500 + n) % 10 == 0 {
                                sink.inc_failure();
                            } else {
                                sink.inc_success();
                            }
                        }
                    })
                })
                .collect();
            for w in writers {
                w.join().unwrap();
            }
            writers_done.store(true, Ordering::Release);
            reader.join().unwrap()
        });

        let rest = sink.clear();
        assert_eq!(collected.successes + rest.successes, 3600);
        assert_eq!(collected.fails + rest.fails, 400);
    }
}
