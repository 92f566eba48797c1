use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate telemetry for one session. Monotonic; incremented from
/// arbitrary threads; reset only by creating a new session.
#[derive(Debug, Default)]
pub struct ClientCounters {
    bytes_before_reduction: AtomicU64,
    bytes_after_reduction: AtomicU64,
    messages_produced_ok: AtomicU64,
    messages_produced_failed: AtomicU64,
    messages_consumed_ok: AtomicU64,
    messages_consumed_failed: AtomicU64,
}

impl ClientCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_before_reduction(&self, bytes: u64) {
        self.bytes_before_reduction.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_after_reduction(&self, bytes: u64) {
        self.bytes_after_reduction.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn incr_produced_ok(&self) {
        self.messages_produced_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_produced_failed(&self) {
        self.messages_produced_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_consumed_ok(&self) {
        self.messages_consumed_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_consumed_failed(&self) {
        self.messages_consumed_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_before_reduction: self.bytes_before_reduction.load(Ordering::Relaxed),
            bytes_after_reduction: self.bytes_after_reduction.load(Ordering::Relaxed),
            messages_produced_ok: self.messages_produced_ok.load(Ordering::Relaxed),
            messages_produced_failed: self.messages_produced_failed.load(Ordering::Relaxed),
            messages_consumed_ok: self.messages_consumed_ok.load(Ordering::Relaxed),
            messages_consumed_failed: self.messages_consumed_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub bytes_before_reduction: u64,
    pub bytes_after_reduction: u64,
    pub messages_produced_ok: u64,
    pub messages_produced_failed: u64,
    pub messages_consumed_ok: u64,
    pub messages_consumed_failed: u64,
}

impl CounterSnapshot {
    /// Bytes saved by reduction so far. Zero when reduction has not paid
    /// off (passthrough traffic counts equally on both sides).
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before_reduction
            .saturating_sub(self.bytes_after_reduction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_accumulate() {
        let counters = ClientCounters::new();

        counters.add_bytes_before_reduction(100);
        counters.add_bytes_before_reduction(50);
        counters.add_bytes_after_reduction(60);
        counters.incr_produced_ok();
        counters.incr_produced_failed();
        counters.incr_consumed_ok();
        counters.incr_consumed_failed();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.bytes_before_reduction, 150);
        assert_eq!(snapshot.bytes_after_reduction, 60);
        assert_eq!(snapshot.messages_produced_ok, 1);
        assert_eq!(snapshot.messages_produced_failed, 1);
        assert_eq!(snapshot.messages_consumed_ok, 1);
        assert_eq!(snapshot.messages_consumed_failed, 1);
        assert_eq!(snapshot.bytes_saved(), 90);
    }

    #[test]
    fn test_bytes_saved_saturates() {
        let counters = ClientCounters::new();
        counters.add_bytes_after_reduction(10);

        assert_eq!(counters.snapshot().bytes_saved(), 0);
    }

    #[test]
    fn test_concurrent_increments_lose_nothing() {
        let counters = Arc::new(ClientCounters::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.add_bytes_before_reduction(1);
                        counters.incr_produced_ok();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.bytes_before_reduction, 8000);
        assert_eq!(snapshot.messages_produced_ok, 8000);
    }
}
