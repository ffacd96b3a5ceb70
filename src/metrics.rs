//! Node-level request metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running counters, maintained by the gateway.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    duration_ns: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub duration: Duration,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.duration_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            duration: Duration::from_nanos(self.duration_ns.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let m = Metrics::new();
        m.record(Duration::from_millis(2));
        m.record(Duration::from_millis(3));
        let snap = m.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.duration, Duration::from_millis(5));
    }
}
