//! Loop counters and per-kind latency

use std::time::Duration;

use arbor_core::EventKind;

/// Latency summary for one event kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindStats {
    pub count: u64,
    total_nanos: u64,
    min_nanos: u64,
    max_nanos: u64,
}

impl KindStats {
    pub fn record(&mut self, latency: Duration) {
        let nanos = latency.as_nanos().min(u64::MAX as u128) as u64;
        if self.count == 0 || nanos < self.min_nanos {
            self.min_nanos = nanos;
        }
        self.max_nanos = self.max_nanos.max(nanos);
        self.total_nanos = self.total_nanos.saturating_add(nanos);
        self.count += 1;
    }

    pub fn min(&self) -> Duration {
        Duration::from_nanos(self.min_nanos)
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos)
    }

    pub fn avg(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_nanos / self.count)
    }
}

/// Event loop counters
#[derive(Clone, Debug, Default)]
pub struct LoopStats {
    /// Events taken off the queue and dispatched
    pub processed: u64,
    /// Copies re-posted to children by `Propagate`
    pub propagated: u64,
    /// Posts refused because the queue was full
    pub dropped: u64,
    /// Dispatches that returned an error
    pub failed: u64,
    /// Dispatches that overran the process budget
    pub timeouts: u64,
    /// External events with no handler installed
    pub unhandled: u64,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
    per_kind: [KindStats; 5],
}

impl LoopStats {
    pub fn kind(&self, kind: EventKind) -> &KindStats {
        &self.per_kind[kind.index()]
    }

    pub(crate) fn record(&mut self, kind: EventKind, latency: Duration) {
        self.processed += 1;
        self.per_kind[kind.index()].record(latency);
    }

    pub(crate) fn observe_depth(&mut self, depth: usize) {
        self.queue_depth = depth;
        self.max_queue_depth = self.max_queue_depth.max(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_stats_summary() {
        let mut stats = KindStats::default();
        assert_eq!(stats.avg(), Duration::ZERO);

        stats.record(Duration::from_micros(30));
        stats.record(Duration::from_micros(10));
        stats.record(Duration::from_micros(20));

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min(), Duration::from_micros(10));
        assert_eq!(stats.max(), Duration::from_micros(30));
        assert_eq!(stats.avg(), Duration::from_micros(20));
    }

    #[test]
    fn test_loop_stats_per_kind() {
        let mut stats = LoopStats::default();
        stats.record(EventKind::Evolve, Duration::from_micros(1));
        stats.record(EventKind::Propagate, Duration::from_micros(2));
        stats.record(EventKind::Propagate, Duration::from_micros(4));

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.kind(EventKind::Propagate).count, 2);
        assert_eq!(stats.kind(EventKind::Interrupt).count, 0);

        stats.observe_depth(7);
        stats.observe_depth(2);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.max_queue_depth, 7);
    }
}
