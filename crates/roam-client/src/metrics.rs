use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "timestamp not recorded".
const UNSET: u64 = u64::MAX;

/// Run-wide handover counters shared by the tracker, the migration
/// controller and the request loop. Timestamps are milliseconds relative to
/// the run start.
#[derive(Debug)]
pub struct HandoverMetrics {
    handover_start_ms: AtomicU64,
    handover_confirmed_ms: AtomicU64,
    pre_handover_max_sequence: AtomicU64,
    post_handover_max_sequence: AtomicU64,
    retry_count: AtomicU64,
    ack_count: AtomicU64,
    route_lookups: AtomicU64,
    packets_observed: AtomicU64,
}

impl Default for HandoverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain-value copy of the counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub handover_start_ms: Option<u64>,
    pub handover_confirmed_ms: Option<u64>,
    pub pre_handover_max_sequence: u64,
    pub post_handover_max_sequence: u64,
    pub retry_count: u64,
    pub ack_count: u64,
    pub route_lookups: u64,
    pub packets_observed: u64,
}

impl HandoverMetrics {
    pub fn new() -> Self {
        Self {
            handover_start_ms: AtomicU64::new(UNSET),
            handover_confirmed_ms: AtomicU64::new(UNSET),
            pre_handover_max_sequence: AtomicU64::new(0),
            post_handover_max_sequence: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            ack_count: AtomicU64::new(0),
            route_lookups: AtomicU64::new(0),
            packets_observed: AtomicU64::new(0),
        }
    }

    /// Records when the disruption was injected; the first event wins.
    pub fn record_handover_start(&self, elapsed_ms: u64) {
        let _ = self.handover_start_ms.compare_exchange(
            UNSET,
            elapsed_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Records when the migration was committed; the first commit wins.
    /// Clamped so a confirmed timestamp never precedes the recorded start.
    pub fn record_handover_confirmed(&self, elapsed_ms: u64) {
        let start = self.handover_start_ms.load(Ordering::Relaxed);
        let at = if start != UNSET && elapsed_ms < start {
            start
        } else {
            elapsed_ms
        };
        let _ = self.handover_confirmed_ms.compare_exchange(
            UNSET,
            at,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Largest published sequence before the first path switch; recorded
    /// once.
    pub fn record_pre_handover_sequence(&self, sequence: u64) {
        let _ = self.pre_handover_max_sequence.compare_exchange(
            0,
            sequence,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Largest published sequence overall; monotone.
    pub fn record_post_handover_sequence(&self, sequence: u64) {
        self.post_handover_max_sequence
            .fetch_max(sequence, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_route_lookup(&self) {
        self.route_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ack_count(&self, count: u64) {
        self.ack_count.store(count, Ordering::Relaxed);
    }

    pub fn set_packets_observed(&self, count: u64) {
        self.packets_observed.store(count, Ordering::Relaxed);
    }

    /// Time between the injected disruption and the committed migration,
    /// when both were recorded.
    pub fn handover_delay_ms(&self) -> Option<u64> {
        let start = self.handover_start_ms.load(Ordering::Relaxed);
        let confirmed = self.handover_confirmed_ms.load(Ordering::Relaxed);
        if start == UNSET || confirmed == UNSET {
            return None;
        }
        Some(confirmed.saturating_sub(start))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let timestamp = |cell: &AtomicU64| {
            let value = cell.load(Ordering::Relaxed);
            (value != UNSET).then_some(value)
        };
        MetricsSnapshot {
            handover_start_ms: timestamp(&self.handover_start_ms),
            handover_confirmed_ms: timestamp(&self.handover_confirmed_ms),
            pre_handover_max_sequence: self.pre_handover_max_sequence.load(Ordering::Relaxed),
            post_handover_max_sequence: self.post_handover_max_sequence.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            ack_count: self.ack_count.load(Ordering::Relaxed),
            route_lookups: self.route_lookups.load(Ordering::Relaxed),
            packets_observed: self.packets_observed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_handover_start_wins() {
        let metrics = HandoverMetrics::new();
        metrics.record_handover_start(100);
        metrics.record_handover_start(200);
        assert_eq!(metrics.snapshot().handover_start_ms, Some(100));
    }

    #[test]
    fn confirmed_never_precedes_start() {
        let metrics = HandoverMetrics::new();
        metrics.record_handover_start(150);
        metrics.record_handover_confirmed(120);
        assert_eq!(metrics.snapshot().handover_confirmed_ms, Some(150));
        assert_eq!(metrics.handover_delay_ms(), Some(0));
    }

    #[test]
    fn delay_needs_both_timestamps() {
        let metrics = HandoverMetrics::new();
        assert_eq!(metrics.handover_delay_ms(), None);
        metrics.record_handover_confirmed(80);
        assert_eq!(metrics.handover_delay_ms(), None);
        metrics.record_handover_start(50);
        metrics.record_handover_confirmed(90);
        // the first recorded confirmation is kept
        assert_eq!(metrics.snapshot().handover_confirmed_ms, Some(80));
        assert_eq!(metrics.handover_delay_ms(), Some(30));
    }

    #[test]
    fn sequence_counters() {
        let metrics = HandoverMetrics::new();
        metrics.record_pre_handover_sequence(500);
        metrics.record_pre_handover_sequence(900);
        metrics.record_post_handover_sequence(600);
        metrics.record_post_handover_sequence(550);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pre_handover_max_sequence, 500);
        assert_eq!(snapshot.post_handover_max_sequence, 600);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = HandoverMetrics::new();
        metrics.add_retry();
        metrics.add_retry();
        metrics.add_route_lookup();
        metrics.set_ack_count(42);
        metrics.set_packets_observed(1234);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.route_lookups, 1);
        assert_eq!(snapshot.ack_count, 42);
        assert_eq!(snapshot.packets_observed, 1234);
    }
}
