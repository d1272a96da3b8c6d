//! Handover measurement.
//!
//! A background task samples the engine's largest received sequence number
//! on a fixed cadence. A path switch shows up as a regression of the raw
//! counter; the ledger folds each regression into a running offset so the
//! published sequence stays monotone across any number of switches.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use roam_engine::Session;

use crate::context::RunContext;
use crate::metrics::HandoverMetrics;
use crate::report::{Record, Reporter};

/// Sampling cadence of the tracker task.
pub const TRACK_INTERVAL: Duration = Duration::from_millis(10);

/// How long [`HandoverTracker::stop`] waits for the task to wind down.
const STOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Folds per-path sequence epochs into one monotone published sequence.
#[derive(Debug, Default)]
pub struct SequenceLedger {
    offset: u64,
    last_raw: Option<u64>,
    epochs: u32,
}

impl SequenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw observation and returns the adjusted sequence. A raw
    /// value below the previous one starts a new epoch.
    pub fn observe(&mut self, raw: u64) -> u64 {
        if let Some(last) = self.last_raw {
            if raw < last {
                self.offset += last;
                self.epochs += 1;
            }
        }
        self.last_raw = Some(raw);
        self.offset + raw
    }

    /// Number of epoch switches seen so far.
    pub fn epochs(&self) -> u32 {
        self.epochs
    }

    /// Accumulated adjustment; after the first fold this equals the maximum
    /// raw sequence of the epoch that just ended.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// What the tracker collected over its lifetime.
#[derive(Debug)]
pub struct TrackReport {
    /// `(elapsed_ms, adjusted_sequence)` in sampling order.
    pub samples: Vec<(u64, u64)>,
    /// Path switches observed via sequence regression.
    pub epochs: u32,
}

/// Handle to the background sampling task.
pub struct HandoverTracker {
    cancel: CancellationToken,
    handle: JoinHandle<TrackReport>,
}

impl HandoverTracker {
    /// Starts sampling. The task follows the run token, so run-level
    /// cancellation stops it even without an explicit [`stop`].
    ///
    /// [`stop`]: HandoverTracker::stop
    pub fn spawn(
        context: RunContext,
        session: Arc<dyn Session>,
        metrics: Arc<HandoverMetrics>,
        reporter: Reporter,
    ) -> Self {
        let cancel = context.cancellation().child_token();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            sample_loop(context, session, metrics, reporter, task_cancel).await
        });
        Self { cancel, handle }
    }

    /// Stops sampling and returns the collected report. The join is
    /// bounded; a task that does not wind down in time is abandoned.
    pub async fn stop(self) -> Option<TrackReport> {
        self.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, self.handle).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(error)) => {
                warn!(%error, "tracker task failed");
                None
            }
            Err(_) => {
                warn!("tracker did not stop in time, abandoning it");
                None
            }
        }
    }
}

async fn sample_loop(
    context: RunContext,
    session: Arc<dyn Session>,
    metrics: Arc<HandoverMetrics>,
    reporter: Reporter,
    cancel: CancellationToken,
) -> TrackReport {
    let mut ticker = tokio::time::interval(TRACK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ledger = SequenceLedger::new();
    let mut samples = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !session.is_connected() {
            continue;
        }
        let Some(raw) = session.largest_received_sequence() else {
            continue;
        };
        let switches_before = ledger.epochs();
        let sequence = ledger.observe(raw);
        if ledger.epochs() > switches_before {
            metrics.record_pre_handover_sequence(ledger.offset());
            debug!(raw, sequence, "sequence regression, path switch observed");
        }
        if ledger.epochs() > 0 {
            metrics.record_post_handover_sequence(raw);
        }
        let elapsed_ms = context.elapsed_ms();
        samples.push((elapsed_ms, sequence));
        reporter.record(&Record::TrackSample {
            elapsed_ms,
            sequence,
        });
    }
    debug!(
        samples = samples.len(),
        epochs = ledger.epochs(),
        "tracker stopped"
    );
    TrackReport {
        samples,
        epochs: ledger.epochs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_core::{RunConfig, Target};
    use roam_engine::sim::{SimProfile, SimSession};
    use tokio::time::sleep;

    fn run_context() -> RunContext {
        RunContext::new(RunConfig::new(Target {
            host: "127.0.0.1".to_string(),
            port: 4433,
        }))
    }

    #[test]
    fn ledger_publishes_monotone_sequence() {
        let mut ledger = SequenceLedger::new();
        assert_eq!(ledger.observe(5), 5);
        assert_eq!(ledger.observe(12), 12);
        // raw restarts below the last observation: a switch
        assert_eq!(ledger.observe(3), 15);
        assert_eq!(ledger.observe(9), 21);
        assert_eq!(ledger.observe(2), 23);
        assert_eq!(ledger.epochs(), 2);
        assert_eq!(ledger.offset(), 21);
    }

    #[test]
    fn repeated_observation_is_not_a_switch() {
        let mut ledger = SequenceLedger::new();
        ledger.observe(7);
        assert_eq!(ledger.observe(7), 7);
        assert_eq!(ledger.epochs(), 0);
    }

    #[tokio::test]
    async fn tracker_sees_path_switch_and_stays_monotone() {
        let session = Arc::new(SimSession::new(SimProfile::new().with_sequence_rate(50)));
        session.connect().await.unwrap();
        let metrics = Arc::new(HandoverMetrics::new());
        let tracker = HandoverTracker::spawn(
            run_context(),
            Arc::clone(&session) as Arc<dyn Session>,
            Arc::clone(&metrics),
            Reporter::stdout(),
        );

        sleep(Duration::from_millis(40)).await;
        session.force_path_reset();
        sleep(Duration::from_millis(40)).await;

        let report = tracker.stop().await.expect("tracker should join");
        assert!(report.epochs >= 1, "switch not observed");
        assert!(report.samples.len() >= 4);
        assert!(
            report
                .samples
                .windows(2)
                .all(|pair| pair[0].1 <= pair[1].1),
            "published sequence regressed: {:?}",
            report.samples
        );
        let snapshot = metrics.snapshot();
        assert!(snapshot.pre_handover_max_sequence > 0);
        assert!(snapshot.post_handover_max_sequence > 0);
    }

    #[tokio::test]
    async fn run_cancellation_stops_the_tracker() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.connect().await.unwrap();
        let context = run_context();
        let tracker = HandoverTracker::spawn(
            context.clone(),
            Arc::clone(&session) as Arc<dyn Session>,
            Arc::new(HandoverMetrics::new()),
            Reporter::stdout(),
        );

        sleep(Duration::from_millis(20)).await;
        context.cancel();
        let report = tracker.stop().await.expect("tracker should join");
        assert!(!report.samples.is_empty());
    }
}
