//! Scheduled network-change injection for controlled handover experiments.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roam_core::{NetworkChangeConfig, TriggerMode};
use roam_engine::Session;

use crate::context::RunContext;
use crate::inject::FaultInjector;
use crate::metrics::HandoverMetrics;
use crate::track::SequenceLedger;

/// Cadence for predicate polls (handshake confirmation, sequence
/// threshold).
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A sequence-mode wait gives up once acknowledgments stop advancing for
/// this long.
const SEQUENCE_STALL: Duration = Duration::from_secs(2);

/// Background task firing `count` scheduled path disruptions.
pub struct NetworkChangeSimulator {
    handle: JoinHandle<u32>,
}

impl NetworkChangeSimulator {
    pub fn spawn(
        context: RunContext,
        config: NetworkChangeConfig,
        session: Arc<dyn Session>,
        injector: Arc<dyn FaultInjector>,
        metrics: Arc<HandoverMetrics>,
    ) -> Self {
        let handle = tokio::spawn(run_schedule(context, config, session, injector, metrics));
        Self { handle }
    }

    /// Waits for the whole schedule; a run is not complete until this
    /// returns. Yields the number of events actually fired.
    pub async fn join(self) -> u32 {
        match self.handle.await {
            Ok(fired) => fired,
            Err(error) => {
                warn!(%error, "network-change task failed");
                0
            }
        }
    }
}

async fn run_schedule(
    context: RunContext,
    config: NetworkChangeConfig,
    session: Arc<dyn Session>,
    injector: Arc<dyn FaultInjector>,
    metrics: Arc<HandoverMetrics>,
) -> u32 {
    let cancel = context.cancellation();
    if !wait_for_handshake(session.as_ref(), &cancel).await {
        return 0;
    }
    info!(count = config.count, mode = ?config.trigger, "network-change schedule armed");

    let mut from = config.start_interface.clone();
    let mut to = config.alternate_interface.clone();
    let mut ledger = SequenceLedger::new();
    let mut fired = 0;
    for index in 0..config.count {
        let armed = match config.trigger {
            TriggerMode::Time => wait_jittered(config.interval, &cancel).await,
            TriggerMode::Sequence => {
                wait_for_sequence(session.as_ref(), &mut ledger, config.interval, index, &cancel)
                    .await
            }
        };
        if !armed {
            debug!(fired, "network-change schedule interrupted");
            break;
        }
        info!(event = index + 1, count = config.count, %from, %to, "injecting network change");
        metrics.record_handover_start(context.elapsed_ms());
        if let Err(error) = injector.switch_path(&from, &to).await {
            warn!(%error, %from, %to, "fault injection failed");
            continue;
        }
        fired += 1;
        if config.count > 1 {
            std::mem::swap(&mut from, &mut to);
        }
    }
    debug!(fired, "network-change schedule complete");
    fired
}

/// Polls until the handshake is confirmed, however long that takes. The
/// only way out without confirmation is run cancellation.
async fn wait_for_handshake(session: &dyn Session, cancel: &CancellationToken) -> bool {
    while !session.is_handshake_confirmed() {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = sleep(POLL_INTERVAL) => {}
        }
    }
    true
}

async fn wait_jittered(interval_ms: u64, cancel: &CancellationToken) -> bool {
    let delay = if interval_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..interval_ms)
    };
    debug!(delay_ms = delay, "sleeping before next network change");
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(Duration::from_millis(delay)) => true,
    }
}

/// Waits for the adjusted acknowledged sequence to cross
/// `step * (index + 1)`. The ledger folds resets from earlier events into
/// the comparison, so thresholds stay meaningful across any number of
/// switches.
async fn wait_for_sequence(
    session: &dyn Session,
    ledger: &mut SequenceLedger,
    step: u64,
    index: u32,
    cancel: &CancellationToken,
) -> bool {
    let threshold = step.saturating_mul(u64::from(index) + 1);
    let mut watermark = ledger.observe(session.largest_acked_sequence());
    let mut advanced_at = Instant::now();
    loop {
        if watermark >= threshold {
            debug!(threshold, sequence = watermark, "sequence threshold crossed");
            return true;
        }
        if advanced_at.elapsed() >= SEQUENCE_STALL {
            warn!(
                threshold,
                sequence = watermark,
                "acknowledged sequence stalled, dropping remaining schedule"
            );
            return false;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = sleep(POLL_INTERVAL) => {}
        }
        let adjusted = ledger.observe(session.largest_acked_sequence());
        if adjusted > watermark {
            watermark = adjusted;
            advanced_at = Instant::now();
        }
    }
}
