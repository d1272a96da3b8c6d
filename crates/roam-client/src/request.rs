//! Foreground request cycles and run orchestration.
//!
//! `run_client` owns the whole lifecycle: connect, start the background
//! actors (route monitor, tracker, simulator), drive the request loop,
//! then tear everything down in order and emit the run summary.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use roam_core::{NetworkChangeConfig, RunConfig, Target};
use roam_engine::{ErrorCode, Request, Session};

use crate::context::RunContext;
use crate::error::ClientError;
use crate::inject::FaultInjector;
use crate::metrics::HandoverMetrics;
use crate::migrate::MigrationController;
use crate::report::{Record, Reporter};
use crate::route::spawn_route_monitor;
use crate::simulate::NetworkChangeSimulator;
use crate::track::HandoverTracker;

/// What the request loop accomplished.
#[derive(Debug, Default)]
struct LoopOutcome {
    succeeded: u32,
    attempted: u32,
    /// Sequence progress observed on connections torn down mid-run, so the
    /// final packet total spans every connection the run used.
    carried_sequence: u64,
}

/// Runs the whole client lifecycle over an established engine handle.
/// Returns the process exit code on orderly completion.
pub async fn run_client(
    context: RunContext,
    session: Arc<dyn Session>,
    changes: Option<(NetworkChangeConfig, Arc<dyn FaultInjector>)>,
    reporter: Reporter,
) -> Result<i32, ClientError> {
    let config = context.config();
    let metrics = Arc::new(HandoverMetrics::new());

    info!(server = %config.target, "connecting");
    if let Err(error) = session.connect().await {
        if error.code() == ErrorCode::InvalidVersion && config.version_mismatch_ok {
            warn!(server = %config.target, "version negotiation failed, treating as success");
            emit_summary(&context, &metrics, &reporter, &LoopOutcome::default(), 0, None);
            return Ok(0);
        }
        let failure = if error.code() == ErrorCode::InvalidVersion {
            ClientError::VersionMismatch {
                target: config.target.to_string(),
            }
        } else {
            ClientError::Connect {
                target: config.target.to_string(),
                source: error,
            }
        };
        emit_summary(&context, &metrics, &reporter, &LoopOutcome::default(), 0, Some(&failure));
        return Err(failure);
    }
    info!(server = %config.target, "connected");

    let controller = Arc::new(MigrationController::new(
        context.clone(),
        Arc::clone(&session),
        Arc::clone(&metrics),
    ));
    controller.seed_current_route();
    let monitor = spawn_route_monitor(context.clone(), Arc::clone(&controller));

    let tracker = config.track.then(|| {
        HandoverTracker::spawn(
            context.clone(),
            Arc::clone(&session),
            Arc::clone(&metrics),
            reporter.clone(),
        )
    });
    let simulator = changes.map(|(schedule, injector)| {
        NetworkChangeSimulator::spawn(
            context.clone(),
            schedule,
            Arc::clone(&session),
            injector,
            Arc::clone(&metrics),
        )
    });

    let (outcome, verdict) = run_requests(&context, &session, &controller, &metrics, &reporter).await;

    // Teardown order: stop the tracker before sockets go away, join the
    // simulator before the run may be declared complete, then stop the
    // monitor. A failed run cancels up front so background waits abort.
    if verdict.is_err() {
        context.cancel();
    }
    let track_report = match tracker {
        Some(tracker) => tracker.stop().await,
        None => None,
    };
    let network_changes = match simulator {
        Some(simulator) => simulator.join().await,
        None => 0,
    };
    context.cancel();
    if let Err(error) = monitor.await {
        warn!(%error, "route monitor task failed");
    }

    let final_sequence = session.largest_received_sequence().unwrap_or(0);
    let stats = session.stats();
    session.disconnect().await;

    metrics.set_ack_count(stats.acks_sent);
    metrics.set_packets_observed(outcome.carried_sequence + final_sequence);
    if let Some(report) = &track_report {
        debug!(
            samples = report.samples.len(),
            switches = report.epochs,
            "handover track complete"
        );
    }

    emit_summary(
        &context,
        &metrics,
        &reporter,
        &outcome,
        network_changes,
        verdict.as_ref().err(),
    );
    verdict?;
    info!(
        elapsed_ms = context.elapsed_ms(),
        succeeded = outcome.succeeded,
        attempted = outcome.attempted,
        handover_delay_ms = ?metrics.handover_delay_ms(),
        "run complete"
    );
    Ok(0)
}

/// Writes the final summary record. Every teardown path goes through here,
/// failed runs included, so the record stream always ends with totals.
fn emit_summary(
    context: &RunContext,
    metrics: &HandoverMetrics,
    reporter: &Reporter,
    outcome: &LoopOutcome,
    network_changes: u32,
    failure: Option<&ClientError>,
) {
    let snapshot = metrics.snapshot();
    reporter.record(&Record::RunSummary {
        elapsed_ms: context.elapsed_ms(),
        requests_succeeded: outcome.succeeded,
        requests_attempted: outcome.attempted,
        retries: snapshot.retry_count,
        network_changes,
        handover_delay_ms: metrics.handover_delay_ms(),
        packets_observed: snapshot.packets_observed,
        acks_sent: snapshot.ack_count,
        route_lookups: snapshot.route_lookups,
        error: failure.map(ClientError::to_string),
    });
}

/// Drives the configured number of request cycles. A transient
/// connectivity loss reconnects and grows the budget by one, so a retried
/// request is not charged against the requested total; everything else
/// ends the run. The counts survive a failure, so the caller can report
/// what a broken run still accomplished.
async fn run_requests(
    context: &RunContext,
    session: &Arc<dyn Session>,
    controller: &MigrationController,
    metrics: &HandoverMetrics,
    reporter: &Reporter,
) -> (LoopOutcome, Result<(), ClientError>) {
    let mut outcome = LoopOutcome::default();
    let verdict = request_cycles(context, session, controller, metrics, reporter, &mut outcome).await;
    (outcome, verdict)
}

async fn request_cycles(
    context: &RunContext,
    session: &Arc<dyn Session>,
    controller: &MigrationController,
    metrics: &HandoverMetrics,
    reporter: &Reporter,
    outcome: &mut LoopOutcome,
) -> Result<(), ClientError> {
    let config = context.config();
    let mut budget = config.num_requests;
    let mut index = 0;
    while index < budget {
        let offset_ms = context.elapsed_ms();
        info!(request = index, offset_ms, "sending request");
        reporter.record(&Record::RequestStart { index, offset_ms });
        outcome.attempted += 1;

        match session.send_request(build_request(&config.body)).await {
            Ok(response) => {
                let status = response.status;
                match status {
                    200..=299 => {
                        outcome.succeeded += 1;
                        if !config.quiet {
                            info!(
                                request = index,
                                status,
                                bytes = response.body.len(),
                                "request succeeded"
                            );
                        }
                    }
                    300..=399 if config.redirect_is_success => {
                        outcome.succeeded += 1;
                        if !config.quiet {
                            info!(request = index, status, "request succeeded (redirect)");
                        }
                    }
                    _ => {
                        error!(request = index, status, "request failed");
                        return Err(ClientError::RequestFailed { index, status });
                    }
                }
            }
            Err(error) => {
                let code = error.code();
                if !code.is_transient() {
                    error!(request = index, %code, server = %config.target, "fatal disconnection");
                    return Err(ClientError::Disconnected {
                        target: config.target.to_string(),
                        code,
                    });
                }
                warn!(request = index, %code, "transient connectivity loss, reconnecting");
                metrics.add_retry();
                outcome.carried_sequence += session.largest_received_sequence().unwrap_or(0);
                session.disconnect().await;
                reconnect(session, &config.target).await?;
                controller.seed_current_route();
                budget += 1;
                index += 1;
                continue;
            }
        }

        if index + 1 < budget {
            pivot(config, session, controller, outcome).await?;
        }
        index += 1;
    }
    Ok(())
}

/// Between-iteration transition: a fresh connection when configured, a
/// source-port rotation otherwise. An in-flight migration substitutes for
/// the rotation.
async fn pivot(
    config: &RunConfig,
    session: &Arc<dyn Session>,
    controller: &MigrationController,
    outcome: &mut LoopOutcome,
) -> Result<(), ClientError> {
    if config.one_connection_per_request {
        debug!("closing connection between requests");
        outcome.carried_sequence += session.largest_received_sequence().unwrap_or(0);
        session.disconnect().await;
        reconnect(session, &config.target).await?;
        controller.seed_current_route();
    } else if config.rotate_port && !controller.rotate_local_port().await {
        debug!("port rotation skipped");
    }
    Ok(())
}

async fn reconnect(session: &Arc<dyn Session>, target: &Target) -> Result<(), ClientError> {
    session
        .connect()
        .await
        .map_err(|source| ClientError::Connect {
            target: target.to_string(),
            source,
        })
}

fn build_request(body: &Option<String>) -> Request {
    match body {
        Some(body) => Request::post("/", Bytes::from(body.clone())),
        None => Request::get("/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::EngineResetInjector;
    use crate::report::{read_records, ReportWriter};
    use roam_core::TriggerMode;
    use roam_engine::sim::{SimProfile, SimSession};
    use std::fs::File;
    use std::io::BufReader;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config(num_requests: u32) -> RunConfig {
        let mut config = RunConfig::new(Target {
            host: "127.0.0.1".to_string(),
            port: 4433,
        });
        config.num_requests = num_requests;
        config.rotate_port = false;
        config.quiet = true;
        config
    }

    fn report_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("roam-{}-{}.jsonl", tag, std::process::id()))
    }

    async fn run(
        config: RunConfig,
        session: &Arc<SimSession>,
        reporter: Reporter,
    ) -> Result<i32, ClientError> {
        run_client(
            RunContext::new(config),
            Arc::clone(session) as Arc<dyn Session>,
            None,
            reporter,
        )
        .await
    }

    #[tokio::test]
    async fn completes_requested_cycles() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        let code = run(test_config(3), &session, Reporter::stdout())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(session.requests_sent(), 3);
        assert!(!session.is_connected(), "teardown should disconnect");
    }

    #[tokio::test]
    async fn transient_loss_grows_the_budget() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.script_request_failure(1, ErrorCode::NetworkUnreachable);
        let path = report_path("transient");
        let reporter = Reporter::new(
            ReportWriter::open(path.to_str().expect("utf-8 temp path")).unwrap(),
        );

        let code = run(test_config(2), &session, reporter).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(session.requests_sent(), 3);
        assert_eq!(session.connect_count(), 2);

        let records = read_records(BufReader::new(File::open(&path).unwrap())).unwrap();
        let starts = records
            .iter()
            .filter(|record| matches!(record, Record::RequestStart { .. }))
            .count();
        assert_eq!(starts, 3);
        let summary = records
            .iter()
            .find_map(|record| match record {
                Record::RunSummary {
                    requests_succeeded,
                    requests_attempted,
                    retries,
                    ..
                } => Some((*requests_succeeded, *requests_attempted, *retries)),
                _ => None,
            })
            .expect("run summary should be recorded");
        assert_eq!(summary, (2, 3, 1));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn fatal_disconnect_aborts_the_run() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.script_request_failure(0, ErrorCode::PeerGoingAway);
        let err = run(test_config(3), &session, Reporter::stdout())
            .await
            .unwrap_err();
        match err {
            ClientError::Disconnected { code, .. } => {
                assert_eq!(code, ErrorCode::PeerGoingAway)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.requests_sent(), 1);
    }

    #[tokio::test]
    async fn failed_run_still_writes_the_summary() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.script_request_failure(0, ErrorCode::PeerGoingAway);
        let path = report_path("failed-summary");
        let reporter = Reporter::new(
            ReportWriter::open(path.to_str().expect("utf-8 temp path")).unwrap(),
        );

        let err = run(test_config(3), &session, reporter).await.unwrap_err();
        assert!(matches!(err, ClientError::Disconnected { .. }));

        let records = read_records(BufReader::new(File::open(&path).unwrap())).unwrap();
        let summary = records
            .iter()
            .find_map(|record| match record {
                Record::RunSummary {
                    requests_succeeded,
                    requests_attempted,
                    error,
                    ..
                } => Some((*requests_succeeded, *requests_attempted, error.clone())),
                _ => None,
            })
            .expect("failed run should still record a summary");
        assert_eq!((summary.0, summary.1), (0, 1));
        let tag = summary.2.expect("failure should be tagged in the summary");
        assert!(tag.contains("closed"), "unexpected tag: {tag}");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn version_mismatch_is_distinct_and_downgradable() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.script_connect_failure(ErrorCode::InvalidVersion);
        let err = run(test_config(1), &session, Reporter::stdout())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_VERSION_MISMATCH);

        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.script_connect_failure(ErrorCode::InvalidVersion);
        let mut config = test_config(1);
        config.version_mismatch_ok = true;
        let code = run(config, &session, Reporter::stdout()).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(session.requests_sent(), 0);
    }

    #[tokio::test]
    async fn redirect_policy_controls_the_verdict() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.script_response_status(0, 301);
        let err = run(test_config(1), &session, Reporter::stdout())
            .await
            .unwrap_err();
        match err {
            ClientError::RequestFailed { status, .. } => assert_eq!(status, 301),
            other => panic!("unexpected error: {other}"),
        }

        let session = Arc::new(SimSession::new(SimProfile::new()));
        session.script_response_status(0, 301);
        let mut config = test_config(1);
        config.redirect_is_success = true;
        let code = run(config, &session, Reporter::stdout()).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn fresh_connection_between_requests() {
        let session = Arc::new(SimSession::new(SimProfile::new()));
        let mut config = test_config(2);
        config.one_connection_per_request = true;
        let code = run(config, &session, Reporter::stdout()).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(session.connect_count(), 2);
    }

    #[tokio::test]
    async fn simulated_change_lands_in_the_summary() {
        let session = Arc::new(SimSession::new(
            SimProfile::new().with_response_delay(Duration::from_millis(5)),
        ));
        let mut config = test_config(4);
        config.track = true;
        let changes = NetworkChangeConfig {
            count: 1,
            interval: 0,
            trigger: TriggerMode::Time,
            start_interface: "wlan0".to_string(),
            alternate_interface: "wlan1".to_string(),
        };
        let path = report_path("simulated");
        let reporter = Reporter::new(
            ReportWriter::open(path.to_str().expect("utf-8 temp path")).unwrap(),
        );

        let code = run_client(
            RunContext::new(config),
            Arc::clone(&session) as Arc<dyn Session>,
            Some((
                changes,
                Arc::new(EngineResetInjector::new(Arc::clone(&session))) as Arc<dyn FaultInjector>,
            )),
            reporter,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let records = read_records(BufReader::new(File::open(&path).unwrap())).unwrap();
        let network_changes = records
            .iter()
            .find_map(|record| match record {
                Record::RunSummary {
                    network_changes, ..
                } => Some(*network_changes),
                _ => None,
            })
            .expect("run summary should be recorded");
        assert_eq!(network_changes, 1);

        let samples: Vec<u64> = records
            .iter()
            .filter_map(|record| match record {
                Record::TrackSample { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert!(!samples.is_empty(), "tracker should have sampled");
        assert!(
            samples.windows(2).all(|pair| pair[0] <= pair[1]),
            "published track regressed: {samples:?}"
        );
        let _ = std::fs::remove_file(&path);
    }
}
