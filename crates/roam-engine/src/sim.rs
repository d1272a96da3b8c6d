//! Scripted in-process engine used by the harness binary and the test
//! suites.
//!
//! `SimSession` fakes only the observable contract surface: connectivity,
//! per-epoch sequence progression, validation verdicts and path switches.
//! Behavior is driven by a [`SimProfile`] plus per-run scripts (connect
//! failures, request failures, validation verdicts), so runs are
//! reproducible without a peer.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{EngineError, ErrorCode, ValidationError};
use crate::path::PacketWriter;
use crate::session::{Request, Response, SequenceNumber, Session, SessionStats, ValidationOutcome};
use crate::PathContext;

use async_trait::async_trait;

/// Timing and behavior knobs for the simulated engine.
#[derive(Debug, Clone)]
pub struct SimProfile {
    pub peer: SocketAddr,
    /// Time for connection establishment.
    pub connect_delay: Duration,
    /// Time from an established connection to a confirmed handshake.
    pub handshake_delay: Duration,
    /// Time to answer one request.
    pub response_delay: Duration,
    /// Time to reach a path-validation verdict.
    pub validate_delay: Duration,
    pub response_status: u16,
    /// Received-sequence growth per millisecond of epoch time.
    pub sequence_rate: u64,
    /// Sequence base after a path switch; small, so a switch shows up as a
    /// regression.
    pub reset_base: u64,
    pub packets_per_request: u64,
    pub acks_per_request: u64,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            peer: SocketAddr::from(([127, 0, 0, 1], 4433)),
            connect_delay: Duration::from_millis(1),
            handshake_delay: Duration::from_millis(5),
            response_delay: Duration::from_millis(2),
            validate_delay: Duration::from_millis(2),
            response_status: 200,
            sequence_rate: 20,
            reset_base: 1,
            packets_per_request: 4,
            acks_per_request: 2,
        }
    }
}

impl SimProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_validate_delay(mut self, delay: Duration) -> Self {
        self.validate_delay = delay;
        self
    }

    pub fn with_response_status(mut self, status: u16) -> Self {
        self.response_status = status;
        self
    }

    pub fn with_sequence_rate(mut self, per_ms: u64) -> Self {
        self.sequence_rate = per_ms;
        self
    }
}

/// One committed path switch as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationRecord {
    pub self_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub writer_id: u64,
    pub owns_writer: bool,
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    connected_at: Option<Instant>,
    epoch_started: Option<Instant>,
    epoch_base: u64,
    frozen_sequence: Option<SequenceNumber>,
    last_error: Option<ErrorCode>,
    requests_sent: u64,
    connects: u64,
    packets_received: u64,
    acks_sent: u64,
    abandoned_validations: u64,
    refuse_migrations: bool,
    connect_failures: VecDeque<ErrorCode>,
    request_failures: VecDeque<(u64, ErrorCode)>,
    validation_failures: VecDeque<ValidationError>,
    status_overrides: HashMap<u64, u16>,
    migrations: Vec<MigrationRecord>,
}

/// Scripted engine session.
#[derive(Debug)]
pub struct SimSession {
    profile: SimProfile,
    state: Mutex<SimState>,
}

impl SimSession {
    pub fn new(profile: SimProfile) -> Self {
        Self {
            profile,
            state: Mutex::new(SimState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sequence_locked(&self, state: &SimState) -> Option<SequenceNumber> {
        if !state.connected {
            return state.frozen_sequence;
        }
        let started = state.epoch_started?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        Some(state.epoch_base + elapsed_ms * self.profile.sequence_rate)
    }

    /// Fail the `at`-th request (0-based, counted across reconnects) with
    /// `code` and drop the connection.
    pub fn script_request_failure(&self, at: u64, code: ErrorCode) {
        self.lock().request_failures.push_back((at, code));
    }

    /// Fail the next connection attempt with `code`.
    pub fn script_connect_failure(&self, code: ErrorCode) {
        self.lock().connect_failures.push_back(code);
    }

    /// Fail the next path-validation attempt with `reason`.
    pub fn script_validation_failure(&self, reason: ValidationError) {
        self.lock().validation_failures.push_back(reason);
    }

    /// Answer the `at`-th request with `status` instead of the profile
    /// default.
    pub fn script_response_status(&self, at: u64, status: u16) {
        self.lock().status_overrides.insert(at, status);
    }

    /// Make the engine refuse `migrate_path` calls.
    pub fn refuse_migrations(&self) {
        self.lock().refuse_migrations = true;
    }

    /// Restart the sequence space as a real network switch would, without
    /// going through a migration.
    pub fn force_path_reset(&self) {
        let mut state = self.lock();
        state.epoch_base = self.profile.reset_base;
        state.epoch_started = Some(Instant::now());
        state.frozen_sequence = None;
    }

    pub fn migrations(&self) -> Vec<MigrationRecord> {
        self.lock().migrations.clone()
    }

    pub fn requests_sent(&self) -> u64 {
        self.lock().requests_sent
    }

    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    pub fn abandoned_validations(&self) -> u64 {
        self.lock().abandoned_validations
    }
}

#[async_trait]
impl Session for SimSession {
    async fn connect(&self) -> Result<(), EngineError> {
        sleep(self.profile.connect_delay).await;
        let mut state = self.lock();
        state.connects += 1;
        if let Some(code) = state.connect_failures.pop_front() {
            state.connected = false;
            state.last_error = Some(code);
            debug!(%code, "simulated connect failure");
            return Err(EngineError::Closed { code });
        }
        let now = Instant::now();
        state.connected = true;
        state.connected_at = Some(now);
        state.epoch_started = Some(now);
        state.epoch_base = 0;
        state.frozen_sequence = None;
        state.last_error = None;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        let frozen = self.sequence_locked(&state);
        state.frozen_sequence = frozen;
        state.connected = false;
        state.connected_at = None;
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn is_handshake_confirmed(&self) -> bool {
        let state = self.lock();
        match state.connected_at {
            Some(at) if state.connected => at.elapsed() >= self.profile.handshake_delay,
            _ => false,
        }
    }

    async fn send_request(&self, request: Request) -> Result<Response, EngineError> {
        sleep(self.profile.response_delay).await;
        let mut state = self.lock();
        if !state.connected {
            let code = state.last_error.unwrap_or(ErrorCode::Internal);
            return Err(EngineError::Closed { code });
        }
        let index = state.requests_sent;
        state.requests_sent += 1;
        if let Some(&(at, code)) = state.request_failures.front() {
            if at == index {
                state.request_failures.pop_front();
                let frozen = self.sequence_locked(&state);
                state.frozen_sequence = frozen;
                state.connected = false;
                state.connected_at = None;
                state.last_error = Some(code);
                debug!(index, %code, "simulated connectivity loss");
                return Err(EngineError::Closed { code });
            }
        }
        state.packets_received += self.profile.packets_per_request;
        state.acks_sent += self.profile.acks_per_request;
        let status = state
            .status_overrides
            .remove(&index)
            .unwrap_or(self.profile.response_status);
        let body = request
            .body
            .unwrap_or_else(|| Bytes::from_static(b"roam: ok\n"));
        Ok(Response { status, body })
    }

    fn largest_received_sequence(&self) -> Option<SequenceNumber> {
        let state = self.lock();
        self.sequence_locked(&state)
    }

    fn largest_acked_sequence(&self) -> SequenceNumber {
        let state = self.lock();
        self.sequence_locked(&state).unwrap_or(0)
    }

    async fn validate_path(&self, context: PathContext) -> ValidationOutcome {
        sleep(self.profile.validate_delay).await;
        let verdict = self.lock().validation_failures.pop_front();
        match verdict {
            Some(reason) => {
                debug!(%reason, "simulated validation failure");
                ValidationOutcome::Failed { context, reason }
            }
            None => ValidationOutcome::Validated(context),
        }
    }

    fn abandon_validation(&self) {
        self.lock().abandoned_validations += 1;
    }

    fn migrate_path(
        &self,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        writer: Arc<dyn PacketWriter>,
        owns_writer: bool,
    ) -> bool {
        let mut state = self.lock();
        if state.refuse_migrations || !state.connected {
            return false;
        }
        state.migrations.push(MigrationRecord {
            self_addr,
            peer_addr,
            writer_id: writer.id(),
            owns_writer,
        });
        // new path, new packet space
        state.epoch_base = self.profile.reset_base;
        state.epoch_started = Some(Instant::now());
        state.frozen_sequence = None;
        true
    }

    fn last_error(&self) -> ErrorCode {
        self.lock().last_error.unwrap_or(ErrorCode::None)
    }

    fn peer_address(&self) -> SocketAddr {
        self.profile.peer
    }

    fn stats(&self) -> SessionStats {
        let state = self.lock();
        SessionStats {
            packets_received: state.packets_received,
            acks_sent: state.acks_sent,
        }
    }
}
