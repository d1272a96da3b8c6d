use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{EngineError, ErrorCode, ValidationError};
use crate::path::{PacketWriter, PathContext};

/// Packet sequence number as exposed by the engine. Monotonic within one
/// path epoch; may restart lower after a path switch.
pub type SequenceNumber = u64;

/// One request to send over the session. A body turns the request into a
/// POST.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub path: String,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Bytes) -> Self {
        Self {
            path: path.into(),
            body: Some(body),
        }
    }
}

/// Terminal response for one request.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

/// Packet-level counters for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_received: u64,
    pub acks_sent: u64,
}

/// Terminal outcome of a path-validation attempt. The candidate comes back
/// to the caller either way: for promotion on success, for discarding on
/// failure.
#[derive(Debug)]
pub enum ValidationOutcome {
    Validated(PathContext),
    Failed {
        context: PathContext,
        reason: ValidationError,
    },
}

/// Client-visible surface of the external QUIC engine.
///
/// Everything protocol-shaped (handshake, framing, congestion control,
/// challenge frames) happens behind this trait; the migration subsystem
/// only observes connectivity, sequence progress and validation verdicts,
/// and instructs path switches.
#[async_trait]
pub trait Session: Send + Sync {
    /// Establishes (or re-establishes) the underlying connection.
    async fn connect(&self) -> Result<(), EngineError>;

    /// Closes the underlying connection; the handle stays reusable for a
    /// later [`connect`](Session::connect).
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn is_handshake_confirmed(&self) -> bool;

    /// Sends one request and suspends until the engine delivers a terminal
    /// outcome for its stream.
    async fn send_request(&self, request: Request) -> Result<Response, EngineError>;

    /// Largest packet sequence number received so far; `None` before the
    /// first packet arrives.
    fn largest_received_sequence(&self) -> Option<SequenceNumber>;

    fn largest_acked_sequence(&self) -> SequenceNumber;

    /// Runs a challenge/response exchange on the candidate path without
    /// disturbing traffic on the active path. Resolves when the engine
    /// reaches a terminal verdict; the engine owns the retry budget.
    async fn validate_path(&self, context: PathContext) -> ValidationOutcome;

    /// Drops any half-open validation bookkeeping after a failed or
    /// abandoned attempt.
    fn abandon_validation(&self);

    /// Atomically switches the active path to `(self_addr, peer_addr)` over
    /// `writer`. `owns_writer` tells the engine whether it is responsible
    /// for releasing the writer on close; the controller keeps ownership
    /// and passes `false`. Returns `false` if the engine refused the
    /// switch.
    fn migrate_path(
        &self,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        writer: Arc<dyn PacketWriter>,
        owns_writer: bool,
    ) -> bool;

    /// Most recent close/transport error code.
    fn last_error(&self) -> ErrorCode;

    fn peer_address(&self) -> SocketAddr;

    fn stats(&self) -> SessionStats;
}
