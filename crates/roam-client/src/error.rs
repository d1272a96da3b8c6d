use roam_engine::{EngineError, ErrorCode};
use thiserror::Error;

/// Exit code for a version-negotiation failure, distinct from generic
/// failure so callers can tell "peer does not speak this protocol" apart
/// from everything else.
pub const EXIT_VERSION_MISMATCH: i32 = 20;

/// Run-level failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: EngineError,
    },
    #[error("version negotiation with {target} failed")]
    VersionMismatch { target: String },
    #[error("request {index} failed with status {status}")]
    RequestFailed { index: u32, status: u16 },
    #[error("session to {target} closed: {code}")]
    Disconnected { target: String, code: ErrorCode },
}

impl ClientError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::VersionMismatch { .. } => EXIT_VERSION_MISMATCH,
            _ => 1,
        }
    }
}
