use std::fmt;

use thiserror::Error;

/// Close/transport error taxonomy surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    InvalidVersion,
    PeerGoingAway,
    NetworkUnreachable,
    ResourceUnavailable,
    RoutingTableMiss,
    Internal,
}

impl ErrorCode {
    /// Errors the request loop recovers from by reconnecting instead of
    /// failing the run.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkUnreachable
                | ErrorCode::ResourceUnavailable
                | ErrorCode::RoutingTableMiss
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCode::None => "no error",
            ErrorCode::InvalidVersion => "invalid version",
            ErrorCode::PeerGoingAway => "peer going away",
            ErrorCode::NetworkUnreachable => "network unreachable",
            ErrorCode::ResourceUnavailable => "resource temporarily unavailable",
            ErrorCode::RoutingTableMiss => "routing table miss",
            ErrorCode::Internal => "internal error",
        };
        f.write_str(label)
    }
}

/// Errors reported by the engine across the session contract.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed: {code}")]
    Closed { code: ErrorCode },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("path error: {0}")]
    Path(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Error code carried by this failure, [`ErrorCode::Internal`] when the
    /// failure does not map onto the close taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Closed { code } => *code,
            _ => ErrorCode::Internal,
        }
    }
}

/// Terminal failure of a path-validation attempt.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("challenge response timed out")]
    TimedOut,
    #[error("challenge rejected by peer")]
    Rejected,
    #[error("connection lost during validation")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(ErrorCode::NetworkUnreachable.is_transient());
        assert!(ErrorCode::ResourceUnavailable.is_transient());
        assert!(ErrorCode::RoutingTableMiss.is_transient());
        assert!(!ErrorCode::InvalidVersion.is_transient());
        assert!(!ErrorCode::PeerGoingAway.is_transient());
        assert!(!ErrorCode::None.is_transient());
    }

    #[test]
    fn closed_error_carries_code() {
        let err = EngineError::Closed {
            code: ErrorCode::PeerGoingAway,
        };
        assert_eq!(err.code(), ErrorCode::PeerGoingAway);
        assert_eq!(err.to_string(), "connection closed: peer going away");
    }
}
