//! Contract with the external QUIC engine.
//!
//! The protocol engine (handshake, packet framing, congestion control, TLS)
//! lives outside this workspace. This crate defines the surface the
//! migration subsystem consumes: session probes, sequence counters, path
//! validation and migration. A scripted in-process engine backs harness
//! runs and tests.

pub mod error;
pub mod path;
pub mod session;
pub mod sim;

pub use error::{EngineError, ErrorCode, ValidationError};
pub use path::{PacketWriter, Path, PathContext, UdpWriter};
pub use session::{
    Request, Response, SequenceNumber, Session, SessionStats, ValidationOutcome,
};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
