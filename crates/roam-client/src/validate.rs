//! Candidate-path validation.

use std::sync::Arc;

use tracing::{debug, warn};

use roam_engine::{PathContext, Session, ValidationError, ValidationOutcome};

/// Drives one challenge/response exchange on a candidate path. The engine
/// owns the probe retry budget and declares the terminal verdict; this
/// wrapper only settles ownership of the candidate afterward.
pub struct PathValidator {
    session: Arc<dyn Session>,
}

impl PathValidator {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }

    /// Challenges the peer on `candidate`. On success the context comes back
    /// for promotion to the active path. On failure the candidate writer is
    /// dropped and the engine is told to abandon its half-open validation
    /// state; the session itself stays up.
    pub async fn validate(&self, candidate: PathContext) -> Result<PathContext, ValidationError> {
        let local = candidate.local();
        match self.session.validate_path(candidate).await {
            ValidationOutcome::Validated(context) => {
                debug!(%local, "path validated");
                Ok(context)
            }
            ValidationOutcome::Failed { context, reason } => {
                warn!(%local, %reason, "path validation failed");
                drop(context);
                self.session.abandon_validation();
                Err(reason)
            }
        }
    }
}
