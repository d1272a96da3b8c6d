use std::sync::Arc;
use std::time::Instant;

use roam_core::RunConfig;
use tokio_util::sync::CancellationToken;

/// Per-run state handed to every component at construction: the run start
/// instant, the immutable configuration and the cancellation token. Clones
/// share the same run.
#[derive(Debug, Clone)]
pub struct RunContext {
    started: Instant,
    config: Arc<RunConfig>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        Self {
            started: Instant::now(),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Milliseconds since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Token observed by every background actor at each suspension point.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
