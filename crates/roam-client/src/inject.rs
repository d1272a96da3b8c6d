//! Network fault injection.
//!
//! The simulator schedules path disruptions but does not know how one is
//! made to happen. Real testbeds hook an external command (interface
//! scripts, nmcli); simulated runs reset the scripted engine in process.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use roam_engine::sim::SimSession;

/// Makes one externally visible path switch happen.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    /// Moves connectivity from `from` onto `to`.
    async fn switch_path(&self, from: &str, to: &str) -> io::Result<()>;
}

/// Runs a configured command with the two interface names appended.
pub struct CommandInjector {
    program: String,
    args: Vec<String>,
}

impl CommandInjector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl FaultInjector for CommandInjector {
    async fn switch_path(&self, from: &str, to: &str) -> io::Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(from)
            .arg(to)
            .status()
            .await?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", self.program, status),
            ));
        }
        debug!(program = %self.program, from, to, "switch command completed");
        Ok(())
    }
}

/// Injector for simulated runs: restarts the scripted engine's sequence
/// space in process, the way a real interface switch would.
pub struct EngineResetInjector {
    session: Arc<SimSession>,
}

impl EngineResetInjector {
    pub fn new(session: Arc<SimSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl FaultInjector for EngineResetInjector {
    async fn switch_path(&self, from: &str, to: &str) -> io::Result<()> {
        info!(from, to, "simulated interface switch");
        self.session.force_path_reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_engine::sim::SimProfile;
    use roam_engine::Session;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn command_injector_reports_exit_status() {
        let ok = CommandInjector::new("true", Vec::new());
        assert!(ok.switch_path("wlan0", "wlan1").await.is_ok());

        let failing = CommandInjector::new("false", Vec::new());
        assert!(failing.switch_path("wlan0", "wlan1").await.is_err());
    }

    #[tokio::test]
    async fn engine_reset_restarts_sequence_space() {
        let session = Arc::new(SimSession::new(SimProfile::new().with_sequence_rate(50)));
        session.connect().await.unwrap();
        sleep(Duration::from_millis(20)).await;
        let before = session.largest_received_sequence().unwrap();

        let injector = EngineResetInjector::new(Arc::clone(&session));
        injector.switch_path("wlan0", "wlan1").await.unwrap();

        let after = session.largest_received_sequence().unwrap();
        assert!(after < before, "reset should regress the raw sequence");
    }
}
