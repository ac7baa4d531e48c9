//! Resync job launchers
//!
//! The resync job itself (scanning and copying data to the buddy) lives
//! outside this crate; launchers only start it.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{Error, OpsResult, Result};

/// Starts the external resync job
#[async_trait::async_trait]
pub trait ResyncLauncher: Send + Sync {
    /// Start a resync, `Operation(InUse)` if one is already running
    async fn start_resync(&self) -> Result<()>;

    /// Whether a previously started resync is still running
    async fn is_running(&self) -> bool;
}

/// Runs a configured command as the resync job
pub struct CommandResyncLauncher {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl CommandResyncLauncher {
    /// Build from a whitespace separated command line
    pub fn new(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("resync command is empty".into()))?;

        Ok(Self {
            program,
            args: parts.collect(),
            child: Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl ResyncLauncher for CommandResyncLauncher {
    async fn start_resync(&self) -> Result<()> {
        let mut child = self.child.lock().await;

        if let Some(running) = child.as_mut() {
            if running.try_wait()?.is_none() {
                return Err(Error::Operation(OpsResult::InUse));
            }
        }

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(false)
            .spawn()?;

        tracing::info!(
            "Started resync job '{}' (pid {:?})",
            self.program,
            spawned.id()
        );
        *child = Some(spawned);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Launcher used when no resync command is configured
#[derive(Default)]
pub struct LoggingResyncLauncher {
    requests: AtomicU64,
}

impl LoggingResyncLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl ResyncLauncher for LoggingResyncLauncher {
    async fn start_resync(&self) -> Result<()> {
        let count = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            "Buddy needs a resync but no resync command is configured (request #{})",
            count
        );
        Ok(())
    }

    async fn is_running(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(CommandResyncLauncher::new("   "), Err(Error::Config(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_in_use_while_running() {
        let launcher = CommandResyncLauncher::new("sleep 2").unwrap();

        launcher.start_resync().await.unwrap();
        assert!(launcher.is_running().await);
        assert!(matches!(
            launcher.start_resync().await,
            Err(Error::Operation(OpsResult::InUse))
        ));

        if let Some(child) = launcher.child.lock().await.as_mut() {
            child.kill().await.unwrap();
        }
        assert!(!launcher.is_running().await);
    }

    #[tokio::test]
    async fn test_logging_launcher_counts() {
        let launcher = LoggingResyncLauncher::new();
        launcher.start_resync().await.unwrap();
        launcher.start_resync().await.unwrap();
        assert_eq!(launcher.requests(), 2);
        assert!(!launcher.is_running().await);
    }
}
