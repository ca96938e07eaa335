//! Engine process transport.
//!
//! Spawns the recording engine with piped standard streams. stdin/stdout carry
//! the line protocol; stderr is forwarded into tracing when verbose logging is on.

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::EngineConfig;
use crate::logging::ENGINE_LOG_TARGET;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("engine binary not found: {0}")]
    MissingBinary(std::path::PathBuf),
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different engine launch strategies.
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self, config: &EngineConfig) -> Result<Child, SpawnError>;
}

/// Launches `config.binary_path` directly.
pub struct BinarySpawner;

impl EngineSpawner for BinarySpawner {
    fn spawn(&self, config: &EngineConfig) -> Result<Child, SpawnError> {
        if !config.binary_path.exists() {
            return Err(SpawnError::MissingBinary(config.binary_path.clone()));
        }

        let child = Command::new(&config.binary_path)
            .args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// A running engine process with its protocol streams detached.
pub struct EngineProcess {
    child: Child,
}

/// The protocol half of a spawned engine.
pub struct EngineStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl EngineProcess {
    /// Spawn via the configured spawner and take ownership of its pipes.
    pub fn start(config: &EngineConfig) -> Result<(Self, EngineStreams), SpawnError> {
        tracing::info!(
            binary = %config.binary_path.display(),
            verbose = config.verbose_logging,
            "Spawning engine process"
        );

        let mut child = config.spawner.spawn(config)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, config.verbose_logging));
        }

        tracing::debug!(pid = ?child.id(), "Engine process started");
        Ok((Self { child }, EngineStreams { stdin, stdout }))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        if status.success() {
            tracing::info!(%status, "Engine process exited");
        } else {
            tracing::warn!(%status, "Engine process exited abnormally");
        }
        Ok(status)
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Drain stderr so the engine never blocks on a full pipe.
async fn forward_stderr(stderr: ChildStderr, verbose: bool) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if verbose && !line.is_empty() {
                    tracing::info!(target: ENGINE_LOG_TARGET, stream = "stderr", "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Engine stderr read failed");
                break;
            }
        }
    }
    tracing::debug!("Engine stderr closed");
}
