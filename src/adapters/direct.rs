//! Direct backend: one blocking runtime subprocess per phase.
//!
//! Spawns `<runtime> -p <prompt>` with inherited stdout/stderr and waits for
//! it, bounded by the phase timeout. There is no progress signal, so only
//! timeout and non-zero exit are distinguished.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use super::{command_label, runtime_command, PhaseExecutor, PhaseFailure, PhaseRequest};

/// Runs a phase as a single subprocess
#[derive(Debug, Clone)]
pub struct DirectBackend {
    /// Runtime command, optionally with leading arguments
    command: String,
    phase_timeout: Option<Duration>,
    scrub_env: Vec<String>,
}

impl DirectBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            phase_timeout: None,
            scrub_env: Vec::new(),
        }
    }

    pub fn with_phase_timeout(mut self, phase_timeout: Option<Duration>) -> Self {
        self.phase_timeout = phase_timeout;
        self
    }

    pub fn with_scrubbed_env(mut self, scrub_env: Vec<String>) -> Self {
        self.scrub_env = scrub_env;
        self
    }
}

#[async_trait]
impl PhaseExecutor for DirectBackend {
    fn name(&self) -> &str {
        "direct"
    }

    #[instrument(skip(self, request), fields(run_id = %request.run_id, phase = request.phase))]
    async fn execute(&self, request: &PhaseRequest) -> Result<(), PhaseFailure> {
        let label = command_label(&self.command);
        let mut cmd = runtime_command(
            &self.command,
            &["-p", &request.prompt],
            &request.cwd,
            &self.scrub_env,
        )?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|source| PhaseFailure::Spawn {
            command: label.clone(),
            source,
        })?;
        info!(backend = "direct", pid = ?child.id(), "Phase subprocess started");

        let waited = match self.phase_timeout {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?limit, "Phase timed out, killing subprocess");
                    let _ = child.kill().await;
                    return Err(PhaseFailure::Timeout {
                        phase: request.phase,
                        after: limit,
                    });
                }
            },
            None => child.wait().await,
        };

        let status = waited.map_err(|source| PhaseFailure::Spawn {
            command: label.clone(),
            source,
        })?;
        if !status.success() {
            return Err(PhaseFailure::ExitError {
                command: label,
                code: status.code(),
            });
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::FailureReason;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> PhaseRequest {
        PhaseRequest {
            run_id: "r1".into(),
            phase: 1,
            phase_name: "discovery".into(),
            prompt: "do it".into(),
            cwd: dir.path().to_path_buf(),
        }
    }

    fn script(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("runtime.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        format!("sh {}", path.display())
    }

    #[tokio::test]
    async fn test_direct_success_receives_prompt() {
        let dir = TempDir::new().unwrap();
        let command = script(&dir, r#"[ "$1" = "-p" ] && [ "$2" = "do it" ] || exit 9"#);
        DirectBackend::new(command).execute(&request(&dir)).await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let command = script(&dir, "exit 4");
        let err = DirectBackend::new(command)
            .execute(&request(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::ExitError);
        assert_eq!(err.to_string(), "sh exited with code 4 (exit_error)");
    }

    #[tokio::test]
    async fn test_direct_timeout() {
        let dir = TempDir::new().unwrap();
        let command = script(&dir, "sleep 5");
        let err = DirectBackend::new(command)
            .with_phase_timeout(Some(Duration::from_millis(200)))
            .execute(&request(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::Timeout);
    }

    #[tokio::test]
    async fn test_direct_missing_binary() {
        let dir = TempDir::new().unwrap();
        let err = DirectBackend::new("/nonexistent/runtime-binary")
            .execute(&request(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::Unknown);
    }
}
