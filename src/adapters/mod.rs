//! Phase execution backends.
//!
//! A backend runs one phase of a run as a subprocess of the agent runtime
//! and reports a typed terminal outcome. Two strategies exist:
//! - `DirectBackend`: one blocking subprocess bounded by the phase timeout
//! - `StreamBackend`: parses the runtime's JSON event stream with separate
//!   startup, stall and overall windows, and keeps a live-status file
//!
//! [`select_backend`] decides between them from capabilities alone.

pub mod direct;
pub mod live_status;
pub mod stream;
pub mod stream_events;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::{PhaseSettings, ResolvedConfig};
use crate::core::timefmt::format_duration;
use crate::domain::FailureReason;

pub use direct::DirectBackend;
pub use stream::StreamBackend;
pub use stream_events::{PhaseProgress, StreamEvent};

/// What a backend needs to run one phase
#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub run_id: String,
    /// 1-based phase number
    pub phase: u32,
    pub phase_name: String,
    pub prompt: String,
    /// Working directory for the runtime subprocess
    pub cwd: PathBuf,
}

/// Terminal failure of one phase
#[derive(Debug, Error)]
pub enum PhaseFailure {
    #[error("phase {phase} (timeout) timed out after {} (set phase_timeout_secs to increase)", window(.after))]
    Timeout { phase: u32, after: Duration },

    #[error("phase {phase} (stall): stall detected: no stream activity for {}", window(.idle))]
    Stall { phase: u32, idle: Duration },

    #[error("phase {phase} (startup): stream startup timeout: no events received after {}", window(.after))]
    StartupTimeout { phase: u32, after: Duration },

    #[error("phase {phase} (startup): stream startup timeout: stream completed without parseable events")]
    EmptyStream { phase: u32 },

    #[error("phase {phase}: stream parse error: {source}")]
    StreamRead {
        phase: u32,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with code {} (exit_error)", exit_code(.code))]
    ExitError { command: String, code: Option<i32> },

    #[error("{command} execution failed: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{stream}; direct fallback also failed: {direct}")]
    FallbackFailed {
        stream: Box<PhaseFailure>,
        direct: Box<PhaseFailure>,
    },
}

fn window(d: &Duration) -> String {
    format_duration(*d)
}

fn exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

impl PhaseFailure {
    /// Typed reason used for retry and gate decisions
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Timeout { .. } => FailureReason::Timeout,
            Self::Stall { .. } => FailureReason::Stall,
            Self::StartupTimeout { .. } | Self::EmptyStream { .. } => FailureReason::StartupTimeout,
            Self::ExitError { .. } => FailureReason::ExitError,
            Self::StreamRead { .. } | Self::Spawn { .. } => FailureReason::Unknown,
            Self::FallbackFailed { direct, .. } => direct.reason(),
        }
    }

    /// Streaming never got going (or went silent); a direct run may still work
    pub fn warrants_direct_fallback(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout { .. }
                | Self::EmptyStream { .. }
                | Self::StreamRead { .. }
                | Self::Stall { .. }
        )
    }
}

/// Runs one phase and reports its terminal outcome
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Backend name recorded in state and logs
    fn name(&self) -> &str;

    /// Run the phase to completion, blocking until it ends or a window trips
    async fn execute(&self, request: &PhaseRequest) -> Result<(), PhaseFailure>;
}

/// Requested runtime strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    #[default]
    Auto,
    Direct,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid runtime {0:?} (valid: auto|direct|stream)")]
pub struct InvalidRuntimeMode(pub String);

impl RuntimeMode {
    /// Case-insensitive; blank means auto
    pub fn parse(value: &str) -> Result<Self, InvalidRuntimeMode> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "direct" => Ok(Self::Direct),
            "stream" => Ok(Self::Stream),
            _ => Err(InvalidRuntimeMode(value.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Direct => "direct",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to backend selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub live_status_enabled: bool,
    pub runtime_mode: RuntimeMode,
    pub runtime_command: String,
}

impl BackendCapabilities {
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, InvalidRuntimeMode> {
        Ok(Self {
            live_status_enabled: config.runtime.live_status,
            runtime_mode: RuntimeMode::parse(&config.runtime.mode)?,
            runtime_command: config.runtime.command.clone(),
        })
    }
}

/// The two concrete strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Direct,
    Stream,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Stream => "stream",
        }
    }
}

/// Pick a backend kind and explain why
pub fn select_backend(caps: &BackendCapabilities) -> (BackendKind, String) {
    match caps.runtime_mode {
        RuntimeMode::Stream => (BackendKind::Stream, "runtime=stream".to_string()),
        RuntimeMode::Direct => (BackendKind::Direct, "runtime=direct".to_string()),
        RuntimeMode::Auto if caps.live_status_enabled => (
            BackendKind::Stream,
            "runtime=auto live-status enabled".to_string(),
        ),
        RuntimeMode::Auto => (
            BackendKind::Direct,
            "runtime=auto live-status disabled".to_string(),
        ),
    }
}

/// Per-phase windows; `None` disables a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub phase_timeout: Option<Duration>,
    pub stall_timeout: Option<Duration>,
    pub startup_timeout: Option<Duration>,
    pub check_interval: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self::from(&PhaseSettings::default())
    }
}

impl From<&PhaseSettings> for PhaseTimeouts {
    fn from(settings: &PhaseSettings) -> Self {
        Self {
            phase_timeout: settings.phase_timeout(),
            stall_timeout: settings.stall_timeout(),
            startup_timeout: settings.stream_startup_timeout(),
            check_interval: settings.stall_check_interval(),
        }
    }
}

/// Everything besides capabilities that a backend is built from
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub timeouts: PhaseTimeouts,
    /// Live-status markdown path (stream backend only)
    pub live_status_path: Option<PathBuf>,
    /// Names of phases shown in the live-status table
    pub phase_names: Vec<String>,
    pub stream_fallback: bool,
    /// Variables (or `PREFIX_` prefixes) removed from the child environment
    pub scrub_env: Vec<String>,
}

/// Build the executor chosen by [`select_backend`]
pub fn select_executor(
    caps: &BackendCapabilities,
    options: &ExecutorOptions,
) -> (Box<dyn PhaseExecutor>, String) {
    let (kind, reason) = select_backend(caps);
    let direct = DirectBackend::new(&caps.runtime_command)
        .with_phase_timeout(options.timeouts.phase_timeout)
        .with_scrubbed_env(options.scrub_env.clone());

    let executor: Box<dyn PhaseExecutor> = match kind {
        BackendKind::Direct => Box::new(direct),
        BackendKind::Stream => {
            let mut stream = StreamBackend::new(&caps.runtime_command, options.timeouts.clone())
                .with_scrubbed_env(options.scrub_env.clone())
                .with_phase_names(options.phase_names.clone());
            if let Some(path) = &options.live_status_path {
                stream = stream.with_live_status(path.clone());
            }
            if options.stream_fallback {
                stream = stream.with_direct_fallback(direct);
            }
            Box::new(stream)
        }
    };
    (executor, reason)
}

/// Build the runtime command: configured program plus leading args, then `args`
pub(crate) fn runtime_command(
    runtime: &str,
    args: &[&str],
    cwd: &Path,
    scrub_env: &[String],
) -> Result<Command, PhaseFailure> {
    let mut parts = runtime.split_whitespace();
    let program = parts.next().ok_or_else(|| PhaseFailure::Spawn {
        command: runtime.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "runtime command is empty"),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(parts).args(args).current_dir(cwd).kill_on_drop(true);

    for (key, _) in std::env::vars_os() {
        let key = key.to_string_lossy();
        let scrub = scrub_env.iter().any(|pattern| {
            if pattern.ends_with('_') {
                key.starts_with(pattern.as_str())
            } else {
                key == pattern.as_str()
            }
        });
        if scrub {
            cmd.env_remove(&*key);
        }
    }
    Ok(cmd)
}

/// First word of the runtime command, for messages
pub(crate) fn command_label(runtime: &str) -> String {
    runtime
        .split_whitespace()
        .next()
        .unwrap_or(runtime)
        .to_string()
}
