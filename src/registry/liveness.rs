//! Liveness: heartbeat freshness first, bounded session probing second.
//!
//! A run whose worktree vanished is never alive. A heartbeat inside the
//! watchdog window is enough on its own. Otherwise a terminal-multiplexer
//! session bound to the run is probed, each probe time-boxed and the whole
//! probe sequence capped, so status queries cannot hang.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::LivenessSettings;
use crate::domain::PhasedState;

use super::read_heartbeat;

/// Bounds for one liveness decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    pub heartbeat_window: Duration,
    pub probe_timeout: Duration,
    pub max_probes: usize,
    pub probe_budget: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self::from(&LivenessSettings::default())
    }
}

impl From<&LivenessSettings> for LivenessConfig {
    fn from(settings: &LivenessSettings) -> Self {
        Self {
            heartbeat_window: Duration::from_secs(settings.heartbeat_window_secs),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            max_probes: settings.max_probes,
            probe_budget: Duration::from_millis(settings.probe_budget_ms),
        }
    }
}

/// What the cheap signals say before any probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Worktree is gone; nothing else matters
    Dead,
    /// Fresh heartbeat
    Alive,
    /// Heartbeat absent or stale; ask the probe
    NeedsProbe,
}

pub fn heartbeat_verdict(
    worktree_exists: bool,
    heartbeat_age: Option<Duration>,
    window: Duration,
) -> HeartbeatVerdict {
    if !worktree_exists {
        return HeartbeatVerdict::Dead;
    }
    match heartbeat_age {
        Some(age) if age <= window => HeartbeatVerdict::Alive,
        _ => HeartbeatVerdict::NeedsProbe,
    }
}

/// Combine heartbeat age, worktree presence and an optional probe result.
/// `probe_result` only matters when the heartbeat cannot decide; callers
/// pass `None` to skip probing entirely.
pub fn decide_liveness(
    heartbeat_age: Option<Duration>,
    worktree_exists: bool,
    probe_result: Option<bool>,
    window: Duration,
) -> bool {
    match heartbeat_verdict(worktree_exists, heartbeat_age, window) {
        HeartbeatVerdict::Dead => false,
        HeartbeatVerdict::Alive => true,
        HeartbeatVerdict::NeedsProbe => probe_result.unwrap_or(false),
    }
}

/// Checks whether a named session is alive
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn session_alive(&self, session: &str) -> bool;
}

/// Session names a run may be bound to, in probe order
pub fn session_names(run_id: &str, max_probes: usize) -> Vec<String> {
    (1..=3)
        .take(max_probes)
        .map(|phase| format!("rpi-{}-p{}", run_id, phase))
        .collect()
}

/// `tmux has-session -t <name>`
#[derive(Debug, Clone)]
pub struct TmuxProbe {
    command: String,
}

impl TmuxProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for TmuxProbe {
    fn default() -> Self {
        Self::new("tmux")
    }
}

#[async_trait]
impl SessionProbe for TmuxProbe {
    async fn session_alive(&self, session: &str) -> bool {
        Command::new(&self.command)
            .args(["has-session", "-t", session])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Probe the run's sessions within the per-probe and overall bounds
pub async fn probe_run_sessions(
    probe: &dyn SessionProbe,
    run_id: &str,
    config: &LivenessConfig,
) -> bool {
    let sequence = async {
        for session in session_names(run_id, config.max_probes) {
            match timeout(config.probe_timeout, probe.session_alive(&session)).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => debug!(%session, "Session probe timed out"),
            }
        }
        false
    };

    timeout(config.probe_budget, sequence).await.unwrap_or(false)
}

/// Decide whether the run recorded in `state` (registry under `root`) is alive
pub async fn determine_run_liveness(
    root: &Path,
    state: &PhasedState,
    config: &LivenessConfig,
    probe: &dyn SessionProbe,
) -> bool {
    let worktree_exists = state
        .worktree_path()
        .map(|path| Path::new(path).exists())
        .unwrap_or(true);
    let heartbeat_age = read_heartbeat(root, &state.run_id)
        .map(|beat| (Utc::now() - beat).to_std().unwrap_or(Duration::ZERO));

    let probe_result =
        match heartbeat_verdict(worktree_exists, heartbeat_age, config.heartbeat_window) {
            HeartbeatVerdict::NeedsProbe => {
                Some(probe_run_sessions(probe, &state.run_id, config).await)
            }
            HeartbeatVerdict::Dead | HeartbeatVerdict::Alive => None,
        };
    decide_liveness(
        heartbeat_age,
        worktree_exists,
        probe_result,
        config.heartbeat_window,
    )
}
