//! Configuration for phasewarden.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PHASEWARDEN_RUNTIME_MODE, PHASEWARDEN_RUNTIME_COMMAND,
//!    PHASEWARDEN_LIVE_STATUS, PHASEWARDEN_TMUX_COMMAND, PHASEWARDEN_TRACKER_COMMAND)
//! 2. Config file (.phasewarden/config.yaml, searched upward from the
//!    current directory, then ~/.phasewarden/config.yaml)
//! 3. Built-in defaults
//!
//! Every section and field is optional; missing values take the defaults
//! below. Durations are expressed in whole seconds (or milliseconds where the
//! field name says so); `0` disables a phase window.

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Directory name holding the config file
pub const CONFIG_DIR: &str = ".phasewarden";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub phases: PhaseSettings,
    #[serde(default)]
    pub liveness: LivenessSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub gates: GateSettings,
}

/// Which agent runtime runs phases, and how
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// auto | direct | stream
    pub mode: String,
    /// Agent binary, optionally followed by leading arguments
    pub command: String,
    /// Write the live-status markdown file (also steers `auto` to stream)
    pub live_status: bool,
    /// Retry a phase with the direct backend when streaming never got going
    pub stream_fallback: bool,
    /// Environment variable names (or `PREFIX_` prefixes) removed from children
    pub scrub_env: Vec<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            command: "claude".to_string(),
            live_status: false,
            stream_fallback: true,
            scrub_env: vec!["CLAUDECODE".to_string(), "CLAUDE_CODE_".to_string()],
        }
    }
}

/// Per-phase time windows
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhaseSettings {
    pub phase_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub stream_startup_timeout_secs: u64,
    pub stall_check_interval_secs: u64,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            phase_timeout_secs: 90 * 60,
            stall_timeout_secs: 10 * 60,
            stream_startup_timeout_secs: 45,
            stall_check_interval_secs: 30,
        }
    }
}

impl PhaseSettings {
    fn window(secs: u64) -> Option<Duration> {
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        Self::window(self.phase_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        Self::window(self.stall_timeout_secs)
    }

    pub fn stream_startup_timeout(&self) -> Option<Duration> {
        Self::window(self.stream_startup_timeout_secs)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs.max(1))
    }
}

/// Heartbeat and session-probe bounds for liveness decisions
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    pub heartbeat_window_secs: u64,
    pub probe_timeout_ms: u64,
    pub max_probes: usize,
    pub probe_budget_ms: u64,
    pub tmux_command: String,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            heartbeat_window_secs: 5 * 60,
            probe_timeout_ms: 2_000,
            max_probes: 3,
            probe_budget_ms: 5_000,
            tmux_command: "tmux".to_string(),
        }
    }
}

/// Post-phase gate evidence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Evaluate council reports and epic progress after each phase
    pub enabled: bool,
    /// Issue tracker used to find the planned epic; blank disables lookups
    pub tracker_command: String,
    pub command_timeout_secs: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tracker_command: "bd".to_string(),
            command_timeout_secs: 30,
        }
    }
}

impl GateSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

/// Loop supervisor knobs. Policies stay strings here and are validated by
/// `supervisor::LoopConfig`, so a bad value is reported with its valid set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub failure_policy: String,
    pub gate_policy: String,
    pub landing_policy: String,
    pub cycle_retries: i64,
    pub infra_retries: i64,
    pub retry_backoff_secs: i64,
    pub cycle_delay_secs: i64,
    pub command_timeout_secs: i64,
    pub lease: bool,
    pub lease_ttl_secs: i64,
    pub lease_path: Option<String>,
    pub kill_switch_path: Option<String>,
    pub gate_scripts: Vec<String>,
    pub landing_branch: Option<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            failure_policy: "stop".to_string(),
            gate_policy: "off".to_string(),
            landing_policy: "off".to_string(),
            cycle_retries: 0,
            infra_retries: 2,
            retry_backoff_secs: 30,
            cycle_delay_secs: 0,
            command_timeout_secs: 20 * 60,
            lease: false,
            lease_ttl_secs: 120,
            lease_path: None,
            kill_switch_path: None,
            gate_scripts: Vec::new(),
            landing_branch: None,
        }
    }
}

/// Resolved configuration
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub runtime: RuntimeSettings,
    pub phases: PhaseSettings,
    pub liveness: LivenessSettings,
    pub supervisor: SupervisorSettings,
    pub gates: GateSettings,
}

/// Find config file by searching the current directory and parents, then home
fn find_config_file() -> Option<PathBuf> {
    if let Ok(mut current) = std::env::current_dir() {
        loop {
            let config_path = current.join(CONFIG_DIR).join("config.yaml");
            if config_path.exists() {
                return Some(config_path);
            }
            if !current.pop() {
                break;
            }
        }
    }

    let home_config = dirs::home_dir()?.join(CONFIG_DIR).join("config.yaml");
    home_config.exists().then_some(home_config)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Apply environment overrides through `lookup` (std::env::var in production)
fn apply_env_overrides<F>(config: &mut ResolvedConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(mode) = lookup("PHASEWARDEN_RUNTIME_MODE") {
        config.runtime.mode = mode;
    }
    if let Some(command) = lookup("PHASEWARDEN_RUNTIME_COMMAND") {
        if !command.trim().is_empty() {
            config.runtime.command = command;
        }
    }
    if let Some(flag) = lookup("PHASEWARDEN_LIVE_STATUS") {
        config.runtime.live_status = matches!(
            flag.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
    if let Some(tmux) = lookup("PHASEWARDEN_TMUX_COMMAND") {
        if !tmux.trim().is_empty() {
            config.liveness.tmux_command = tmux;
        }
    }
    if let Some(tracker) = lookup("PHASEWARDEN_TRACKER_COMMAND") {
        config.gates.tracker_command = tracker;
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();

    let mut resolved = match config_file {
        Some(ref path) => {
            let file = load_config_file(path)?;
            ResolvedConfig {
                config_file: Some(path.clone()),
                runtime: file.runtime,
                phases: file.phases,
                liveness: file.liveness,
                supervisor: file.supervisor,
                gates: file.gates,
            }
        }
        None => ResolvedConfig::default(),
    };

    apply_env_overrides(&mut resolved, |key| std::env::var(key).ok());
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ResolvedConfig::default();
        assert_eq!(config.runtime.mode, "auto");
        assert_eq!(config.phases.phase_timeout(), Some(Duration::from_secs(5400)));
        assert_eq!(config.phases.stall_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.liveness.heartbeat_window_secs, 300);
        assert_eq!(config.supervisor.lease_ttl_secs, 120);
        assert_eq!(config.supervisor.command_timeout_secs, 1200);
        assert!(config.gates.enabled);
        assert_eq!(config.gates.tracker_command, "bd");
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
runtime:
  mode: stream
  command: "agent --fast"
phases:
  stall_timeout_secs: 0
supervisor:
  failure_policy: continue
  cycle_retries: 2
gates:
  tracker_command: ""
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version.as_deref(), Some("1"));
        assert_eq!(config.runtime.mode, "stream");
        assert_eq!(config.runtime.command, "agent --fast");
        // Unset fields keep their defaults
        assert!(config.runtime.stream_fallback);
        assert_eq!(config.phases.stall_timeout(), None);
        assert_eq!(config.phases.phase_timeout_secs, 5400);
        assert_eq!(config.supervisor.failure_policy, "continue");
        assert_eq!(config.supervisor.cycle_retries, 2);
        assert_eq!(config.supervisor.gate_policy, "off");
        assert_eq!(config.gates.tracker_command, "");
        assert!(config.gates.enabled);
    }

    #[test]
    fn test_env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("PHASEWARDEN_RUNTIME_MODE", "direct"),
            ("PHASEWARDEN_LIVE_STATUS", "true"),
            ("PHASEWARDEN_TMUX_COMMAND", "/opt/tmux"),
            ("PHASEWARDEN_RUNTIME_COMMAND", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = ResolvedConfig::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.runtime.mode, "direct");
        assert!(config.runtime.live_status);
        assert_eq!(config.liveness.tmux_command, "/opt/tmux");
        // Blank command override is ignored
        assert_eq!(config.runtime.command, "claude");
    }
}
