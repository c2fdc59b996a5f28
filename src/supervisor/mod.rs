//! Loop supervisor: runs repeated autonomous cycles safely.
//!
//! Safety rails around the cycle loop:
//! - a single-instance lease file with a TTL
//! - a kill-switch sentinel checked before every cycle
//! - validated failure, gate and landing policies
//! - task vs infrastructure failure classification, so transient
//!   environment trouble neither burns task retries nor fails queue items

pub mod cycle;
pub mod lease;
pub mod queue;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::{paths, SupervisorSettings};

pub use cycle::{
    CycleContext, CycleFailure, CycleFailureKind, CycleRunner, LoopOptions, LoopSummary,
    PhasedCycleRunner, StopReason, Supervisor,
};
pub use lease::{
    inspect_lease, lease_expired, LeaseError, LeaseMetadata, LeaseStatus, SupervisorLease,
};
pub use queue::{NextWorkEntry, NextWorkItem, NextWorkQueue, QueueSelection};

/// Default landing commit message; `{{cycle}}`, `{{attempt}}` and `{{goal}}` are expanded
pub const DEFAULT_LANDING_MESSAGE: &str = "chore(rpi): autonomous cycle {{cycle}}";

/// Rejected supervisor configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid {field} {value:?} (valid: {valid})")]
    InvalidValue {
        field: &'static str,
        value: String,
        valid: &'static str,
    },

    #[error("{0} must be >= 0")]
    Negative(&'static str),

    #[error("{0} must be > 0 when the lease is enabled")]
    NotPositive(&'static str),
}

/// Supervisor failures that end the loop
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("kill switch path is a directory: {}", .0.display())]
    KillSwitchIsDirectory(PathBuf),

    #[error("check kill switch {}: {source}", path.display())]
    KillSwitchCheck {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cycle {cycle} failed: {failure}")]
    CycleFailed { cycle: u32, failure: CycleFailure },
}

/// What happens after a cycle exhausts its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Stop,
    Continue,
}

impl FailurePolicy {
    pub fn parse(value: &str) -> Result<Self, PolicyError> {
        match value.trim() {
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            other => Err(invalid("failure-policy", other, "stop|continue")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Continue => "continue",
        }
    }
}

/// How gate scripts affect a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePolicy {
    Off,
    /// Run gates, log failures, never fail the cycle
    BestEffort,
    /// Missing or failing gates fail the cycle
    Required,
}

impl GatePolicy {
    pub fn parse(value: &str) -> Result<Self, PolicyError> {
        match value.trim() {
            "off" => Ok(Self::Off),
            "best-effort" => Ok(Self::BestEffort),
            "required" => Ok(Self::Required),
            other => Err(invalid("gate-policy", other, "off|best-effort|required")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::BestEffort => "best-effort",
            Self::Required => "required",
        }
    }
}

/// What the supervisor does with a successful cycle's changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandingPolicy {
    Off,
    Commit,
    SyncPush,
}

impl LandingPolicy {
    pub fn parse(value: &str) -> Result<Self, PolicyError> {
        match value.trim() {
            "off" => Ok(Self::Off),
            "commit" => Ok(Self::Commit),
            "sync-push" => Ok(Self::SyncPush),
            other => Err(invalid("landing-policy", other, "off|commit|sync-push")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Commit => "commit",
            Self::SyncPush => "sync-push",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(FailurePolicy, GatePolicy, LandingPolicy);

fn invalid(field: &'static str, value: &str, valid: &'static str) -> PolicyError {
    PolicyError::InvalidValue {
        field,
        value: value.to_string(),
        valid,
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, PolicyError> {
    u64::try_from(value).map_err(|_| PolicyError::Negative(field))
}

/// Validated supervisor configuration with absolute paths
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub failure_policy: FailurePolicy,
    pub gate_policy: GatePolicy,
    pub landing_policy: LandingPolicy,
    pub cycle_retries: u32,
    pub infra_retries: u32,
    pub retry_backoff: Duration,
    pub cycle_delay: Duration,
    pub command_timeout: Duration,
    pub lease_enabled: bool,
    pub lease_ttl: Duration,
    pub lease_path: PathBuf,
    pub kill_switch_path: PathBuf,
    pub gate_scripts: Vec<PathBuf>,
    pub landing_branch: Option<String>,
    pub landing_message: String,
}

impl LoopConfig {
    /// Validate raw settings; every value is checked before anything runs
    pub fn from_settings(settings: &SupervisorSettings, root: &Path) -> Result<Self, PolicyError> {
        let failure_policy = FailurePolicy::parse(&settings.failure_policy)?;
        let gate_policy = GatePolicy::parse(&settings.gate_policy)?;
        let landing_policy = LandingPolicy::parse(&settings.landing_policy)?;

        let cycle_retries = non_negative("cycle-retries", settings.cycle_retries)?;
        let infra_retries = non_negative("infra-retries", settings.infra_retries)?;
        let retry_backoff = non_negative("retry-backoff", settings.retry_backoff_secs)?;
        let cycle_delay = non_negative("cycle-delay", settings.cycle_delay_secs)?;
        let command_timeout = non_negative("command-timeout", settings.command_timeout_secs)?;
        if settings.lease && settings.lease_ttl_secs <= 0 {
            return Err(PolicyError::NotPositive("lease-ttl"));
        }

        let resolve = |value: &Option<String>, default: PathBuf| match value.as_deref() {
            Some(v) if !v.trim().is_empty() => paths::resolve_under(root, v),
            _ => default,
        };

        Ok(Self {
            failure_policy,
            gate_policy,
            landing_policy,
            cycle_retries: u32::try_from(cycle_retries).unwrap_or(u32::MAX),
            infra_retries: u32::try_from(infra_retries).unwrap_or(u32::MAX),
            retry_backoff: Duration::from_secs(retry_backoff),
            cycle_delay: Duration::from_secs(cycle_delay),
            command_timeout: if command_timeout == 0 {
                Duration::from_secs(SupervisorSettings::default().command_timeout_secs as u64)
            } else {
                Duration::from_secs(command_timeout)
            },
            lease_enabled: settings.lease,
            lease_ttl: Duration::from_secs(settings.lease_ttl_secs.max(1) as u64),
            lease_path: resolve(
                &settings.lease_path,
                root.join(paths::SUPERVISOR_LEASE_FILE),
            ),
            kill_switch_path: resolve(
                &settings.kill_switch_path,
                root.join(paths::KILL_SWITCH_FILE),
            ),
            gate_scripts: settings
                .gate_scripts
                .iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| paths::resolve_under(root, s))
                .collect(),
            landing_branch: settings
                .landing_branch
                .clone()
                .filter(|b| !b.trim().is_empty()),
            landing_message: DEFAULT_LANDING_MESSAGE.to_string(),
        })
    }

    /// Attempts per cycle: the first run plus `cycle_retries`
    pub fn max_cycle_attempts(&self) -> u32 {
        self.cycle_retries.saturating_add(1)
    }

    pub fn should_continue_after_failure(&self) -> bool {
        self.failure_policy == FailurePolicy::Continue
    }
}

/// Whether the kill-switch sentinel exists.
///
/// Only existence matters; a directory at the path is a configuration error.
pub fn kill_switch_engaged(path: &Path) -> Result<bool, SupervisorError> {
    if path.as_os_str().is_empty() {
        return Ok(false);
    }
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            Err(SupervisorError::KillSwitchIsDirectory(path.to_path_buf()))
        }
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SupervisorError::KillSwitchCheck {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Expand the landing commit template
pub fn render_landing_message(template: &str, cycle: u32, attempt: u32, goal: &str) -> String {
    let template = if template.trim().is_empty() {
        DEFAULT_LANDING_MESSAGE
    } else {
        template.trim()
    };
    template
        .replace("{{cycle}}", &cycle.to_string())
        .replace("{{attempt}}", &attempt.to_string())
        .replace("{{goal}}", goal)
}
