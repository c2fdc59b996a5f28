//! Persisted run state (registry entries and the legacy flat file).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::timefmt;

/// Schema written by this crate; selects the three-phase vocabulary
pub const PHASED_STATE_SCHEMA_VERSION: u32 = 1;

/// Phase-name vocabulary selected by `schema_version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSchema {
    /// discovery / implementation / validation
    V1,
    /// research / plan / pre-mortem / crank / vibe / post-mortem
    Legacy,
}

const V1_PHASES: [&str; 3] = ["discovery", "implementation", "validation"];
const LEGACY_PHASES: [&str; 6] = [
    "research",
    "plan",
    "pre-mortem",
    "crank",
    "vibe",
    "post-mortem",
];

impl PhaseSchema {
    pub fn for_version(schema_version: u32) -> Self {
        if schema_version >= 1 {
            Self::V1
        } else {
            Self::Legacy
        }
    }

    fn names(self) -> &'static [&'static str] {
        match self {
            Self::V1 => &V1_PHASES,
            Self::Legacy => &LEGACY_PHASES,
        }
    }

    /// Last phase number; a run whose phase reaches it has finished
    pub fn terminal_phase(self) -> u32 {
        self.names().len() as u32
    }

    /// Name of a 1-based phase number (`phase-N` when out of range)
    pub fn phase_name(self, phase: u32) -> String {
        phase
            .checked_sub(1)
            .and_then(|idx| self.names().get(idx as usize))
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("phase-{}", phase))
    }

    /// Reverse lookup accepting a name or a bare number
    pub fn phase_number(self, name: &str) -> Option<u32> {
        let name = name.trim().to_ascii_lowercase();
        if let Ok(n) = name.parse::<u32>() {
            return (1..=self.terminal_phase()).contains(&n).then_some(n);
        }
        self.names()
            .iter()
            .position(|candidate| *candidate == name)
            .map(|idx| idx as u32 + 1)
    }
}

/// One run's persisted state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasedState {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub epic_id: Option<String>,
    /// Current 1-based phase
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub start_phase: u32,
    #[serde(default)]
    pub cycle: u32,
    #[serde(default)]
    pub verdicts: BTreeMap<String, String>,
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<String>,
}

impl PhasedState {
    /// Fresh state for a run starting at `start_phase`
    pub fn new(run_id: impl Into<String>, goal: impl Into<String>, start_phase: u32) -> Self {
        Self {
            schema_version: PHASED_STATE_SCHEMA_VERSION,
            run_id: run_id.into(),
            goal: goal.into(),
            phase: start_phase,
            start_phase,
            cycle: 1,
            started_at: timefmt::now_rfc3339_nano(),
            orchestrator_pid: Some(std::process::id()),
            ..Default::default()
        }
    }

    pub fn with_worktree(mut self, path: impl Into<String>) -> Self {
        self.worktree_path = Some(path.into());
        self
    }

    pub fn schema(&self) -> PhaseSchema {
        PhaseSchema::for_version(self.schema_version)
    }

    pub fn phase_name(&self) -> String {
        self.schema().phase_name(self.phase)
    }

    /// Exactly at the schema's last phase; an out-of-range counter is not completion
    pub fn reached_terminal_phase(&self) -> bool {
        self.phase == self.schema().terminal_phase()
    }

    pub fn terminal_status(&self) -> Option<&str> {
        non_blank(&self.terminal_status)
    }

    pub fn terminal_reason(&self) -> Option<&str> {
        non_blank(&self.terminal_reason)
    }

    pub fn worktree_path(&self) -> Option<&str> {
        non_blank(&self.worktree_path)
    }

    /// Record a terminal outcome (failed, interrupted, ...)
    pub fn mark_terminal(&mut self, status: &str, reason: impl Into<String>) {
        self.terminal_status = Some(status.to_string());
        self.terminal_reason = Some(reason.into());
        self.terminated_at = Some(timefmt::now_rfc3339_nano());
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
