//! Run status classification from possibly stale on-disk signals.
//!
//! Precedence: an explicit terminal status wins, then a vanished worktree
//! (stale), then a phase counter at the schema's terminal phase
//! (completed), then liveness (running). Anything else is unknown.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::core::timefmt::{format_duration, parse_rfc3339};
use crate::domain::{PhasedState, RunStatus, RunStatusKind};

/// Reason given when a run's worktree directory is gone
pub const REASON_WORKTREE_MISSING: &str = "worktree missing";

/// True when the state names a worktree that no longer exists
pub fn worktree_missing(state: &PhasedState) -> bool {
    state
        .worktree_path()
        .map(|path| !Path::new(path).exists())
        .unwrap_or(false)
}

pub fn classify_run_status(state: &PhasedState, is_active: bool) -> RunStatusKind {
    if let Some(terminal) = state.terminal_status() {
        return RunStatusKind::from_terminal(terminal);
    }
    if worktree_missing(state) {
        return RunStatusKind::Stale;
    }
    if state.reached_terminal_phase() {
        return RunStatusKind::Completed;
    }
    if is_active {
        return RunStatusKind::Running;
    }
    RunStatusKind::Unknown
}

pub fn classify_run_reason(state: &PhasedState, is_active: bool) -> String {
    if let Some(reason) = state.terminal_reason() {
        return reason.to_string();
    }
    if !is_active && worktree_missing(state) {
        return REASON_WORKTREE_MISSING.to_string();
    }
    String::new()
}

/// Elapsed wall time from `started_at` to termination (or now)
fn run_elapsed(state: &PhasedState, now: DateTime<Utc>) -> Option<String> {
    let started = parse_rfc3339(&state.started_at)?;
    let end = state
        .terminated_at
        .as_deref()
        .and_then(parse_rfc3339)
        .unwrap_or(now);
    let elapsed = (end - started).to_std().ok()?;
    Some(format_duration(std::time::Duration::from_secs(elapsed.as_secs())))
}

/// Assemble the read model for one run
pub fn build_run_status(
    state: &PhasedState,
    is_active: bool,
    last_heartbeat: Option<DateTime<Utc>>,
) -> RunStatus {
    RunStatus {
        run_id: state.run_id.clone(),
        phase: state.phase,
        phase_name: state.phase_name(),
        status: classify_run_status(state, is_active),
        reason: classify_run_reason(state, is_active),
        epic_id: state.epic_id.clone().filter(|e| !e.trim().is_empty()),
        goal: state.goal.clone(),
        started_at: state.started_at.clone(),
        elapsed: run_elapsed(state, Utc::now()),
        worktree_path: state.worktree_path().map(str::to_string),
        last_heartbeat: last_heartbeat.map(crate::core::timefmt::format_rfc3339_nano),
        is_active,
    }
}
