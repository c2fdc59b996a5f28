//! Canonical on-disk layout for runs, relative to a repository root.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use phasewarden::config::paths;
//!
//! let ledger = paths::ledger_path(&repo_root);
//! let state = paths::run_state_path(&repo_root, "a1b2c3d4e5f6");
//! ```
//!
//! ## Layout
//!
//! | Location | Writer | Purpose |
//! |----------|--------|---------|
//! | `.agents/ledger/rpi-events.jsonl` | phase driver, `ledger append` | Hash-chained event ledger |
//! | `.agents/rpi/runs/<run_id>.json` | `cache` | Derived per-run cache |
//! | `.agents/rpi/runs/<run_id>/` | phase driver | Registry entry (state + heartbeat) |
//! | `.agents/rpi/phased-state.json` | phase driver | Legacy flat state |
//! | `.agents/rpi/phased-orchestration.log` | phase driver | Text log, discovery fallback |
//! | `.agents/rpi/supervisor.lock` | supervisor | Single-instance lease |
//! | `.agents/rpi/KILL` | operator | Kill switch sentinel |
//! | `.agents/council/*.md` | agent runtime | Gate verdict reports |

use std::path::{Path, PathBuf};

// ============================================================================
// Fixed relative locations
// ============================================================================

/// Ledger file, relative to the repository root
pub const LEDGER_FILE: &str = ".agents/ledger/rpi-events.jsonl";

/// Suffix appended to the ledger path to name its lock file
pub const LEDGER_LOCK_SUFFIX: &str = ".lock";

/// Directory holding run caches and per-run registry entries
pub const RUNS_DIR: &str = ".agents/rpi/runs";

/// State file name inside a registry entry (and the legacy flat file name)
pub const STATE_FILE_NAME: &str = "phased-state.json";

/// Heartbeat file name inside a registry entry
pub const HEARTBEAT_FILE_NAME: &str = "heartbeat.txt";

/// Legacy single-run state file
pub const FLAT_STATE_FILE: &str = ".agents/rpi/phased-state.json";

/// Orchestration text log
pub const ORCHESTRATION_LOG: &str = ".agents/rpi/phased-orchestration.log";

/// Live status markdown written by the streaming backend
pub const LIVE_STATUS_FILE: &str = ".agents/rpi/live-status.md";

pub const SUPERVISOR_LEASE_FILE: &str = ".agents/rpi/supervisor.lock";
pub const KILL_SWITCH_FILE: &str = ".agents/rpi/KILL";
pub const NEXT_WORK_FILE: &str = ".agents/rpi/next-work.jsonl";

/// Council reports written by the agent's review skills
pub const COUNCIL_DIR: &str = ".agents/council";

// ============================================================================
// Resolved paths
// ============================================================================

pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(LEDGER_FILE)
}

/// Lock file guarding ledger appends (the ledger path plus `.lock`)
pub fn ledger_lock_path(root: &Path) -> PathBuf {
    let mut name = ledger_path(root).into_os_string();
    name.push(LEDGER_LOCK_SUFFIX);
    PathBuf::from(name)
}

pub fn council_dir(root: &Path) -> PathBuf {
    root.join(COUNCIL_DIR)
}

pub fn runs_dir(root: &Path) -> PathBuf {
    root.join(RUNS_DIR)
}

/// Cache file for one run (`<run_id>.json`)
pub fn run_cache_path(root: &Path, run_id: &str) -> PathBuf {
    runs_dir(root).join(format!("{}.json", run_id))
}

/// Registry entry directory for one run
pub fn run_registry_dir(root: &Path, run_id: &str) -> PathBuf {
    runs_dir(root).join(run_id)
}

pub fn run_state_path(root: &Path, run_id: &str) -> PathBuf {
    run_registry_dir(root, run_id).join(STATE_FILE_NAME)
}

pub fn heartbeat_path(root: &Path, run_id: &str) -> PathBuf {
    run_registry_dir(root, run_id).join(HEARTBEAT_FILE_NAME)
}

pub fn flat_state_path(root: &Path) -> PathBuf {
    root.join(FLAT_STATE_FILE)
}

pub fn orchestration_log_path(root: &Path) -> PathBuf {
    root.join(ORCHESTRATION_LOG)
}

pub fn live_status_path(root: &Path) -> PathBuf {
    root.join(LIVE_STATUS_FILE)
}

pub fn next_work_path(root: &Path) -> PathBuf {
    root.join(NEXT_WORK_FILE)
}

/// Resolve an operator-supplied path (absolute, or relative to `root`)
pub fn resolve_under(root: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

// ============================================================================
// Tests
// ============================================================================
