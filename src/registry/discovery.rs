//! Registry-first run discovery across the repository and its run worktrees.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::paths;
use crate::domain::{RunStatus, RunStatusKind};

use super::liveness::{determine_run_liveness, LivenessConfig, SessionProbe};
use super::status::build_run_status;
use super::{read_heartbeat, read_state_file, scan_registry_runs, RegistryError};

/// Bound on `git worktree list`
const GIT_WORKTREE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs split by whether they are currently running
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunDiscovery {
    pub active: Vec<RunStatus>,
    /// Everything else, `unknown` included
    pub historical: Vec<RunStatus>,
}

impl RunDiscovery {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.historical.is_empty()
    }
}

/// Worktree roots reported by git (empty outside a repository)
async fn git_worktree_roots(cwd: &Path) -> Vec<PathBuf> {
    let output = Command::new("git")
        .arg("-C")
        .arg(cwd)
        .args(["worktree", "list", "--porcelain"])
        .kill_on_drop(true)
        .output();

    match timeout(GIT_WORKTREE_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(|path| PathBuf::from(path.trim()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Sibling directories named `<repo>-rpi-*` next to `cwd`
pub fn sibling_run_dirs(cwd: &Path) -> Vec<PathBuf> {
    let (Some(parent), Some(name)) = (cwd.parent(), cwd.file_name()) else {
        return Vec::new();
    };
    let pattern = parent.join(format!(
        "{}-rpi-*",
        glob::Pattern::escape(&name.to_string_lossy())
    ));

    match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_dir())
            .collect(),
        Err(err) => {
            debug!(error = %err, "Invalid sibling glob");
            Vec::new()
        }
    }
}

/// `cwd`, git worktrees and sibling run directories, deduplicated
pub async fn collect_search_roots(cwd: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![cwd.to_path_buf()];
    candidates.extend(git_worktree_roots(cwd).await);
    candidates.extend(sibling_run_dirs(cwd));

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|root| {
            let key = root.canonicalize().unwrap_or_else(|_| root.clone());
            seen.insert(key)
        })
        .collect()
}

/// Discover runs across all search roots, preferring the registry.
///
/// The legacy flat state files are consulted only when no registry entry
/// exists anywhere.
pub async fn discover_runs(
    cwd: &Path,
    config: &LivenessConfig,
    probe: &dyn SessionProbe,
) -> RunDiscovery {
    let roots = collect_search_roots(cwd).await;
    let mut seen = HashSet::new();
    let mut runs = Vec::new();

    for root in &roots {
        for run in scan_registry_runs(root, config, probe).await {
            if seen.insert(run.run_id.clone()) {
                runs.push(run);
            }
        }
    }

    if runs.is_empty() {
        for root in &roots {
            let flat = paths::flat_state_path(root);
            if !flat.is_file() {
                continue;
            }
            let state = match read_state_file(&flat) {
                Ok(state) if !state.run_id.trim().is_empty() => state,
                _ => continue,
            };
            if !seen.insert(state.run_id.clone()) {
                continue;
            }
            let is_active = determine_run_liveness(root, &state, config, probe).await;
            runs.push(build_run_status(
                &state,
                is_active,
                read_heartbeat(root, &state.run_id),
            ));
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    let (active, historical) = runs
        .into_iter()
        .partition(|run| run.status == RunStatusKind::Running);
    RunDiscovery { active, historical }
}

/// Find one run's state: registry across all roots, then the flat file.
///
/// Returns the state and the root it was found under.
pub async fn locate_run_metadata(
    cwd: &Path,
    run_id: &str,
) -> Result<(crate::domain::PhasedState, PathBuf), RegistryError> {
    crate::core::ledger::validate_run_id(run_id)
        .map_err(|_| RegistryError::InvalidRunId(run_id.to_string()))?;

    for root in collect_search_roots(cwd).await {
        let path = paths::run_state_path(&root, run_id);
        if path.is_file() {
            return Ok((read_state_file(&path)?, root));
        }
    }

    let flat = paths::flat_state_path(cwd);
    if flat.is_file() {
        let state = read_state_file(&flat)?;
        if state.run_id == run_id {
            return Ok((state, cwd.to_path_buf()));
        }
        if !state.run_id.trim().is_empty() {
            return Err(RegistryError::FlatStateMismatch {
                requested: run_id.to_string(),
                found: state.run_id,
            });
        }
    }

    Err(RegistryError::NotFound(run_id.to_string()))
}
