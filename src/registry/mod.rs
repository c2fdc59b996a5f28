//! Run registry: per-run state and heartbeat files.
//!
//! Each run owns `.agents/rpi/runs/<run_id>/` with `phased-state.json` and
//! `heartbeat.txt`. The driver also mirrors state into the legacy flat file
//! `.agents/rpi/phased-state.json` for older readers. All writes are atomic.
//!
//! - `liveness`: heartbeat + session probe decision
//! - `status`: status/reason classification and the read model
//! - `discovery`: search roots, registry-first discovery, run lookup
//! - `orchestration_log`: text log writer and fallback parser

pub mod discovery;
pub mod liveness;
pub mod orchestration_log;
pub mod status;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::paths;
use crate::core::atomic::{write_file_atomic, write_json_atomic};
use crate::core::ledger::validate_run_id;
use crate::core::timefmt;
use crate::domain::{PhasedState, RunStatus};

pub use discovery::{collect_search_roots, discover_runs, locate_run_metadata, RunDiscovery};
pub use liveness::{determine_run_liveness, LivenessConfig, SessionProbe, TmuxProbe};
pub use status::{build_run_status, classify_run_reason, classify_run_status};

/// Errors from registry reads and writes
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("run {0} not found in registry or flat state")]
    NotFound(String),

    #[error("run {requested} not found (flat state contains run {found})")]
    FlatStateMismatch { requested: String, found: String },

    #[error("run_id contains invalid path elements: {0:?}")]
    InvalidRunId(String),

    #[error("read run state {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse run state {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Persist state to the run's registry entry and the legacy flat file
pub fn save_phased_state(root: &Path, state: &PhasedState) -> Result<(), RegistryError> {
    validate_run_id(&state.run_id).map_err(|_| RegistryError::InvalidRunId(state.run_id.clone()))?;

    write_json_atomic(&paths::run_state_path(root, &state.run_id), state)?;
    write_json_atomic(&paths::flat_state_path(root), state)?;
    debug!(run_id = %state.run_id, phase = state.phase, "Saved run state");
    Ok(())
}

/// Rewrite the run's heartbeat with the current UTC time
pub fn write_heartbeat(root: &Path, run_id: &str) -> Result<(), RegistryError> {
    validate_run_id(run_id).map_err(|_| RegistryError::InvalidRunId(run_id.to_string()))?;
    let line = format!("{}\n", timefmt::now_rfc3339_nano());
    write_file_atomic(&paths::heartbeat_path(root, run_id), line.as_bytes())?;
    Ok(())
}

/// Last heartbeat, if present and parseable
pub fn read_heartbeat(root: &Path, run_id: &str) -> Option<DateTime<Utc>> {
    let raw = fs::read_to_string(paths::heartbeat_path(root, run_id)).ok()?;
    timefmt::parse_rfc3339(raw.trim())
}

/// Read and parse one state file
pub fn read_state_file(path: &Path) -> Result<PhasedState, RegistryError> {
    let data = fs::read(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// State files of every registry entry under `root`
fn registry_state_files(root: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(paths::runs_dir(root)) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path().join(paths::STATE_FILE_NAME))
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

/// Most recent state for `root`: the newest registry entry by mtime, unless
/// the legacy flat file is strictly newer.
pub fn load_phased_state(root: &Path) -> Result<Option<PhasedState>, RegistryError> {
    let newest_registry = registry_state_files(root)
        .into_iter()
        .filter_map(|path| modified(&path).map(|mtime| (mtime, path)))
        .max_by_key(|(mtime, _)| *mtime);

    let flat_path = paths::flat_state_path(root);
    let flat_mtime = modified(&flat_path);

    if let Some((registry_mtime, registry_path)) = newest_registry {
        let registry_wins = flat_mtime.map(|flat| registry_mtime >= flat).unwrap_or(true);
        if registry_wins {
            match read_state_file(&registry_path) {
                Ok(state) => return Ok(Some(state)),
                Err(err) => warn!(error = %err, "Skipping unreadable registry state"),
            }
        }
    }

    if flat_mtime.is_none() {
        return Ok(None);
    }
    read_state_file(&flat_path).map(Some)
}

/// Raw registry entries under `root`, skipping unreadable ones and entries
/// without a run id
pub fn load_registry_states(root: &Path) -> Vec<PhasedState> {
    registry_state_files(root)
        .into_iter()
        .filter_map(|path| match read_state_file(&path) {
            Ok(state) if !state.run_id.trim().is_empty() => Some(state),
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, "Skipping registry entry");
                None
            }
        })
        .collect()
}

/// Classified status of every registry entry under `root`
pub async fn scan_registry_runs(
    root: &Path,
    config: &LivenessConfig,
    probe: &dyn SessionProbe,
) -> Vec<RunStatus> {
    let mut runs = Vec::new();
    for state in load_registry_states(root) {
        let is_active = determine_run_liveness(root, &state, config, probe).await;
        runs.push(build_run_status(
            &state,
            is_active,
            read_heartbeat(root, &state.run_id),
        ));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_writes_registry_and_flat() {
        let temp = TempDir::new().unwrap();
        let state = PhasedState::new("abc123", "ship it", 1);
        save_phased_state(temp.path(), &state).unwrap();

        let registry = read_state_file(&paths::run_state_path(temp.path(), "abc123")).unwrap();
        let flat = read_state_file(&paths::flat_state_path(temp.path())).unwrap();
        assert_eq!(registry, state);
        assert_eq!(flat, state);
    }

    #[test]
    fn test_save_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let state = PhasedState::new("../evil", "goal", 1);
        assert!(matches!(
            save_phased_state(temp.path(), &state),
            Err(RegistryError::InvalidRunId(_))
        ));
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let temp = TempDir::new().unwrap();
        assert!(read_heartbeat(temp.path(), "abc").is_none());

        write_heartbeat(temp.path(), "abc").unwrap();
        let raw = fs::read_to_string(paths::heartbeat_path(temp.path(), "abc")).unwrap();
        assert!(raw.ends_with("Z\n"));
        let beat = read_heartbeat(temp.path(), "abc").unwrap();
        assert!((Utc::now() - beat).num_seconds() < 5);
    }

    #[test]
    fn test_load_phased_state_none_when_empty() {
        let temp = TempDir::new().unwrap();
        assert!(load_phased_state(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_registry_skips_entries_without_run_id() {
        let temp = TempDir::new().unwrap();
        let dir = paths::run_registry_dir(temp.path(), "blank");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(paths::STATE_FILE_NAME), r#"{"goal":"x"}"#).unwrap();
        let broken = paths::run_registry_dir(temp.path(), "broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(paths::STATE_FILE_NAME), "{nope").unwrap();

        save_phased_state(temp.path(), &PhasedState::new("good", "g", 1)).unwrap();

        let states = load_registry_states(temp.path());
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].run_id, "good");
    }
}
