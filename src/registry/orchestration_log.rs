//! Orchestration text log: writer, and the parser used as a discovery
//! fallback when no registry state is available.
//!
//! Line format: `[<RFC3339>] [<run_id>] <stage>: <details>`. Older logs omit
//! the run id bracket; such runs get synthetic ids `anon-1`, `anon-2`, ...
//! in the order their `start` lines appear.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::paths;
use crate::core::timefmt::{format_duration, parse_rfc3339};
use crate::domain::RunStatusKind;

use super::discovery::sibling_run_dirs;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\]\s+(?:\[([^\]]+)\]\s+)?([^:]+):\s+(.*)$")
        .expect("line regex is valid")
});
static GOAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"goal="([^"]*)""#).expect("goal regex is valid"));
static FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"from=(\S+)").expect("from regex is valid"));
static EPIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"epic=(\S+)").expect("epic regex is valid"));
static VERDICTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"verdicts=map\[([^\]]*)\]").expect("verdicts regex is valid"));
static RETRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"attempt\s+(\d+)(?:/(\d+))?").expect("retry regex is valid"));
static INLINE_VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(pre-mortem|post-mortem|vibe)\s+verdict:?\s*(PASS|WARN|FAIL|BLOCKED|PARTIAL)")
        .expect("verdict regex is valid")
});
static COMPLETED_IN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"completed in (\S+)").expect("duration regex is valid"));

// ============================================================================
// Writer
// ============================================================================

/// Appends orchestration lines for one repository
#[derive(Debug, Clone)]
pub struct OrchestrationLog {
    path: PathBuf,
}

impl OrchestrationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The log under `root`'s `.agents/rpi/`
    pub fn for_root(root: &Path) -> Self {
        Self::new(paths::orchestration_log_path(root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[now] [run_id] stage: details` as one write
    pub fn append(&self, run_id: &str, stage: &str, details: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = format!("[{}] [{}] {}: {}\n", ts, run_id, stage, details);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Audit line for the chosen phase backend
    pub fn log_backend_selection(
        &self,
        run_id: &str,
        backend: &str,
        reason: &str,
    ) -> io::Result<()> {
        self.append(
            run_id,
            "backend-selection",
            &format!("backend={} reason={:?}", backend, reason),
        )
    }
}

// ============================================================================
// Parser
// ============================================================================

/// A run reconstructed from log lines
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedRun {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_phase: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    pub verdicts: BTreeMap<String, String>,
    /// Retries per phase (highest attempt seen minus one)
    pub retries: BTreeMap<String, u32>,
    /// `<phase>: completed in <d>` durations
    pub phase_durations: BTreeMap<String, String>,
}

impl LoggedRun {
    fn new(run_id: String, ts: &str) -> Self {
        Self {
            run_id,
            goal: String::new(),
            status: RunStatusKind::Running,
            from_phase: None,
            started_at: ts.to_string(),
            finished_at: None,
            duration: None,
            epic_id: None,
            verdicts: BTreeMap::new(),
            retries: BTreeMap::new(),
            phase_durations: BTreeMap::new(),
        }
    }

    fn finish(&mut self, ts: &str) {
        self.finished_at = Some(ts.to_string());
        if let (Some(start), Some(end)) = (parse_rfc3339(&self.started_at), parse_rfc3339(ts)) {
            if let Ok(elapsed) = (end - start).to_std() {
                self.duration = Some(format_duration(elapsed));
            }
        }
    }
}

fn verdict_key(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

/// Parse a whole log, demultiplexing interleaved runs in first-seen order
pub fn parse_orchestration_log(content: &str) -> Vec<LoggedRun> {
    let mut runs: Vec<LoggedRun> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut anon_counter = 0u32;

    for raw in content.lines() {
        let Some(caps) = LINE_RE.captures(raw.trim_end()) else {
            continue;
        };
        let ts = caps.get(1).map_or("", |m| m.as_str()).trim();
        let stage = caps.get(3).map_or("", |m| m.as_str()).trim();
        let details = caps.get(4).map_or("", |m| m.as_str()).trim();

        let run_id = match caps.get(2) {
            Some(id) => id.as_str().trim().to_string(),
            None if stage == "start" => {
                anon_counter += 1;
                format!("anon-{}", anon_counter)
            }
            None => format!("anon-{}", anon_counter.max(1)),
        };

        let slot = *index.entry(run_id.clone()).or_insert_with(|| {
            runs.push(LoggedRun::new(run_id.clone(), ts));
            runs.len() - 1
        });
        let run = &mut runs[slot];

        match stage {
            "start" => {
                run.started_at = ts.to_string();
                run.goal = GOAL_RE
                    .captures(details)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| details.to_string());
                run.from_phase = FROM_RE
                    .captures(details)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
            }
            "complete" => {
                run.status = RunStatusKind::Completed;
                run.finish(ts);
                if let Some(epic) = EPIC_RE.captures(details).and_then(|c| c.get(1)) {
                    run.epic_id = Some(epic.as_str().to_string());
                }
                if let Some(body) = VERDICTS_RE.captures(details).and_then(|c| c.get(1)) {
                    for pair in body.as_str().split_whitespace() {
                        if let Some((key, value)) = pair.split_once(':') {
                            run.verdicts.insert(key.to_string(), value.to_string());
                        }
                    }
                }
            }
            phase => apply_phase_line(run, phase, details, ts),
        }
    }

    runs
}

fn apply_phase_line(run: &mut LoggedRun, phase: &str, details: &str, ts: &str) {
    if details.starts_with("FAILED:") || details.starts_with("FATAL:") {
        run.status = RunStatusKind::Failed;
        run.finish(ts);
        return;
    }

    if details.starts_with("INTERRUPTED:") {
        run.status = RunStatusKind::Interrupted;
        run.finish(ts);
        return;
    }

    if details.starts_with("RETRY") {
        let entry = run.retries.entry(phase.to_string()).or_insert(0);
        match RETRY_RE
            .captures(details)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            Some(attempt) => *entry = (*entry).max(attempt.saturating_sub(1)),
            None => *entry += 1,
        }
        return;
    }

    if let Some(dur) = COMPLETED_IN_RE.captures(details).and_then(|c| c.get(1)) {
        run.phase_durations
            .insert(phase.to_string(), dur.as_str().to_string());
        return;
    }

    if let Some(caps) = INLINE_VERDICT_RE.captures(details) {
        if let (Some(gate), Some(verdict)) = (caps.get(1), caps.get(2)) {
            run.verdicts
                .insert(verdict_key(gate.as_str()), verdict.as_str().to_ascii_uppercase());
        }
    }
}

/// Parse the repository log plus the logs of sibling run worktrees.
///
/// Runs already seen (by id) in an earlier log are not repeated.
pub fn discover_from_logs(cwd: &Path) -> Vec<LoggedRun> {
    let mut logs = vec![paths::orchestration_log_path(cwd)];
    logs.extend(
        sibling_run_dirs(cwd)
            .iter()
            .map(|dir| paths::orchestration_log_path(dir)),
    );

    let mut seen = HashSet::new();
    let mut runs = Vec::new();
    for log in logs {
        let Ok(content) = fs::read_to_string(&log) else {
            continue;
        };
        for run in parse_orchestration_log(&content) {
            if seen.insert(run.run_id.clone()) {
                runs.push(run);
            }
        }
    }
    runs
}
