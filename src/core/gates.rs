//! Post-phase gates.
//!
//! Once a phase's backend exits cleanly, a gate looks at what the phase
//! left behind: the epic the discovery phase planned, council reports with
//! `PASS|WARN|FAIL` verdicts, and how many of the epic's children closed.
//! Missing evidence is logged and tolerated. Only an explicit rejecting
//! verdict fails the phase.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{paths, GateSettings};
use crate::core::command::run_command;
use crate::domain::{GateFailure, PhaseSchema, PhasedState};

static COUNCIL_VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^## Council Verdict:\s*(PASS|WARN|FAIL)")
        .expect("council verdict regex is valid")
});
static EPIC_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*-[a-z0-9][a-z0-9.]*$").expect("epic id regex is valid")
});

/// What a gate learned about one phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateReport {
    /// Epic planned by the phase, when one was found
    pub epic_id: Option<String>,
    /// Verdicts keyed by gate (`pre_mortem`, `vibe`, `post_mortem`)
    pub verdicts: BTreeMap<String, String>,
    /// Set when a verdict rejects the phase
    pub failure: Option<GateFailure>,
}

impl GateReport {
    pub fn with_verdict(mut self, gate: &str, verdict: impl Into<String>) -> Self {
        self.verdicts.insert(gate.to_string(), verdict.into());
        self
    }

    pub fn with_epic(mut self, epic_id: impl Into<String>) -> Self {
        self.epic_id = Some(epic_id.into());
        self
    }

    pub fn rejected(mut self, failure: GateFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Inspects a phase after its backend succeeded
#[async_trait]
pub trait PhaseGate: Send + Sync {
    async fn evaluate(&self, state: &PhasedState, phase: u32) -> GateReport;
}

/// Gate reading council reports under `.agents/council/` and, when a
/// tracker command is configured, the tracker's epic listing
#[derive(Debug, Clone)]
pub struct CouncilGate {
    root: PathBuf,
    tracker_command: Option<String>,
    command_timeout: Duration,
}

impl CouncilGate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tracker_command: None,
            command_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_settings(root: &Path, settings: &GateSettings) -> Self {
        let gate = Self::new(root).with_command_timeout(settings.command_timeout());
        match settings.tracker_command.trim() {
            "" => gate,
            tracker => gate.with_tracker(tracker),
        }
    }

    /// Issue tracker binary (plus leading arguments), e.g. `bd`
    pub fn with_tracker(mut self, command: impl Into<String>) -> Self {
        self.tracker_command = Some(command.into());
        self
    }

    pub fn with_command_timeout(mut self, limit: Duration) -> Self {
        self.command_timeout = limit;
        self
    }

    async fn tracker(&self, args: &[&str]) -> Result<String> {
        let Some(command) = self.tracker_command.as_deref() else {
            bail!("no tracker command configured");
        };
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("tracker command is blank");
        };
        let full: Vec<&str> = parts.chain(args.iter().copied()).collect();
        run_command(&self.root, self.command_timeout, program, &full).await
    }

    /// Most recently created open epic, JSON listing first, text second
    async fn latest_epic(&self) -> Option<String> {
        self.tracker_command.as_ref()?;
        let listing = ["list", "--type", "epic", "--status", "open"];

        let mut json_args = listing.to_vec();
        json_args.push("--json");
        match self.tracker(&json_args).await {
            Ok(out) => match parse_latest_epic_json(&out) {
                Some(epic) => return Some(epic),
                None => debug!("Tracker JSON listing had no epic, trying text"),
            },
            Err(e) => debug!(error = %e, "Tracker JSON listing failed, trying text"),
        }

        match self.tracker(&listing).await {
            Ok(out) => parse_latest_epic_text(&out),
            Err(e) => {
                warn!(error = %e, "Could not list open epics");
                None
            }
        }
    }

    fn council(&self, pattern: &str, epic_id: Option<&str>) -> Option<(String, PathBuf)> {
        let council_dir = paths::council_dir(&self.root);
        let report = find_latest_council_report(&council_dir, pattern, epic_id)?;
        match fs::read_to_string(&report) {
            Ok(text) => match extract_council_verdict(&text) {
                Some(verdict) => Some((verdict, report)),
                None => {
                    warn!(report = %report.display(), "Council report has no verdict");
                    None
                }
            },
            Err(e) => {
                warn!(report = %report.display(), error = %e, "Could not read council report");
                None
            }
        }
    }

    async fn discovery(&self, state: &PhasedState) -> GateReport {
        let mut report = GateReport::default();
        if let Some(epic) = self.latest_epic().await {
            report = report.with_epic(epic);
        }
        let epic = report.epic_id.clone().or_else(|| state.epic_id.clone());

        match self.council("pre-mortem", epic.as_deref()) {
            Some((verdict, path)) => {
                report = report.with_verdict("pre_mortem", &verdict);
                if verdict == "FAIL" {
                    let message = format!("pre-mortem rejected the plan ({})", path.display());
                    report = report.rejected(GateFailure::new(1, verdict, message));
                }
            }
            None => debug!("No pre-mortem council report"),
        }
        report
    }

    async fn implementation(&self, state: &PhasedState) -> GateReport {
        let report = GateReport::default();
        let Some(epic) = state.epic_id.as_deref().filter(|e| !e.trim().is_empty()) else {
            return report;
        };
        if self.tracker_command.is_none() {
            return report;
        }
        match self.tracker(&["children", epic]).await {
            Ok(out) => match parse_crank_completion(&out) {
                status @ ("BLOCKED" | "PARTIAL") => {
                    let message = format!("epic {} children not all closed", epic);
                    report.rejected(GateFailure::new(2, status, message))
                }
                _ => report,
            },
            Err(e) => {
                warn!(%epic, error = %e, "Could not check crank completion");
                report
            }
        }
    }

    fn validation(&self, state: &PhasedState) -> GateReport {
        let mut report = GateReport::default();
        let epic = state.epic_id.as_deref();

        match self.council("vibe", epic) {
            Some((verdict, path)) => {
                report = report.with_verdict("vibe", &verdict);
                if verdict == "FAIL" {
                    let message = format!("vibe rejected the work ({})", path.display());
                    return report.rejected(GateFailure::new(3, verdict, message));
                }
            }
            None => debug!("No vibe council report"),
        }
        if let Some((verdict, _)) = self.council("post-mortem", epic) {
            report = report.with_verdict("post_mortem", verdict);
        }
        report
    }
}

#[async_trait]
impl PhaseGate for CouncilGate {
    async fn evaluate(&self, state: &PhasedState, phase: u32) -> GateReport {
        // Gate numbering only exists for the three-phase schema
        if state.schema() != PhaseSchema::V1 {
            return GateReport::default();
        }
        match phase {
            1 => self.discovery(state).await,
            2 => self.implementation(state).await,
            3 => self.validation(state),
            _ => GateReport::default(),
        }
    }
}

/// `## Council Verdict: PASS|WARN|FAIL` at the start of a line
pub fn extract_council_verdict(report: &str) -> Option<String> {
    COUNCIL_VERDICT_RE
        .captures(report)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Latest `.md` report whose name contains `pattern`, by file name.
/// Reports naming `epic_id` win over the rest when any exist.
pub fn find_latest_council_report(
    council_dir: &Path,
    pattern: &str,
    epic_id: Option<&str>,
) -> Option<PathBuf> {
    let entries = fs::read_dir(council_dir).ok()?;
    let mut matches = Vec::new();
    let mut epic_matches = Vec::new();

    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(pattern) || !name.ends_with(".md") {
            continue;
        }
        if epic_id.is_some_and(|epic| !epic.is_empty() && name.contains(epic)) {
            epic_matches.push(name.clone());
        }
        matches.push(name);
    }

    let mut selected = if epic_matches.is_empty() {
        matches
    } else {
        epic_matches
    };
    selected.sort();
    selected.pop().map(|name| council_dir.join(name))
}

#[derive(Deserialize)]
struct TrackerIssue {
    #[serde(default)]
    id: String,
}

/// Last non-blank id of a JSON issue listing
pub fn parse_latest_epic_json(output: &str) -> Option<String> {
    let issues: Vec<TrackerIssue> = serde_json::from_str(output).ok()?;
    issues
        .iter()
        .rev()
        .map(|issue| issue.id.trim())
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

/// Last issue-like token among the first three fields of any line
pub fn parse_latest_epic_text(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .take(3)
                .map(|field| field.trim_matches(|c: char| matches!(c, '[' | ']' | '(' | ')')))
                .find(|token| EPIC_ID_RE.is_match(token))
        })
        .last()
        .map(str::to_string)
}

/// DONE when every child closed (or there are none), BLOCKED when any
/// child is blocked, PARTIAL otherwise
pub fn parse_crank_completion(output: &str) -> &'static str {
    let mut total = 0;
    let mut closed = 0;
    let mut blocked = 0;
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        total += 1;
        let lower = line.to_lowercase();
        if lower.contains("closed") || lower.contains('✓') {
            closed += 1;
        }
        if lower.contains("blocked") {
            blocked += 1;
        }
    }

    if total == closed {
        "DONE"
    } else if blocked > 0 {
        "BLOCKED"
    } else {
        "PARTIAL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_report(root: &Path, name: &str, verdict: &str) {
        let dir = paths::council_dir(root);
        fs::create_dir_all(&dir).unwrap();
        let body = format!("# Council\n\n## Council Verdict: {}\n", verdict);
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_extract_council_verdict() {
        assert_eq!(
            extract_council_verdict("intro\n## Council Verdict: WARN\n").as_deref(),
            Some("WARN")
        );
        assert_eq!(extract_council_verdict("Council Verdict: PASS"), None);
    }

    #[test]
    fn test_epic_scoped_report_preferred() {
        let temp = TempDir::new().unwrap();
        write_report(temp.path(), "2026-01-01-pre-mortem-ag-abc1.md", "PASS");
        write_report(temp.path(), "2026-02-01-pre-mortem.md", "FAIL");
        let dir = paths::council_dir(temp.path());

        let scoped = find_latest_council_report(&dir, "pre-mortem", Some("ag-abc1")).unwrap();
        assert!(scoped.ends_with("2026-01-01-pre-mortem-ag-abc1.md"));
        let latest = find_latest_council_report(&dir, "pre-mortem", Some("ag-zzz9")).unwrap();
        assert!(latest.ends_with("2026-02-01-pre-mortem.md"));
        assert!(find_latest_council_report(&dir, "vibe", None).is_none());
    }

    #[test]
    fn test_epic_listing_parsers() {
        assert_eq!(
            parse_latest_epic_json(r#"[{"id":"ag-old"},{"id":"ag-new"},{"id":"  "}]"#).as_deref(),
            Some("ag-new")
        );
        assert_eq!(parse_latest_epic_json("not json"), None);

        let text = "ag-1a [epic] first plan\nnoise line\n(bd-9z.2) second plan\n";
        assert_eq!(parse_latest_epic_text(text).as_deref(), Some("bd-9z.2"));
        assert_eq!(parse_latest_epic_text("nothing here"), None);
    }

    #[test]
    fn test_crank_completion() {
        assert_eq!(parse_crank_completion(""), "DONE");
        assert_eq!(parse_crank_completion("ag-1 closed\nag-2 ✓ done\n"), "DONE");
        assert_eq!(parse_crank_completion("ag-1 closed\nag-2 blocked\n"), "BLOCKED");
        assert_eq!(parse_crank_completion("ag-1 closed\nag-2 open\n"), "PARTIAL");
    }

    #[tokio::test]
    async fn test_validation_fail_rejects_phase() {
        let temp = TempDir::new().unwrap();
        write_report(temp.path(), "2026-03-01-vibe.md", "FAIL");
        write_report(temp.path(), "2026-03-01-post-mortem.md", "WARN");

        let state = PhasedState::new("r1", "goal", 3);
        let report = CouncilGate::new(temp.path()).evaluate(&state, 3).await;
        assert_eq!(report.verdicts["vibe"], "FAIL");
        let failure = report.failure.unwrap();
        assert_eq!(failure.phase, 3);
        assert_eq!(failure.verdict, "FAIL");
    }

    #[tokio::test]
    async fn test_missing_evidence_passes() {
        let temp = TempDir::new().unwrap();
        let state = PhasedState::new("r1", "goal", 1);
        let gate = CouncilGate::new(temp.path());
        for phase in 1..=3 {
            assert_eq!(gate.evaluate(&state, phase).await, GateReport::default());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discovery_reads_epic_from_tracker() {
        let temp = TempDir::new().unwrap();
        let tracker = temp.path().join("tracker.sh");
        fs::write(
            &tracker,
            "#!/bin/sh\ncase \"$*\" in *--json*) echo '[{\"id\":\"ag-5k2\"}]';; esac\n",
        )
        .unwrap();
        write_report(temp.path(), "2026-03-01-pre-mortem-ag-5k2.md", "PASS");

        let gate =
            CouncilGate::new(temp.path()).with_tracker(format!("sh {}", tracker.display()));
        let report = gate.evaluate(&PhasedState::new("r1", "goal", 1), 1).await;
        assert_eq!(report.epic_id.as_deref(), Some("ag-5k2"));
        assert_eq!(report.verdicts["pre_mortem"], "PASS");
        assert!(report.failure.is_none());
    }
}
