//! Next-work queue (`.agents/rpi/next-work.jsonl`).
//!
//! One JSON entry per line, each carrying harvested work items. The loop
//! takes the highest-severity item from entries that are neither consumed
//! nor failed, then marks its entry. Entry indices count parseable lines
//! only; blank and malformed lines never get an index and are preserved
//! verbatim on rewrite.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::paths;
use crate::core::atomic::write_file_atomic;

/// One harvested work item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextWorkItem {
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    /// high | medium | low
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_repo: Option<String>,
}

impl NextWorkItem {
    /// Items without a target (or targeting `*`) match every repository
    pub fn matches_repo(&self, filter: Option<&str>) -> bool {
        match (filter, self.target_repo.as_deref()) {
            (None, _) | (_, None) | (_, Some("")) | (_, Some("*")) => true,
            (Some(filter), Some(target)) => filter.is_empty() || filter == target,
        }
    }
}

/// One queue line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextWorkEntry {
    #[serde(default)]
    pub source_epic: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub items: Vec<NextWorkItem>,
    #[serde(default)]
    pub consumed: bool,
    #[serde(default)]
    pub consumed_by: Option<String>,
    #[serde(default)]
    pub consumed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    /// Fields written by other tools, kept on rewrite
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NextWorkEntry {
    pub fn is_eligible(&self) -> bool {
        !self.consumed && self.failed_at.is_none() && !self.items.is_empty()
    }
}

/// The item picked for a cycle and the entry to mark afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSelection {
    pub item: NextWorkItem,
    /// 0-based index among parseable entries
    pub entry_index: usize,
}

fn severity_rank(severity: &str) -> u8 {
    match severity {
        "high" => 3,
        "medium" => 2,
        "low" => 1,
        _ => 0,
    }
}

fn stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone)]
pub struct NextWorkQueue {
    path: PathBuf,
}

impl NextWorkQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::new(paths::next_work_path(root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Eligible entries with their parseable-line index; a missing file is empty
    pub fn eligible_entries(&self) -> io::Result<Vec<(usize, NextWorkEntry)>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        let mut index = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<NextWorkEntry>(line) {
                Ok(entry) => {
                    if entry.is_eligible() {
                        entries.push((index, entry));
                    }
                    index += 1;
                }
                Err(e) => debug!(error = %e, "Skipping malformed queue line"),
            }
        }
        Ok(entries)
    }

    /// Highest-severity eligible item; ties keep queue order
    pub fn select(&self, repo_filter: Option<&str>) -> io::Result<Option<QueueSelection>> {
        let mut candidates: Vec<QueueSelection> = self
            .eligible_entries()?
            .into_iter()
            .flat_map(|(entry_index, entry)| {
                entry
                    .items
                    .into_iter()
                    .filter(|item| item.matches_repo(repo_filter))
                    .map(move |item| QueueSelection { item, entry_index })
            })
            .collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(severity_rank(&c.item.severity)));
        Ok(candidates.into_iter().next())
    }

    /// Mark an entry consumed (clearing any earlier failure)
    pub fn mark_consumed(&self, entry_index: usize, consumed_by: &str) -> io::Result<()> {
        if !self.path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("next-work queue not found: {}", self.path.display()),
            ));
        }
        let now = stamp();
        self.rewrite(entry_index, |entry| {
            entry.consumed = true;
            entry.consumed_at = Some(now.clone());
            entry.consumed_by = Some(consumed_by.to_string());
            entry.failed_at = None;
        })
    }

    /// Record `failed_at` without consuming; clearing it makes the entry eligible again
    pub fn mark_failed(&self, entry_index: usize) -> io::Result<()> {
        let now = stamp();
        self.rewrite(entry_index, |entry| entry.failed_at = Some(now.clone()))
    }

    fn rewrite<F>(&self, target: usize, mut transform: F) -> io::Result<()>
    where
        F: FnMut(&mut NextWorkEntry),
    {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut out = String::with_capacity(content.len() + 64);
        let mut index = 0;
        for line in content.lines() {
            if line.trim().is_empty() {
                out.push_str(line);
                out.push('\n');
                continue;
            }
            match serde_json::from_str::<NextWorkEntry>(line) {
                Ok(mut entry) => {
                    if index == target {
                        transform(&mut entry);
                        out.push_str(&serde_json::to_string(&entry)?);
                    } else {
                        out.push_str(line);
                    }
                    index += 1;
                }
                Err(_) => out.push_str(line),
            }
            out.push('\n');
        }
        write_file_atomic(&self.path, out.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const QUEUE: &str = r#"{"source_epic":"ep-1","items":[{"title":"low thing","severity":"low"}],"consumed":true}
not json at all
{"source_epic":"ep-2","items":[{"title":"medium thing","severity":"medium"},{"title":"other repo","severity":"high","target_repo":"elsewhere"}],"consumed":false,"owner":"harvester"}

{"source_epic":"ep-3","items":[{"title":"urgent","severity":"high","target_repo":"*"}],"consumed":false}
"#;

    fn queue(temp: &TempDir) -> NextWorkQueue {
        let q = NextWorkQueue::for_root(temp.path());
        fs::create_dir_all(q.path().parent().unwrap()).unwrap();
        fs::write(q.path(), QUEUE).unwrap();
        q
    }

    #[test]
    fn test_missing_queue_is_empty() {
        let temp = TempDir::new().unwrap();
        let q = NextWorkQueue::for_root(temp.path());
        assert!(q.select(None).unwrap().is_none());
        q.mark_failed(0).unwrap();
        assert!(q.mark_consumed(0, "loop").is_err());
    }

    #[test]
    fn test_select_prefers_severity_and_honors_repo_filter() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);

        // Unfiltered: "other repo" (high, entry 1) wins over "urgent" (high, entry 2)
        let pick = q.select(None).unwrap().unwrap();
        assert_eq!(pick.item.title, "other repo");
        assert_eq!(pick.entry_index, 1);

        let pick = q.select(Some("here")).unwrap().unwrap();
        assert_eq!(pick.item.title, "urgent");
        assert_eq!(pick.entry_index, 2);
    }

    #[test]
    fn test_mark_failed_then_consumed() {
        let temp = TempDir::new().unwrap();
        let q = queue(&temp);

        q.mark_failed(2).unwrap();
        let pick = q.select(Some("here")).unwrap().unwrap();
        assert_eq!(pick.item.title, "medium thing");

        q.mark_consumed(1, "phasewarden-loop").unwrap();
        assert!(q.select(Some("here")).unwrap().is_none());

        let content = fs::read_to_string(q.path()).unwrap();
        assert!(content.contains("not json at all"));
        assert!(content.contains("\"owner\":\"harvester\""));
        assert!(content.contains("\"consumed_by\":\"phasewarden-loop\""));
        assert_eq!(content.lines().count(), QUEUE.lines().count());
    }
}
