//! Presentation-only run status, computed on read and never persisted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classified status of a run
///
/// Serialized as its plain lowercase name. A persisted terminal status
/// outside the known set survives as [`RunStatusKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatusKind {
    Unknown,
    Running,
    Completed,
    Failed,
    Stale,
    Interrupted,
    /// Terminal status written by another tool, kept verbatim
    Other(String),
}

impl RunStatusKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stale => "stale",
            Self::Interrupted => "interrupted",
            Self::Other(status) => status,
        }
    }

    /// Parse a known status (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unknown" => Some(Self::Unknown),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stale" => Some(Self::Stale),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Known statuses normalize; anything else is kept as written (trimmed)
    pub fn from_terminal(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| Self::Other(value.trim().to_string()))
    }
}

impl From<String> for RunStatusKind {
    fn from(value: String) -> Self {
        Self::from_terminal(&value)
    }
}

impl From<RunStatusKind> for String {
    fn from(kind: RunStatusKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RunStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read model handed to status tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub phase: u32,
    pub phase_name: String,
    pub status: RunStatusKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    pub goal: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<String>,
    pub is_active: bool,
}
