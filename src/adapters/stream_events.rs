//! Newline-delimited JSON events emitted by a streaming agent runtime,
//! and the per-phase progress folded from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_SYSTEM: &str = "system";
pub const EVENT_INIT: &str = "init";
pub const EVENT_ASSISTANT: &str = "assistant";
pub const EVENT_USER: &str = "user";
pub const EVENT_RESULT: &str = "result";

/// Longest action/error text kept for status display
const SUMMARY_MAX_CHARS: usize = 72;

/// One event from the runtime's stream output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: String,
    /// Plain text, or a message object with `content` blocks and `usage`
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub duration_api_ms: f64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
}

impl StreamEvent {
    /// Parse one line; `None` for blank or malformed lines
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Text carried by `message`, joining text content blocks
    pub fn message_text(&self) -> String {
        match &self.message {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Object(obj)) => match obj.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Array(blocks)) => blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(" "),
                _ => String::new(),
            },
            _ => String::new(),
        }
    }

    /// Tool invoked by this event (flat field or a `tool_use` content block)
    pub fn tool_call(&self) -> Option<String> {
        if !self.tool_name.is_empty() {
            return Some(self.tool_name.clone());
        }
        let blocks = self.message.as_ref()?.get("content")?.as_array()?;
        blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
            .find_map(|b| b.get("name").and_then(Value::as_str))
            .map(str::to_string)
    }

    /// Input + output tokens reported in `message.usage`
    pub fn token_usage(&self) -> u64 {
        let usage = match self.message.as_ref().and_then(|m| m.get("usage")) {
            Some(usage) => usage,
            None => return 0,
        };
        ["input_tokens", "output_tokens"]
            .iter()
            .filter_map(|key| usage.get(*key).and_then(Value::as_u64))
            .sum()
    }
}

/// Running view of one phase, rendered into the live-status table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseProgress {
    pub name: String,
    pub session_id: String,
    pub model: String,
    pub last_tool_call: String,
    pub current_action: String,
    pub retry_count: u32,
    pub last_error: String,
    pub tool_count: u32,
    pub turn_count: u32,
    pub tokens: u64,
    pub cost_usd: f64,
    pub elapsed: Duration,
    pub last_update: Option<DateTime<Utc>>,
}

impl PhaseProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fold one event into the progress view
    pub fn apply(&mut self, event: &StreamEvent) {
        self.tokens += event.token_usage();

        match event.kind.as_str() {
            EVENT_INIT => {
                self.session_id = event.session_id.clone();
                self.model = event.model.clone();
                self.current_action = "initialized".to_string();
            }
            EVENT_SYSTEM if event.subtype == EVENT_INIT => {
                self.session_id = event.session_id.clone();
                self.model = event.model.clone();
                self.current_action = "initialized".to_string();
            }
            EVENT_ASSISTANT => {
                if let Some(tool) = event.tool_call() {
                    self.tool_count += 1;
                    self.current_action = format!("tool: {}", tool);
                    self.last_tool_call = tool;
                } else {
                    let text = event.message_text();
                    if !text.trim().is_empty() {
                        self.current_action = summarize(&text);
                    }
                }
            }
            EVENT_RESULT => {
                self.cost_usd = event.cost_usd;
                self.turn_count = event.num_turns;
                if event.duration_ms > 0.0 {
                    self.elapsed = Duration::from_secs_f64(event.duration_ms / 1000.0);
                }
                if event.is_error {
                    self.current_action = "result error".to_string();
                    let text = event.message_text();
                    self.last_error = if text.trim().is_empty() {
                        "result event reported error".to_string()
                    } else {
                        summarize(&text)
                    };
                } else {
                    self.current_action = "result received".to_string();
                }
            }
            _ => {}
        }
    }
}

/// Collapse whitespace and cap at 72 characters (with `...`)
pub fn summarize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SUMMARY_MAX_CHARS {
        return collapsed;
    }
    let head: String = collapsed.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    format!("{}...", head)
}
