//! Human-readable live status table for a streaming run.

use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::Local;

use crate::core::atomic::write_file_atomic;
use crate::core::timefmt::format_duration;

use super::stream_events::{summarize, PhaseProgress};

/// Render the markdown table. `current` is the 0-based running phase.
pub fn render_live_status(phases: &[PhaseProgress], current: usize) -> String {
    let mut out = String::from("# Live Status\n\n");
    out.push_str(
        "| Phase | Status | Elapsed | Tools | Tokens | Cost | Action | Retries | Last Error | Updated |\n",
    );
    out.push_str(
        "|-------|--------|---------|-------|--------|------|--------|---------|------------|---------|\n",
    );

    for (idx, phase) in phases.iter().enumerate() {
        let status = match idx.cmp(&current) {
            std::cmp::Ordering::Less => "done",
            std::cmp::Ordering::Equal => "running",
            std::cmp::Ordering::Greater => "pending",
        };
        let elapsed = format_duration(Duration::from_secs(phase.elapsed.as_secs()));
        let updated = phase
            .last_update
            .map(|ts| ts.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | ${:.4} | {} | {} | {} | {} |\n",
            phase.name,
            status,
            elapsed,
            phase.tool_count,
            phase.tokens,
            phase.cost_usd,
            cell(&phase.current_action),
            phase.retry_count,
            cell(&phase.last_error),
            updated,
        ));
    }
    out
}

/// Write the table atomically so watchers never see a torn file
pub fn write_live_status(path: &Path, phases: &[PhaseProgress], current: usize) -> io::Result<()> {
    write_file_atomic(path, render_live_status(phases, current).as_bytes())
}

fn cell(value: &str) -> String {
    let cleaned = summarize(&value.replace('|', "/"));
    if cleaned.is_empty() {
        "-".to_string()
    } else {
        cleaned
    }
}
