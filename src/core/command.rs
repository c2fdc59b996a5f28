//! Bounded external commands.
//!
//! Small helpers for the git, gate and issue-tracker invocations made
//! around a run. Every call has a time limit and a non-zero exit is an
//! error carrying stderr.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::timefmt::format_duration;

/// Run `program args..` in `cwd`, bounded by `limit`; returns stdout
pub async fn run_command(
    cwd: &Path,
    limit: Duration,
    program: &str,
    args: &[&str],
) -> Result<String> {
    let label = format!("{} {}", program, args.join(" "));
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", label))?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .with_context(|| format!("'{}' timed out after {}", label, format_duration(limit)))?
        .with_context(|| format!("Failed to wait for '{}'", label))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "'{}' failed with exit code {}: {}",
            label,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
