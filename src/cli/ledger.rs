//! Ledger CLI subcommands.
//!
//! Provides commands to:
//! - `ledger append`: append one record to the hash-chained ledger
//! - `verify`: check the whole chain and print a one-line verdict
//! - `cache`: materialize a run's cache file from the ledger

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::Value;

use crate::core::ledger::Ledger;

/// Ledger-related subcommands
#[derive(Subcommand, Debug)]
pub enum LedgerCommands {
    /// Append one record
    Append {
        #[arg(long)]
        run_id: String,

        #[arg(long)]
        phase: String,

        #[arg(long)]
        action: String,

        /// Details as a JSON value (objects are stored with sorted keys)
        #[arg(long)]
        details: Option<String>,
    },
}

/// Execute ledger subcommands
pub fn execute(root: &Path, command: LedgerCommands) -> Result<()> {
    match command {
        LedgerCommands::Append {
            run_id,
            phase,
            action,
            details,
        } => execute_append(root, &run_id, &phase, &action, details.as_deref()),
    }
}

fn execute_append(
    root: &Path,
    run_id: &str,
    phase: &str,
    action: &str,
    details: Option<&str>,
) -> Result<()> {
    let details = details
        .map(|raw| serde_json::from_str::<Value>(raw))
        .transpose()
        .context("Failed to parse --details as JSON")?;

    let ledger = Ledger::new(root);
    let record = ledger
        .append(run_id, phase, action, details)
        .with_context(|| format!("Failed to append to ledger: {}", ledger.path().display()))?;

    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}

/// Verify the chain; returns whether it passed.
///
/// A corrupt ledger is reported, never raised.
pub fn execute_verify(root: &Path, json: bool) -> Result<bool> {
    let report = Ledger::new(root).verify();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary_line());
    }
    Ok(report.pass)
}

/// Write `.agents/rpi/runs/<run_id>.json` from the ledger
pub fn execute_cache(root: &Path, run_id: &str) -> Result<()> {
    let ledger = Ledger::new(root);
    let (path, cache) = ledger
        .materialize_run_cache(run_id)
        .with_context(|| format!("Failed to materialize run cache for {}", run_id))?;

    println!("Run cache: {}", path.display());
    println!("  Events:  {}", cache.event_count);
    println!("  Latest:  {}", cache.latest.action);
    println!("  Updated: {}", cache.updated_at);
    Ok(())
}
