//! Command-line interface for phasewarden.
//!
//! Thin operator surface over the library: start a run, inspect run status,
//! verify and extend the ledger, and drive the supervisor loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};

use crate::config::{self, paths, ResolvedConfig};
use crate::core::orchestrator::{resolve_start_phase, DriverOptions, PhaseDriver};
use crate::core::timefmt::format_duration;
use crate::domain::RunStatus;
use crate::registry::orchestration_log::{discover_from_logs, LoggedRun};
use crate::registry::{
    build_run_status, determine_run_liveness, discover_runs, locate_run_metadata, read_heartbeat,
    LivenessConfig, RunDiscovery, TmuxProbe,
};
use crate::supervisor::{
    inspect_lease, LeaseStatus, LoopConfig, LoopOptions, PhasedCycleRunner, StopReason, Supervisor,
};

pub mod ledger;

/// phasewarden - durable ledger and liveness supervisor for phased agent runs
#[derive(Parser, Debug)]
#[command(name = "phasewarden")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a goal through the phases
    Run {
        goal: String,

        /// Phase to start from (name or number)
        #[arg(long, default_value = "discovery")]
        from: String,

        /// Runtime mode override: auto | direct | stream
        #[arg(long)]
        runtime: Option<String>,

        /// Executions per phase before the run fails
        #[arg(long, default_value = "1")]
        max_phase_attempts: u32,
    },

    /// Show active and recent runs (or one run)
    Status {
        /// Only this run
        run_id: Option<String>,

        #[arg(long)]
        json: bool,

        /// Redraw whenever the run registry changes
        #[arg(long)]
        watch: bool,
    },

    /// Verify the ledger hash chain (exit code 1 on failure)
    Verify {
        #[arg(long)]
        json: bool,
    },

    /// Ledger operations
    Ledger {
        #[command(subcommand)]
        command: ledger::LedgerCommands,
    },

    /// Materialize a run's cache file from the ledger
    Cache { run_id: String },

    /// Repeat supervised cycles from the next-work queue (or one explicit goal)
    Loop {
        goal: Option<String>,

        /// 0 = until the queue is empty
        #[arg(long, default_value = "0")]
        max_cycles: u32,

        #[arg(long)]
        failure_policy: Option<String>,

        #[arg(long)]
        gate_policy: Option<String>,

        #[arg(long)]
        landing_policy: Option<String>,

        #[arg(long, allow_hyphen_values = true)]
        cycle_retries: Option<i64>,

        #[arg(long, allow_hyphen_values = true)]
        infra_retries: Option<i64>,

        /// Seconds between cycle attempts
        #[arg(long, allow_hyphen_values = true)]
        retry_backoff: Option<i64>,

        /// Seconds between cycles
        #[arg(long, allow_hyphen_values = true)]
        cycle_delay: Option<i64>,

        /// Hold the single-instance supervisor lease
        #[arg(long)]
        lease: bool,

        #[arg(long, allow_hyphen_values = true)]
        lease_ttl: Option<i64>,

        /// Only take queue items targeting this repository
        #[arg(long)]
        repo_filter: Option<String>,
    },

    /// Show who holds the supervisor lease
    Lease,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let root = std::env::current_dir().context("Failed to get working directory")?;
        let cfg = config::config()?;

        match self.command {
            Commands::Run {
                goal,
                from,
                runtime,
                max_phase_attempts,
            } => run_goal(&root, cfg, &goal, &from, runtime, max_phase_attempts).await,
            Commands::Status {
                run_id,
                json,
                watch,
            } => {
                if watch {
                    watch_status(&root, cfg, json).await
                } else {
                    show_status(&root, cfg, run_id.as_deref(), json).await
                }
            }
            Commands::Verify { json } => {
                if !ledger::execute_verify(&root, json)? {
                    std::process::exit(1);
                }
                Ok(())
            }
            Commands::Ledger { command } => ledger::execute(&root, command),
            Commands::Cache { run_id } => ledger::execute_cache(&root, &run_id),
            Commands::Loop {
                goal,
                max_cycles,
                failure_policy,
                gate_policy,
                landing_policy,
                cycle_retries,
                infra_retries,
                retry_backoff,
                cycle_delay,
                lease,
                lease_ttl,
                repo_filter,
            } => {
                let mut settings = cfg.supervisor.clone();
                if let Some(v) = failure_policy {
                    settings.failure_policy = v;
                }
                if let Some(v) = gate_policy {
                    settings.gate_policy = v;
                }
                if let Some(v) = landing_policy {
                    settings.landing_policy = v;
                }
                if let Some(v) = cycle_retries {
                    settings.cycle_retries = v;
                }
                if let Some(v) = infra_retries {
                    settings.infra_retries = v;
                }
                if let Some(v) = retry_backoff {
                    settings.retry_backoff_secs = v;
                }
                if let Some(v) = cycle_delay {
                    settings.cycle_delay_secs = v;
                }
                if let Some(v) = lease_ttl {
                    settings.lease_ttl_secs = v;
                }
                settings.lease |= lease;

                let options = LoopOptions {
                    goal,
                    max_cycles,
                    repo_filter,
                };
                run_loop(&root, cfg, LoopConfig::from_settings(&settings, &root)?, options).await
            }
            Commands::Lease => show_lease(&root, cfg),
            Commands::Config => show_config(cfg),
        }
    }
}

fn build_driver(root: &Path, cfg: &ResolvedConfig, max_phase_attempts: u32) -> Result<PhaseDriver> {
    let driver = PhaseDriver::from_config(root, cfg)?;
    Ok(driver.with_options(DriverOptions {
        max_phase_attempts,
        ..Default::default()
    }))
}

/// Run one goal through the phases
async fn run_goal(
    root: &Path,
    cfg: &ResolvedConfig,
    goal: &str,
    from: &str,
    runtime: Option<String>,
    max_phase_attempts: u32,
) -> Result<()> {
    if goal.trim().is_empty() {
        anyhow::bail!("Goal is empty");
    }
    let start_phase = resolve_start_phase(from)?;

    let mut cfg = cfg.clone();
    if let Some(mode) = runtime {
        cfg.runtime.mode = mode;
    }
    let driver = build_driver(root, &cfg, max_phase_attempts)?;
    eprintln!("Backend: {}", driver.backend_name());

    let state = driver.start(goal, start_phase).await?;
    eprintln!(
        "\n[Run {} completed: epic={}]",
        state.run_id,
        state.epic_id.as_deref().unwrap_or("none")
    );
    Ok(())
}

/// Drive the supervisor loop
async fn run_loop(
    root: &Path,
    cfg: &ResolvedConfig,
    loop_config: LoopConfig,
    options: LoopOptions,
) -> Result<()> {
    let driver = build_driver(root, cfg, 1)?;
    let runner = PhasedCycleRunner::new(driver, loop_config.clone());
    let summary = Supervisor::new(root, loop_config, runner, options).run().await?;

    let why = match summary.stop {
        StopReason::MaxCycles => "reached max cycles",
        StopReason::QueueEmpty => "no unconsumed work in queue",
        StopReason::ExplicitGoalDone => "explicit goal completed",
        StopReason::KillSwitch => "kill switch engaged",
    };
    println!(
        "Loop finished after {} cycle(s): {} completed, {} failed ({})",
        summary.executed_cycles, summary.completed, summary.failed, why
    );
    Ok(())
}

fn print_runs(title: &str, runs: &[RunStatus]) {
    if runs.is_empty() {
        return;
    }
    println!("{}:", title);
    println!(
        "  {:<14} {:<16} {:<12} {:<10} {}",
        "RUN ID", "PHASE", "STATUS", "ELAPSED", "GOAL"
    );
    for run in runs {
        let mut status = run.status.to_string();
        if !run.reason.is_empty() {
            status = format!("{} ({})", status, run.reason);
        }
        println!(
            "  {:<14} {:<16} {:<12} {:<10} {}",
            run.run_id,
            run.phase_name,
            status,
            run.elapsed.as_deref().unwrap_or("-"),
            run.goal
        );
    }
    println!();
}

fn print_logged_runs(runs: &[LoggedRun]) {
    println!("From orchestration log:");
    for run in runs {
        println!(
            "  {:<14} {:<12} {:<10} {}",
            run.run_id,
            run.status.to_string(),
            run.duration.as_deref().unwrap_or("-"),
            run.goal
        );
    }
}

/// Registry first; the orchestration log when nothing is registered
async fn render_status(root: &Path, cfg: &ResolvedConfig, json: bool) -> Result<()> {
    let liveness = LivenessConfig::from(&cfg.liveness);
    let probe = TmuxProbe::new(&cfg.liveness.tmux_command);
    let discovery: RunDiscovery = discover_runs(root, &liveness, &probe).await;

    if !discovery.is_empty() {
        if json {
            println!("{}", serde_json::to_string_pretty(&discovery)?);
        } else {
            print_runs("Active runs", &discovery.active);
            print_runs("Recent runs", &discovery.historical);
        }
        return Ok(());
    }

    let logged = discover_from_logs(root);
    if json {
        println!("{}", serde_json::to_string_pretty(&logged)?);
    } else if logged.is_empty() {
        println!("No runs found");
    } else {
        print_logged_runs(&logged);
    }
    Ok(())
}

async fn show_status(
    root: &Path,
    cfg: &ResolvedConfig,
    run_id: Option<&str>,
    json: bool,
) -> Result<()> {
    let Some(run_id) = run_id else {
        return render_status(root, cfg, json).await;
    };

    let (state, run_root) = locate_run_metadata(root, run_id).await?;
    let liveness = LivenessConfig::from(&cfg.liveness);
    let probe = TmuxProbe::new(&cfg.liveness.tmux_command);
    let is_active = determine_run_liveness(&run_root, &state, &liveness, &probe).await;
    let status = build_run_status(&state, is_active, read_heartbeat(&run_root, &state.run_id));

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("Run ID:    {}", status.run_id);
    println!("Goal:      {}", status.goal);
    println!("Phase:     {} ({})", status.phase, status.phase_name);
    println!("Status:    {}", status.status);
    if !status.reason.is_empty() {
        println!("Reason:    {}", status.reason);
    }
    if let Some(epic) = &status.epic_id {
        println!("Epic:      {}", epic);
    }
    println!("Started:   {}", status.started_at);
    if let Some(heartbeat) = &status.last_heartbeat {
        println!("Heartbeat: {}", heartbeat);
    }
    if let Some(worktree) = &status.worktree_path {
        println!("Worktree:  {}", worktree);
    }
    Ok(())
}

/// Redraw status on every debounced change under the registry directory
async fn watch_status(root: &Path, cfg: &ResolvedConfig, json: bool) -> Result<()> {
    let runs_dir: PathBuf = paths::runs_dir(root);
    std::fs::create_dir_all(&runs_dir)
        .with_context(|| format!("Failed to create runs directory: {}", runs_dir.display()))?;

    let (tx, rx) = std::sync::mpsc::channel::<DebounceEventResult>();
    let mut debouncer = new_debouncer(Duration::from_millis(500), tx)?;
    debouncer
        .watcher()
        .watch(&runs_dir, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", runs_dir.display()))?;

    render_status(root, cfg, json).await?;
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Ok(_events)) => {
                print!("\x1b[2J\x1b[H");
                render_status(root, cfg, json).await?;
            }
            Ok(Err(e)) => tracing::warn!("Watcher error: {:?}", e),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                anyhow::bail!("Registry watcher disconnected");
            }
        }
    }
}

fn show_lease(root: &Path, cfg: &ResolvedConfig) -> Result<()> {
    let path = LoopConfig::from_settings(&cfg.supervisor, root)?.lease_path;

    match inspect_lease(&path)? {
        LeaseStatus::Free => println!("Lease free: {}", path.display()),
        LeaseStatus::Held { metadata, expired } => {
            let hint = metadata
                .map(|m| m.holder_hint())
                .unwrap_or_else(|| format!("lock={}", path.display()));
            let state = if expired { "held (expired)" } else { "held" };
            println!("Lease {}: {}", state, hint);
        }
    }
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Runtime:");
    println!("  Mode:            {}", cfg.runtime.mode);
    println!("  Command:         {}", cfg.runtime.command);
    println!("  Live status:     {}", cfg.runtime.live_status);
    println!("  Stream fallback: {}", cfg.runtime.stream_fallback);
    println!();
    println!("Phase windows:");
    let window = |d: Option<Duration>| d.map(format_duration).unwrap_or_else(|| "off".to_string());
    println!("  Phase timeout:   {}", window(cfg.phases.phase_timeout()));
    println!("  Stall timeout:   {}", window(cfg.phases.stall_timeout()));
    println!("  Stream startup:  {}", window(cfg.phases.stream_startup_timeout()));
    println!();
    println!("Liveness:");
    println!("  Heartbeat window: {}s", cfg.liveness.heartbeat_window_secs);
    println!("  Max probes:       {}", cfg.liveness.max_probes);
    println!();
    println!("Supervisor:");
    println!("  Failure policy:  {}", cfg.supervisor.failure_policy);
    println!("  Gate policy:     {}", cfg.supervisor.gate_policy);
    println!("  Landing policy:  {}", cfg.supervisor.landing_policy);
    println!(
        "  Lease:           {} (ttl {}s)",
        cfg.supervisor.lease, cfg.supervisor.lease_ttl_secs
    );
    Ok(())
}
