//! Supervised cycles and the loop that repeats them.

use std::collections::BTreeSet;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::command::run_command;
use crate::core::orchestrator::{new_run_id, DriverError, PhaseDriver};
use crate::core::timefmt::format_duration;
use crate::domain::PhasedState;

use super::lease::SupervisorLease;
use super::queue::{NextWorkQueue, QueueSelection};
use super::{
    kill_switch_engaged, render_landing_message, GatePolicy, LandingPolicy, LoopConfig,
    SupervisorError,
};

/// Recorded on queue entries consumed by the loop
pub const QUEUE_CONSUMER: &str = "phasewarden-loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleFailureKind {
    /// The work itself failed; counts against retries and fails the queue item
    Task,
    /// The environment failed; retried by the loop on its own budget
    Infrastructure,
}

impl fmt::Display for CycleFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Task => "task",
            Self::Infrastructure => "infrastructure",
        })
    }
}

/// A failed cycle, tagged with the stage that failed
#[derive(Debug, Error)]
#[error("{stage}: {error}")]
pub struct CycleFailure {
    pub kind: CycleFailureKind,
    pub stage: String,
    pub error: Box<dyn StdError + Send + Sync>,
}

impl CycleFailure {
    pub fn task(
        stage: impl Into<String>,
        error: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            kind: CycleFailureKind::Task,
            stage: stage.into(),
            error: error.into(),
        }
    }

    pub fn infrastructure(
        stage: impl Into<String>,
        error: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            kind: CycleFailureKind::Infrastructure,
            stage: stage.into(),
            error: error.into(),
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.kind == CycleFailureKind::Infrastructure
    }

    /// Only task failures mark the originating queue item failed
    pub fn should_mark_queue_entry_failed(&self) -> bool {
        !self.is_infrastructure()
    }
}

/// Identifies one attempt of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleContext {
    pub cycle: u32,
    pub attempt: u32,
    pub goal: String,
}

/// Runs one supervised cycle for a goal
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, ctx: &CycleContext) -> Result<(), CycleFailure>;
}

/// Paths named by `git status --porcelain` (rename targets for renames)
pub fn parse_porcelain(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            path.trim().trim_matches('"').to_string()
        })
        .filter(|path| !path.is_empty())
        .collect()
}

/// Default runner: phase driver, then gates, then landing
pub struct PhasedCycleRunner {
    driver: PhaseDriver,
    config: LoopConfig,
}

impl PhasedCycleRunner {
    pub fn new(driver: PhaseDriver, config: LoopConfig) -> Self {
        Self { driver, config }
    }

    fn root(&self) -> &Path {
        self.driver.root()
    }

    async fn dirty_paths(&self) -> Result<BTreeSet<String>> {
        let out = run_command(
            self.root(),
            self.config.command_timeout,
            "git",
            &["status", "--porcelain"],
        )
        .await
        .context("git status failed")?;
        Ok(parse_porcelain(&out))
    }

    /// Run configured gate scripts under the gate policy
    async fn run_gates(&self) -> Result<()> {
        if self.config.gate_policy == GatePolicy::Off {
            return Ok(());
        }
        let required = self.config.gate_policy == GatePolicy::Required;

        let mut failures = Vec::new();
        for script in &self.config.gate_scripts {
            let usable = fs::metadata(script).map(|m| !m.is_dir()).unwrap_or(false);
            if !usable {
                if required {
                    failures.push(format!("required gate script missing: {}", script.display()));
                } else {
                    info!(script = %script.display(), "Skipping optional gate (missing)");
                }
                continue;
            }

            info!(script = %script.display(), "Running gate");
            let script_arg = script.to_string_lossy();
            if let Err(e) = run_command(
                self.root(),
                self.config.command_timeout,
                "bash",
                &[script_arg.as_ref()],
            )
            .await
            {
                if self.config.gate_policy == GatePolicy::BestEffort {
                    warn!(script = %script.display(), error = %e, "Gate failed (best-effort)");
                    continue;
                }
                failures.push(format!("gate script {} failed: {:#}", script.display(), e));
            }
        }

        if !failures.is_empty() {
            bail!("gate failures: {}", failures.join("; "));
        }
        Ok(())
    }

    /// Commit paths that became dirty during the cycle; true when a commit was made
    async fn commit_owned_changes(
        &self,
        message: &str,
        baseline: &BTreeSet<String>,
    ) -> Result<bool> {
        let owned: Vec<String> = self
            .dirty_paths()
            .await?
            .difference(baseline)
            .cloned()
            .collect();
        if owned.is_empty() {
            info!("Landing: no changes owned by this cycle");
            return Ok(false);
        }

        let mut add = vec!["add", "--"];
        add.extend(owned.iter().map(String::as_str));
        run_command(self.root(), self.config.command_timeout, "git", &add)
            .await
            .context("git add owned paths failed")?;
        run_command(
            self.root(),
            self.config.command_timeout,
            "git",
            &["commit", "-m", message],
        )
        .await
        .context("git commit failed")?;
        info!(paths = owned.len(), "Landing: committed cycle changes");
        Ok(true)
    }

    async fn sync_and_push(&self) -> Result<()> {
        let limit = self.config.command_timeout;
        let branch = match &self.config.landing_branch {
            Some(branch) => branch.clone(),
            None => {
                let head = run_command(
                    self.root(),
                    limit,
                    "git",
                    &["rev-parse", "--abbrev-ref", "HEAD"],
                )
                .await
                .context("resolve landing branch")?;
                let head = head.trim().to_string();
                if head.is_empty() || head == "HEAD" {
                    bail!("cannot resolve landing branch from a detached HEAD");
                }
                head
            }
        };

        run_command(self.root(), limit, "git", &["fetch", "origin", &branch])
            .await
            .context("git fetch failed")?;
        let upstream = format!("origin/{}", branch);
        if let Err(e) = run_command(self.root(), limit, "git", &["rebase", &upstream]).await {
            if let Err(abort) =
                run_command(self.root(), limit, "git", &["rebase", "--abort"]).await
            {
                warn!(error = %abort, "git rebase --abort failed");
            }
            return Err(e.context(format!("rebase onto {} failed", upstream)));
        }
        let refspec = format!("HEAD:{}", branch);
        run_command(self.root(), limit, "git", &["push", "origin", &refspec])
            .await
            .context("git push failed")?;
        info!(%branch, "Landing: pushed");
        Ok(())
    }
}

#[async_trait]
impl CycleRunner for PhasedCycleRunner {
    async fn run_cycle(&self, ctx: &CycleContext) -> Result<(), CycleFailure> {
        let baseline = match self.config.landing_policy {
            LandingPolicy::Off => None,
            _ => Some(
                self.dirty_paths()
                    .await
                    .map_err(|e| CycleFailure::infrastructure("landing scope", e))?,
            ),
        };

        let mut state = PhasedState::new(new_run_id(), &ctx.goal, 1)
            .with_worktree(self.root().display().to_string());
        state.cycle = ctx.cycle;
        self.driver.drive(state).await.map_err(|e| match e {
            DriverError::Ledger(_) | DriverError::Registry(_) => {
                CycleFailure::infrastructure("phased engine", e)
            }
            other => CycleFailure::task("phased engine", other),
        })?;

        self.run_gates()
            .await
            .map_err(|e| CycleFailure::task("gate", e))?;

        if let Some(baseline) = baseline {
            let message = render_landing_message(
                &self.config.landing_message,
                ctx.cycle,
                ctx.attempt,
                &ctx.goal,
            );
            let committed = self
                .commit_owned_changes(&message, &baseline)
                .await
                .map_err(|e| CycleFailure::infrastructure("landing", e))?;
            if committed && self.config.landing_policy == LandingPolicy::SyncPush {
                self.sync_and_push()
                    .await
                    .map_err(|e| CycleFailure::infrastructure("landing", e))?;
            }
        }
        Ok(())
    }
}

/// Per-invocation loop settings
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Run this goal once instead of draining the queue
    pub goal: Option<String>,
    /// 0 = unbounded
    pub max_cycles: u32,
    /// Only take queue items targeting this repository (or any repository)
    pub repo_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxCycles,
    QueueEmpty,
    ExplicitGoalDone,
    KillSwitch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub executed_cycles: u32,
    pub completed: u32,
    pub failed: u32,
    pub stop: StopReason,
}

/// Repeats cycles under the lease, kill switch and policies
pub struct Supervisor<R: CycleRunner> {
    root: PathBuf,
    config: LoopConfig,
    runner: R,
    queue: NextWorkQueue,
    options: LoopOptions,
}

impl<R: CycleRunner> Supervisor<R> {
    pub fn new(
        root: impl Into<PathBuf>,
        config: LoopConfig,
        runner: R,
        options: LoopOptions,
    ) -> Self {
        let root = root.into();
        Self {
            queue: NextWorkQueue::for_root(&root),
            root,
            config,
            runner,
            options,
        }
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn run(&self) -> Result<LoopSummary, SupervisorError> {
        let _lease = if self.config.lease_enabled {
            Some(SupervisorLease::acquire(
                &self.config.lease_path,
                &self.root,
                self.config.lease_ttl,
                &new_run_id(),
            )?)
        } else {
            None
        };

        let mut executed = 0;
        let mut completed = 0;
        let mut failed = 0;
        let mut cycle = 0;

        let stop = loop {
            cycle += 1;
            if self.options.max_cycles > 0 && cycle > self.options.max_cycles {
                info!(max_cycles = self.options.max_cycles, "Reached max cycles");
                break StopReason::MaxCycles;
            }
            if cycle > 1 && !self.config.cycle_delay.is_zero() {
                tokio::time::sleep(self.config.cycle_delay).await;
            }
            if kill_switch_engaged(&self.config.kill_switch_path)? {
                warn!(path = %self.config.kill_switch_path.display(), cycle, "Kill switch engaged, stopping");
                break StopReason::KillSwitch;
            }

            let (goal, selection) = match self.next_goal() {
                Some(next) => next,
                None => {
                    info!("No unconsumed work in queue");
                    break StopReason::QueueEmpty;
                }
            };

            info!(cycle, %goal, "Starting cycle");
            executed += 1;
            let started = Instant::now();
            match self.run_with_retries(cycle, &goal).await {
                Ok(()) => {
                    completed += 1;
                    info!(cycle, elapsed = %format_duration(started.elapsed()), "Cycle completed");
                    if let Some(sel) = &selection {
                        if let Err(e) = self.queue.mark_consumed(sel.entry_index, QUEUE_CONSUMER) {
                            warn!(error = %e, "Could not mark queue entry consumed");
                        }
                    }
                    if self.options.goal.is_some() {
                        break StopReason::ExplicitGoalDone;
                    }
                }
                Err(failure) => {
                    failed += 1;
                    warn!(cycle, kind = %failure.kind, error = %failure, "Cycle failed");
                    if let Some(sel) = &selection {
                        self.record_queue_failure(sel, &failure);
                    }
                    if self.config.should_continue_after_failure() && self.options.goal.is_none() {
                        info!(policy = %self.config.failure_policy, "Continuing to next queue item");
                        continue;
                    }
                    return Err(SupervisorError::CycleFailed { cycle, failure });
                }
            }
        };

        info!(executed, completed, failed, ?stop, "Loop finished");
        Ok(LoopSummary {
            executed_cycles: executed,
            completed,
            failed,
            stop,
        })
    }

    fn next_goal(&self) -> Option<(String, Option<QueueSelection>)> {
        if let Some(goal) = &self.options.goal {
            return (!goal.trim().is_empty()).then(|| (goal.clone(), None));
        }
        match self.queue.select(self.options.repo_filter.as_deref()) {
            Ok(Some(sel)) if !sel.item.title.trim().is_empty() => {
                Some((sel.item.title.clone(), Some(sel)))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.queue.path().display(), error = %e, "Could not read queue");
                None
            }
        }
    }

    fn record_queue_failure(&self, sel: &QueueSelection, failure: &CycleFailure) {
        if !failure.should_mark_queue_entry_failed() {
            info!(title = %sel.item.title, "Queue entry left unmodified (infrastructure failure)");
            return;
        }
        match self.queue.mark_failed(sel.entry_index) {
            Ok(()) => info!(title = %sel.item.title, "Queue entry marked failed"),
            Err(e) => warn!(error = %e, "Could not mark queue entry failed"),
        }
    }

    /// Task failures use `max_cycle_attempts`; infrastructure failures use `infra_retries`
    async fn run_with_retries(&self, cycle: u32, goal: &str) -> Result<(), CycleFailure> {
        let max_attempts = self.config.max_cycle_attempts();
        let mut attempt = 1;
        let mut infra_used = 0;
        loop {
            let ctx = CycleContext {
                cycle,
                attempt,
                goal: goal.to_string(),
            };
            let failure = match self.runner.run_cycle(&ctx).await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            if failure.is_infrastructure() {
                if infra_used >= self.config.infra_retries {
                    return Err(failure);
                }
                infra_used += 1;
                warn!(
                    cycle,
                    attempt,
                    infra_retry = infra_used,
                    infra_retries = self.config.infra_retries,
                    error = %failure,
                    "Infrastructure failure, retrying"
                );
            } else {
                if attempt >= max_attempts {
                    return Err(failure);
                }
                warn!(cycle, attempt, max_attempts, error = %failure, "Cycle attempt failed, retrying");
                attempt += 1;
            }

            if !self.config.retry_backoff.is_zero() {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
    }
}
