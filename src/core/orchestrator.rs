//! Phase driver for one run.
//!
//! Walks a goal from its start phase to the terminal phase, one backend
//! execution per phase. Every transition is recorded three ways: the
//! hash-chained ledger, the run registry entry (plus heartbeat), and the
//! orchestration text log that log-based discovery reads.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    select_executor, BackendCapabilities, ExecutorOptions, InvalidRuntimeMode, PhaseExecutor,
    PhaseFailure, PhaseRequest,
};
use crate::config::{paths, ResolvedConfig};
use crate::core::gates::{CouncilGate, PhaseGate};
use crate::core::ledger::{Ledger, LedgerError};
use crate::core::timefmt::format_duration;
use crate::domain::{
    classify_gate_failure_class, GateFailure, PhaseSchema, PhasedState,
    PHASED_STATE_SCHEMA_VERSION,
};
use crate::registry::orchestration_log::OrchestrationLog;
use crate::registry::{save_phased_state, write_heartbeat, RegistryError};

/// Why a run stopped before its terminal phase
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("phase {phase} ({name}) failed")]
    Phase {
        phase: u32,
        name: String,
        #[source]
        source: PhaseFailure,
    },

    #[error("phase {phase} ({name}) rejected by gate")]
    Gate {
        phase: u32,
        name: String,
        #[source]
        source: GateFailure,
    },

    #[error("run {run_id} interrupted during {phase_name}")]
    Interrupted { run_id: String, phase_name: String },

    #[error("invalid start phase {0:?}")]
    InvalidStartPhase(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Tunables that are not backend windows
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// How often the heartbeat is rewritten while a phase runs
    pub heartbeat_interval: Duration,
    /// Executions per phase before the run fails (1 = no retry)
    pub max_phase_attempts: u32,
    pub retry_backoff: Duration,
    /// Treat Ctrl-C during a phase as an interruption
    pub handle_interrupt: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_phase_attempts: 1,
            retry_backoff: Duration::from_secs(5),
            handle_interrupt: true,
        }
    }
}

/// New 12-character lowercase hex run id
pub fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Resolve `--from` given as a phase name or number
pub fn resolve_start_phase(from: &str) -> Result<u32, DriverError> {
    PhaseSchema::for_version(PHASED_STATE_SCHEMA_VERSION)
        .phase_number(from)
        .ok_or_else(|| DriverError::InvalidStartPhase(from.to_string()))
}

/// Prompt handed to the runtime for one phase
pub fn phase_prompt(state: &PhasedState, phase: u32) -> String {
    let goal = state.goal.replace('"', "'");
    let target = state.epic_id.as_deref().unwrap_or(&goal);
    match state.schema() {
        PhaseSchema::V1 => match phase {
            1 => format!(
                "/research \"{}\" --auto\n\nThen /plan the work into an epic and run /pre-mortem on the plan.",
                goal
            ),
            2 => format!("/crank {}", target),
            _ => "/vibe recent\n\nThen run /post-mortem on the completed work.".to_string(),
        },
        PhaseSchema::Legacy => {
            let name = state.schema().phase_name(phase);
            match name.as_str() {
                "research" | "plan" => format!("/{} \"{}\" --auto", name, goal),
                "crank" => format!("/crank {}", target),
                "vibe" => "/vibe recent".to_string(),
                other => format!("/{}", other),
            }
        }
    }
}

/// Go-style `map[k:v k2:v2]` rendering used by the completion log line
fn render_verdicts(state: &PhasedState) -> String {
    let pairs: Vec<String> = state
        .verdicts
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect();
    format!("map[{}]", pairs.join(" "))
}

/// Rewrites the heartbeat until dropped
struct HeartbeatTicker(JoinHandle<()>);

impl HeartbeatTicker {
    fn spawn(root: PathBuf, run_id: String, every: Duration) -> Self {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = write_heartbeat(&root, &run_id) {
                    warn!(%run_id, error = %e, "Heartbeat write failed");
                }
            }
        }))
    }
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum PhaseOutcome {
    Done,
    Failed(PhaseFailure),
    Rejected(GateFailure),
    Interrupted,
}

impl PhaseOutcome {
    /// Text for a retryable outcome; `None` ends the attempt loop
    fn retry_message(&self) -> Option<String> {
        match self {
            Self::Done | Self::Interrupted | Self::Failed(PhaseFailure::Spawn { .. }) => None,
            Self::Failed(failure) => Some(failure.to_string()),
            Self::Rejected(gate) => Some(gate.to_string()),
        }
    }
}

/// Drives one run through its phases
pub struct PhaseDriver {
    root: PathBuf,
    executor: Box<dyn PhaseExecutor>,
    gate: Option<Box<dyn PhaseGate>>,
    selection_reason: String,
    ledger: Ledger,
    log: OrchestrationLog,
    options: DriverOptions,
}

impl PhaseDriver {
    pub fn new(
        root: impl Into<PathBuf>,
        executor: Box<dyn PhaseExecutor>,
        selection_reason: impl Into<String>,
    ) -> Self {
        let root = root.into();
        Self {
            ledger: Ledger::new(&root),
            log: OrchestrationLog::for_root(&root),
            root,
            executor,
            gate: None,
            selection_reason: selection_reason.into(),
            options: DriverOptions::default(),
        }
    }

    /// Select and build the backend from configuration
    pub fn from_config(root: &Path, config: &ResolvedConfig) -> Result<Self, InvalidRuntimeMode> {
        let caps = BackendCapabilities::from_config(config)?;
        let schema = PhaseSchema::for_version(PHASED_STATE_SCHEMA_VERSION);
        let options = ExecutorOptions {
            timeouts: (&config.phases).into(),
            live_status_path: config
                .runtime
                .live_status
                .then(|| paths::live_status_path(root)),
            phase_names: (1..=schema.terminal_phase())
                .map(|n| schema.phase_name(n))
                .collect(),
            stream_fallback: config.runtime.stream_fallback,
            scrub_env: config.runtime.scrub_env.clone(),
        };
        let (executor, reason) = select_executor(&caps, &options);
        let driver = Self::new(root, executor, reason);
        Ok(if config.gates.enabled {
            driver.with_gate(Box::new(CouncilGate::from_settings(root, &config.gates)))
        } else {
            driver
        })
    }

    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Evaluate `gate` after every successful phase execution
    pub fn with_gate(mut self, gate: Box<dyn PhaseGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn backend_name(&self) -> &str {
        self.executor.name()
    }

    /// Start a fresh run for `goal` at `start_phase`
    pub async fn start(&self, goal: &str, start_phase: u32) -> Result<PhasedState, DriverError> {
        let state = PhasedState::new(new_run_id(), goal, start_phase)
            .with_worktree(self.root.display().to_string());
        self.drive(state).await
    }

    /// Run `state` from its current phase through the terminal phase
    #[instrument(skip(self, state), fields(run_id = %state.run_id, backend = %self.executor.name()))]
    pub async fn drive(&self, mut state: PhasedState) -> Result<PhasedState, DriverError> {
        let run_id = state.run_id.clone();
        let terminal = state.schema().terminal_phase();
        if state.phase == 0 || state.phase > terminal {
            return Err(DriverError::InvalidStartPhase(state.phase.to_string()));
        }
        state.backend = Some(self.executor.name().to_string());

        save_phased_state(&self.root, &state)?;
        write_heartbeat(&self.root, &run_id)?;
        self.ledger.append(
            &run_id,
            &state.phase_name(),
            "run_started",
            Some(json!({
                "goal": state.goal,
                "start_phase": state.phase,
                "backend": self.executor.name(),
                "reason": self.selection_reason,
            })),
        )?;
        self.log_line(
            &run_id,
            "start",
            &format!("goal={:?} from={}", state.goal, state.phase_name()),
        );
        if let Err(e) =
            self.log
                .log_backend_selection(&run_id, self.executor.name(), &self.selection_reason)
        {
            warn!(error = %e, "Failed to record backend selection");
        }
        info!(goal = %state.goal, from = %state.phase_name(), reason = %self.selection_reason, "Starting run");

        let first = state.phase;
        for phase in first..=terminal {
            state.phase = phase;
            let name = state.phase_name();
            save_phased_state(&self.root, &state)?;

            let started = Instant::now();
            match self.run_phase(&mut state, phase, &name).await? {
                PhaseOutcome::Done => {
                    let took = started.elapsed();
                    info!(phase, phase_name = %name, elapsed = %format_duration(took), "Phase completed");
                    self.log_line(
                        &run_id,
                        &name,
                        &format!("completed in {}", format_duration(took)),
                    );
                    self.ledger.append(
                        &run_id,
                        &name,
                        "phase_completed",
                        Some(json!({ "duration_seconds": took.as_secs_f64() })),
                    )?;
                    write_heartbeat(&self.root, &run_id)?;
                }
                PhaseOutcome::Failed(failure) => {
                    let reason = failure.reason();
                    let gate = GateFailure::from_reason(phase, reason, failure.to_string());
                    self.record_phase_failure(&mut state, &name, reason.as_str(), &gate)?;
                    return Err(DriverError::Phase {
                        phase,
                        name,
                        source: failure,
                    });
                }
                PhaseOutcome::Rejected(gate) => {
                    self.record_phase_failure(&mut state, &name, "gate", &gate)?;
                    return Err(DriverError::Gate {
                        phase,
                        name,
                        source: gate,
                    });
                }
                PhaseOutcome::Interrupted => {
                    warn!(phase, phase_name = %name, "Run interrupted");
                    self.log_line(&run_id, &name, "INTERRUPTED: received interrupt signal");
                    self.ledger.append(
                        &run_id,
                        &name,
                        "run_interrupted",
                        Some(json!({ "signal": "interrupt" })),
                    )?;
                    state.mark_terminal("interrupted", format!("interrupted during {}", name));
                    save_phased_state(&self.root, &state)?;
                    return Err(DriverError::Interrupted {
                        run_id,
                        phase_name: name,
                    });
                }
            }
        }

        state.mark_terminal("completed", "");
        save_phased_state(&self.root, &state)?;
        self.ledger.append(
            &run_id,
            &state.phase_name(),
            "run_completed",
            Some(json!({ "epic_id": state.epic_id, "verdicts": state.verdicts })),
        )?;
        self.log_line(
            &run_id,
            "complete",
            &format!(
                "epic={} verdicts={}",
                state.epic_id.as_deref().unwrap_or("none"),
                render_verdicts(&state)
            ),
        );
        info!("Run completed");
        Ok(state)
    }

    /// Execute one phase, retrying up to `max_phase_attempts`
    async fn run_phase(
        &self,
        state: &mut PhasedState,
        phase: u32,
        name: &str,
    ) -> Result<PhaseOutcome, DriverError> {
        let max_attempts = self.options.max_phase_attempts.max(1);
        let request = PhaseRequest {
            run_id: state.run_id.clone(),
            phase,
            phase_name: name.to_string(),
            prompt: phase_prompt(state, phase),
            cwd: self.root.clone(),
        };

        let mut attempt = 1;
        loop {
            state.attempts.insert(name.to_string(), attempt);
            save_phased_state(&self.root, state)?;
            self.ledger.append(
                &state.run_id,
                name,
                "phase_started",
                Some(json!({ "phase": phase, "attempt": attempt, "backend": self.executor.name() })),
            )?;
            info!(phase, phase_name = %name, attempt, "Phase started");

            let result = {
                let _heartbeat = HeartbeatTicker::spawn(
                    self.root.clone(),
                    state.run_id.clone(),
                    self.options.heartbeat_interval,
                );
                self.execute_interruptible(&request).await
            };

            let outcome = match result {
                None => PhaseOutcome::Interrupted,
                Some(Ok(())) => match self.apply_gate(state, phase, name).await? {
                    Some(rejection) => PhaseOutcome::Rejected(rejection),
                    None => PhaseOutcome::Done,
                },
                Some(Err(failure)) => PhaseOutcome::Failed(failure),
            };

            let Some(message) = outcome.retry_message() else {
                return Ok(outcome);
            };
            if attempt >= max_attempts {
                return Ok(outcome);
            }

            warn!(
                phase,
                phase_name = %name,
                attempt,
                max_attempts,
                error = %message,
                "Phase failed, retrying"
            );
            attempt += 1;
            self.log_line(
                &state.run_id,
                name,
                &format!("RETRY attempt {}/{}: {}", attempt, max_attempts, message),
            );
            tokio::time::sleep(self.options.retry_backoff).await;
        }
    }

    /// Fold the gate's findings into `state`; returns the rejection, if any
    async fn apply_gate(
        &self,
        state: &mut PhasedState,
        phase: u32,
        name: &str,
    ) -> Result<Option<GateFailure>, DriverError> {
        let Some(gate) = &self.gate else {
            return Ok(None);
        };
        let report = gate.evaluate(state, phase).await;

        if let Some(epic) = report.epic_id {
            info!(%epic, "Epic recorded");
            self.log_line(&state.run_id, name, &format!("extracted epic: {}", epic));
            state.epic_id = Some(epic);
        }
        for (key, verdict) in report.verdicts {
            info!(gate = %key, %verdict, "Gate verdict");
            let line = format!("{} verdict: {}", key.replace('_', "-"), verdict);
            self.log_line(&state.run_id, name, &line);
            state.verdicts.insert(key, verdict);
        }
        save_phased_state(&self.root, state)?;
        Ok(report.failure)
    }

    /// Record a failed phase in the log, ledger and state, classified
    /// through the gate taxonomy
    fn record_phase_failure(
        &self,
        state: &mut PhasedState,
        name: &str,
        reason: &str,
        gate: &GateFailure,
    ) -> Result<(), DriverError> {
        let class = classify_gate_failure_class(gate.phase, Some(gate))
            .map(|class| class.to_string())
            .unwrap_or_default();
        let message = if reason == "gate" {
            gate.to_string()
        } else {
            gate.message.clone()
        };
        error!(
            phase = gate.phase,
            phase_name = %name,
            reason,
            failure_class = %class,
            %message,
            "Phase failed"
        );
        self.log_line(&state.run_id, name, &format!("FAILED: {} [{}]", message, class));
        self.ledger.append(
            &state.run_id,
            name,
            "phase_failed",
            Some(json!({
                "reason": reason,
                "verdict": gate.verdict,
                "failure_class": class,
                "error": message,
            })),
        )?;
        state.mark_terminal("failed", format!("{} [{}]", message, class));
        save_phased_state(&self.root, state)?;
        Ok(())
    }

    /// `None` when interrupted before the backend returned
    async fn execute_interruptible(
        &self,
        request: &PhaseRequest,
    ) -> Option<Result<(), PhaseFailure>> {
        if !self.options.handle_interrupt {
            return Some(self.executor.execute(request).await);
        }
        tokio::select! {
            result = self.executor.execute(request) => Some(result),
            Ok(()) = tokio::signal::ctrl_c() => None,
        }
    }

    fn log_line(&self, run_id: &str, stage: &str, details: &str) {
        if let Err(e) = self.log.append(run_id, stage, details) {
            warn!(path = %self.log.path().display(), error = %e, "Failed to write orchestration log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::core::gates::GateReport;
    use crate::registry::load_phased_state;

    /// Fails `fail_phase` the first `failures` times it runs
    struct ScriptedExecutor {
        fail_phase: Option<u32>,
        failures: u32,
        failed: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PhaseExecutor for ScriptedExecutor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, request: &PhaseRequest) -> Result<(), PhaseFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(request.phase) == self.fail_phase
                && self.failed.fetch_add(1, Ordering::SeqCst) < self.failures
            {
                return Err(PhaseFailure::ExitError {
                    command: "agent".to_string(),
                    code: Some(2),
                });
            }
            Ok(())
        }
    }

    fn driver(
        root: &Path,
        fail_phase: Option<u32>,
        failures: u32,
    ) -> (PhaseDriver, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let exec = ScriptedExecutor {
            fail_phase,
            failures,
            failed: AtomicU32::new(0),
            calls: calls.clone(),
        };
        let options = DriverOptions {
            retry_backoff: Duration::from_millis(1),
            handle_interrupt: false,
            ..Default::default()
        };
        (
            PhaseDriver::new(root, Box::new(exec), "test").with_options(options),
            calls,
        )
    }

    /// Times out every phase
    struct TimingOutExecutor;

    #[async_trait]
    impl PhaseExecutor for TimingOutExecutor {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, request: &PhaseRequest) -> Result<(), PhaseFailure> {
            Err(PhaseFailure::Timeout {
                phase: request.phase,
                after: Duration::from_secs(90 * 60),
            })
        }
    }

    /// Records prompts and succeeds
    #[derive(Default)]
    struct PromptRecorder {
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PhaseExecutor for PromptRecorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn execute(&self, request: &PhaseRequest) -> Result<(), PhaseFailure> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(())
        }
    }

    /// Hands out queued reports per phase, passing once a queue runs dry
    #[derive(Default)]
    struct QueuedGate {
        reports: Mutex<Vec<(u32, VecDeque<GateReport>)>>,
    }

    impl QueuedGate {
        fn push(self, phase: u32, report: GateReport) -> Self {
            {
                let mut reports = self.reports.lock().unwrap();
                match reports.iter_mut().find(|(p, _)| *p == phase) {
                    Some((_, queue)) => queue.push_back(report),
                    None => reports.push((phase, VecDeque::from([report]))),
                }
            }
            self
        }
    }

    #[async_trait]
    impl PhaseGate for QueuedGate {
        async fn evaluate(&self, _state: &PhasedState, phase: u32) -> GateReport {
            let mut reports = self.reports.lock().unwrap();
            reports
                .iter_mut()
                .find(|(p, _)| *p == phase)
                .and_then(|(_, queue)| queue.pop_front())
                .unwrap_or_default()
        }
    }

    fn quiet_options(max_phase_attempts: u32) -> DriverOptions {
        DriverOptions {
            max_phase_attempts,
            retry_backoff: Duration::from_millis(1),
            handle_interrupt: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_run_id_shape() {
        let id = new_run_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_resolve_start_phase() {
        assert_eq!(resolve_start_phase("implementation").unwrap(), 2);
        assert_eq!(resolve_start_phase("3").unwrap(), 3);
        assert!(resolve_start_phase("crank").is_err());
    }

    #[test]
    fn test_phase_prompt_uses_epic_when_known() {
        let mut state = PhasedState::new("abc", "add \"auth\"", 1);
        assert!(phase_prompt(&state, 1).starts_with("/research \"add 'auth'\" --auto"));
        assert_eq!(phase_prompt(&state, 2), "/crank add 'auth'");
        state.epic_id = Some("ag-5k2".to_string());
        assert_eq!(phase_prompt(&state, 2), "/crank ag-5k2");
        assert!(phase_prompt(&state, 3).starts_with("/vibe recent"));
    }

    #[tokio::test]
    async fn test_successful_run_records_every_transition() {
        let temp = TempDir::new().unwrap();
        let (driver, calls) = driver(temp.path(), None, 0);

        let state = driver.start("ship it", 1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.phase, 3);
        assert_eq!(state.terminal_status(), Some("completed"));

        let actions: Vec<String> = driver
            .ledger()
            .load()
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(actions.first().map(String::as_str), Some("run_started"));
        assert_eq!(actions.last().map(String::as_str), Some("run_completed"));
        assert_eq!(actions.iter().filter(|a| *a == "phase_completed").count(), 3);
        assert!(driver.ledger().verify().pass);

        let saved = load_phased_state(temp.path()).unwrap().unwrap();
        assert_eq!(saved.run_id, state.run_id);
        assert_eq!(saved.backend.as_deref(), Some("scripted"));

        let log = std::fs::read_to_string(paths::orchestration_log_path(temp.path())).unwrap();
        assert!(log.contains("backend-selection: backend=scripted reason=\"test\""));
        assert!(log.contains("complete: epic=none verdicts=map[]"));
    }

    #[tokio::test]
    async fn test_failed_phase_marks_state_failed() {
        let temp = TempDir::new().unwrap();
        let (driver, _) = driver(temp.path(), Some(2), 5);

        let err = driver.start("goal", 1).await.unwrap_err();
        assert!(matches!(err, DriverError::Phase { phase: 2, .. }));

        let saved = load_phased_state(temp.path()).unwrap().unwrap();
        assert_eq!(saved.terminal_status(), Some("failed"));
        assert!(saved.terminal_reason().unwrap().contains("exit_error"));

        let records = driver.ledger().load().unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.action, "phase_failed");
        assert_eq!(last.phase, "implementation");
        assert_eq!(last.details["reason"], "exit_error");
    }

    #[tokio::test]
    async fn test_phase_retry_is_logged() {
        let temp = TempDir::new().unwrap();
        let (driver, calls) = driver(temp.path(), Some(1), 1);
        let driver = driver.with_options(DriverOptions {
            max_phase_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            handle_interrupt: false,
            ..Default::default()
        });

        let state = driver.start("goal", 1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(state.attempts.get("discovery"), Some(&2));

        let log = std::fs::read_to_string(paths::orchestration_log_path(temp.path())).unwrap();
        assert!(log.contains("discovery: RETRY attempt 2/2"));
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_phase() {
        let temp = TempDir::new().unwrap();
        let (driver, _) = driver(temp.path(), None, 0);
        let err = driver.start("goal", 4).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidStartPhase(_)));
    }

    #[tokio::test]
    async fn test_timeout_failure_carries_class() {
        let temp = TempDir::new().unwrap();
        let driver = PhaseDriver::new(temp.path(), Box::new(TimingOutExecutor), "test")
            .with_options(quiet_options(1));

        let err = driver.start("goal", 2).await.unwrap_err();
        assert!(matches!(err, DriverError::Phase { phase: 2, .. }));

        let records = driver.ledger().load().unwrap();
        let failed = records.last().unwrap();
        assert_eq!(failed.action, "phase_failed");
        assert_eq!(failed.details["reason"], "timeout");
        assert_eq!(failed.details["failure_class"], "timeout");

        let saved = load_phased_state(temp.path()).unwrap().unwrap();
        assert!(saved.terminal_reason().unwrap().ends_with("[timeout]"));
    }

    #[tokio::test]
    async fn test_gate_verdicts_and_epic_flow_into_run() {
        let temp = TempDir::new().unwrap();
        let recorder = PromptRecorder::default();
        let prompts = recorder.prompts.clone();
        let gate = QueuedGate::default()
            .push(1, GateReport::default().with_epic("ag-5k2").with_verdict("pre_mortem", "PASS"))
            .push(3, GateReport::default().with_verdict("vibe", "WARN"));
        let driver = PhaseDriver::new(temp.path(), Box::new(recorder), "test")
            .with_options(quiet_options(1))
            .with_gate(Box::new(gate));

        let state = driver.start("ship it", 1).await.unwrap();
        assert_eq!(state.epic_id.as_deref(), Some("ag-5k2"));
        assert_eq!(state.verdicts["pre_mortem"], "PASS");
        assert_eq!(state.verdicts["vibe"], "WARN");
        assert_eq!(prompts.lock().unwrap()[1], "/crank ag-5k2");

        let log = std::fs::read_to_string(paths::orchestration_log_path(temp.path())).unwrap();
        assert!(log.contains("discovery: extracted epic: ag-5k2"));
        assert!(log.contains("discovery: pre-mortem verdict: PASS"));
        assert!(log.contains("complete: epic=ag-5k2 verdicts=map[pre_mortem:PASS vibe:WARN]"));
    }

    #[tokio::test]
    async fn test_gate_rejection_fails_run_with_class() {
        let temp = TempDir::new().unwrap();
        let (driver, calls) = driver(temp.path(), None, 0);
        let rejection = GateFailure::new(3, "FAIL", "vibe rejected the work");
        let gate = QueuedGate::default()
            .push(3, GateReport::default().with_verdict("vibe", "FAIL").rejected(rejection));
        let driver = driver.with_gate(Box::new(gate));

        let err = driver.start("goal", 1).await.unwrap_err();
        assert!(matches!(err, DriverError::Gate { phase: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let records = driver.ledger().load().unwrap();
        let failed = records.last().unwrap();
        assert_eq!(failed.phase, "validation");
        assert_eq!(failed.details["reason"], "gate");
        assert_eq!(failed.details["verdict"], "FAIL");
        assert_eq!(failed.details["failure_class"], "vibe_fail");
        assert!(!records.iter().any(|r| r.action == "run_completed"));

        let saved = load_phased_state(temp.path()).unwrap().unwrap();
        assert_eq!(saved.terminal_status(), Some("failed"));
        assert_eq!(saved.verdicts["vibe"], "FAIL");
        assert!(saved.terminal_reason().unwrap().ends_with("[vibe_fail]"));
    }

    #[tokio::test]
    async fn test_gate_rejection_is_retried() {
        let temp = TempDir::new().unwrap();
        let (driver, calls) = driver(temp.path(), None, 0);
        let partial = GateFailure::new(2, "PARTIAL", "epic ag-1 children not all closed");
        let gate = QueuedGate::default().push(2, GateReport::default().rejected(partial));
        let driver = driver.with_options(quiet_options(2)).with_gate(Box::new(gate));

        let state = driver.start("goal", 1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(state.attempts.get("implementation"), Some(&2));

        let log = std::fs::read_to_string(paths::orchestration_log_path(temp.path())).unwrap();
        assert!(log.contains("implementation: RETRY attempt 2/2: phase 2 gate verdict PARTIAL"));
    }
}
