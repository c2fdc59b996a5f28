//! Supervisor Integration Tests
//!
//! Tests for the cycle loop end to end: queue draining through the phase
//! driver, the kill switch engaged mid-loop, and lease lifetime.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use phasewarden::adapters::{PhaseExecutor, PhaseFailure, PhaseRequest};
use phasewarden::config::SupervisorSettings;
use phasewarden::core::{DriverOptions, Ledger, PhaseDriver};
use phasewarden::supervisor::{
    inspect_lease, CycleContext, CycleFailure, CycleRunner, LeaseStatus, LoopConfig, LoopOptions,
    NextWorkQueue, PhasedCycleRunner, StopReason, Supervisor, SupervisorError,
};
use tempfile::TempDir;

/// Succeeds every phase and counts executions
struct CountingExecutor {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl PhaseExecutor for CountingExecutor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, _request: &PhaseRequest) -> Result<(), PhaseFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engages the kill switch from inside the first cycle
struct KillingRunner {
    kill_switch: PathBuf,
    cycles: AtomicU32,
}

#[async_trait]
impl CycleRunner for KillingRunner {
    async fn run_cycle(&self, _ctx: &CycleContext) -> Result<(), CycleFailure> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(self.kill_switch.parent().unwrap()).unwrap();
        fs::write(&self.kill_switch, "").unwrap();
        Ok(())
    }
}

struct FailingRunner;

#[async_trait]
impl CycleRunner for FailingRunner {
    async fn run_cycle(&self, _ctx: &CycleContext) -> Result<(), CycleFailure> {
        Err(CycleFailure::task("phased engine", "phase 3 (validation) failed"))
    }
}

fn loop_config(root: &Path, tweak: impl FnOnce(&mut SupervisorSettings)) -> LoopConfig {
    let mut settings = SupervisorSettings {
        retry_backoff_secs: 0,
        ..Default::default()
    };
    tweak(&mut settings);
    LoopConfig::from_settings(&settings, root).unwrap()
}

fn seed_queue(root: &Path) -> NextWorkQueue {
    let queue = NextWorkQueue::for_root(root);
    fs::create_dir_all(queue.path().parent().unwrap()).unwrap();
    fs::write(
        queue.path(),
        concat!(
            r#"{"source_epic":"ep-1","items":[{"title":"tighten retries","severity":"medium"}],"consumed":false}"#,
            "\n",
            r#"{"source_epic":"ep-2","items":[{"title":"fix flaky test","severity":"high"}],"consumed":false}"#,
            "\n",
        ),
    )
    .unwrap();
    queue
}

fn quiet_driver(root: &Path, calls: Arc<AtomicU32>) -> PhaseDriver {
    PhaseDriver::new(root, Box::new(CountingExecutor { calls }), "runtime=direct").with_options(
        DriverOptions {
            handle_interrupt: false,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_loop_drains_queue_through_driver() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let queue = seed_queue(root);

    let calls = Arc::new(AtomicU32::new(0));
    let config = loop_config(root, |s| s.lease = true);
    let runner = PhasedCycleRunner::new(quiet_driver(root, calls.clone()), config.clone());
    let supervisor = Supervisor::new(root, config.clone(), runner, LoopOptions::default());

    let summary = supervisor.run().await.unwrap();
    assert_eq!(summary.executed_cycles, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.stop, StopReason::QueueEmpty);
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    assert!(queue.eligible_entries().unwrap().is_empty());
    let content = fs::read_to_string(queue.path()).unwrap();
    assert_eq!(content.matches("\"consumed_by\":\"phasewarden-loop\"").count(), 2);

    let ledger = Ledger::new(root);
    let report = ledger.verify();
    assert!(report.pass, "{}", report.summary_line());
    let records = ledger.load().unwrap();
    let completed = records.iter().filter(|r| r.action == "run_completed").count();
    assert_eq!(completed, 2);
    // The high-severity item ran first
    let first_start = records.iter().find(|r| r.action == "run_started").unwrap();
    assert_eq!(first_start.details["goal"], "fix flaky test");

    // Lease released when the loop returned
    assert!(matches!(inspect_lease(&config.lease_path).unwrap(), LeaseStatus::Free));
}

#[tokio::test]
async fn test_max_cycles_bounds_the_loop() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    seed_queue(root);

    let calls = Arc::new(AtomicU32::new(0));
    let config = loop_config(root, |_| {});
    let runner = PhasedCycleRunner::new(quiet_driver(root, calls), config.clone());
    let options = LoopOptions {
        max_cycles: 1,
        ..Default::default()
    };
    let summary = Supervisor::new(root, config, runner, options).run().await.unwrap();
    assert_eq!(summary.executed_cycles, 1);
    assert_eq!(summary.stop, StopReason::MaxCycles);
}

#[tokio::test]
async fn test_kill_switch_engaged_mid_loop() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    seed_queue(root);

    let config = loop_config(root, |s| s.kill_switch_path = Some("STOP".to_string()));
    assert_eq!(config.kill_switch_path, root.join("STOP"));
    let runner = KillingRunner {
        kill_switch: config.kill_switch_path.clone(),
        cycles: AtomicU32::new(0),
    };
    let supervisor = Supervisor::new(root, config, runner, LoopOptions::default());

    let summary = supervisor.run().await.unwrap();
    assert_eq!(summary.executed_cycles, 1);
    assert_eq!(summary.stop, StopReason::KillSwitch);
}

#[tokio::test]
async fn test_continue_policy_marks_failures_and_moves_on() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let queue = seed_queue(root);

    let config = loop_config(root, |s| s.failure_policy = "continue".to_string());
    let summary = Supervisor::new(root, config, FailingRunner, LoopOptions::default())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.stop, StopReason::QueueEmpty);

    let content = fs::read_to_string(queue.path()).unwrap();
    assert_eq!(content.matches("\"failed_at\"").count(), 2);
    assert!(!content.contains("\"consumed\":true"));
}

#[tokio::test]
async fn test_explicit_goal_failure_stops_regardless_of_policy() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let config = loop_config(root, |s| s.failure_policy = "continue".to_string());
    let options = LoopOptions {
        goal: Some("one-off".to_string()),
        ..Default::default()
    };

    let err = Supervisor::new(root, config, FailingRunner, options)
        .run()
        .await
        .unwrap_err();
    match err {
        SupervisorError::CycleFailed { cycle, failure } => {
            assert_eq!(cycle, 1);
            assert_eq!(failure.stage, "phased engine");
        }
        other => panic!("unexpected error: {}", other),
    }
}
