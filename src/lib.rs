//! phasewarden - ledger, liveness and supervision for phased agent runs
//!
//! Drives an autonomous coding agent through a fixed sequence of phases
//! (discovery, implementation, validation) and keeps every run observable
//! and recoverable.
//!
//! # Architecture
//!
//! - Every run-level event is appended to a SHA-256 hash-chained ledger;
//!   any later edit to a past record is detectable by `verify`
//! - Each phase runs under a backend (direct or streaming) with overall,
//!   startup and stall windows, and fails with a typed reason
//! - Per-run state and heartbeats live in a registry; liveness is decided
//!   from heartbeat age, worktree presence and bounded session probes
//! - The orchestration log is a fallback source for run discovery
//! - The supervisor repeats cycles behind a lease and a kill switch, and
//!   separates task failures from infrastructure failures
//!
//! # Modules
//!
//! - `adapters`: phase execution backends and live status
//! - `core`: ledger, locks, atomic writes, the phase driver
//! - `domain`: records, run state, status read model, failure reasons
//! - `registry`: run registry, liveness, discovery, orchestration log
//! - `supervisor`: the cycle loop and its policies
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a goal through all phases
//! phasewarden run "add retry to the uploader"
//!
//! # Active and recent runs
//! phasewarden status
//!
//! # Check ledger integrity
//! phasewarden verify
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod registry;
pub mod supervisor;

// Re-export main types at crate root for convenience
pub use adapters::{select_executor, BackendCapabilities, PhaseExecutor, PhaseRequest};
pub use core::{Ledger, PhaseDriver};
pub use domain::{LedgerRecord, PhasedState, RunStatus, RunStatusKind, VerifyReport};
pub use registry::{discover_runs, RunDiscovery};
pub use supervisor::{LoopConfig, Supervisor};
