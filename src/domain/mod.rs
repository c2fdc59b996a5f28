//! Domain types for phasewarden.
//!
//! This module contains the core data structures:
//! - record: Hash-chained ledger records, run caches, verify reports
//! - state: Persisted per-run state and phase vocabularies
//! - status: Computed run status read model
//! - failure: Backend failure reasons and gate failure classes

pub mod failure;
pub mod record;
pub mod state;
pub mod status;

// Re-export commonly used types
pub use failure::{classify_gate_failure_class, FailureClass, FailureReason, GateFailure};
pub use record::{LedgerRecord, RunCache, VerifyReport, LEDGER_SCHEMA_VERSION};
pub use state::{PhaseSchema, PhasedState, PHASED_STATE_SCHEMA_VERSION};
pub use status::{RunStatus, RunStatusKind};
