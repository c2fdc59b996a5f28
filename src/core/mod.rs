//! Core durability and orchestration logic.
//!
//! This module contains:
//! - Ledger: hash-chained, append-only run event log
//! - PhaseDriver: walks a run through its phases
//! - Gates: post-phase verdicts and epic discovery feeding the driver
//! - Atomic writes, file locks and timestamp helpers shared by both

pub mod atomic;
pub mod command;
pub mod file_lock;
pub mod gates;
pub mod ledger;
pub mod orchestrator;
pub mod timefmt;

// Re-export commonly used types
pub use atomic::{write_file_atomic, write_json_atomic};
pub use file_lock::ScopedLock;
pub use gates::{CouncilGate, GateReport, PhaseGate};
pub use ledger::{Ledger, LedgerError};
pub use orchestrator::{new_run_id, DriverError, DriverOptions, PhaseDriver};
