//! Failure taxonomy shared by backends, gates and the supervisor.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a phase backend failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Overall phase deadline exceeded
    Timeout,
    /// No stream activity for the stall window
    Stall,
    /// No first event within the startup window
    StartupTimeout,
    /// Process exited non-zero
    ExitError,
    Unknown,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Stall => "stall",
            Self::StartupTimeout => "startup_timeout",
            Self::ExitError => "exit_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A phase gate rejected the work (or its backend reported a failure reason)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("phase {phase} gate verdict {verdict}: {message}")]
pub struct GateFailure {
    pub phase: u32,
    /// PASS | WARN | FAIL | BLOCKED | PARTIAL, or a backend failure reason
    pub verdict: String,
    pub message: String,
}

impl GateFailure {
    pub fn new(phase: u32, verdict: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            verdict: verdict.into(),
            message: message.into(),
        }
    }

    /// Carry a backend failure reason through the gate taxonomy
    pub fn from_reason(phase: u32, reason: FailureReason, message: impl Into<String>) -> Self {
        Self::new(phase, reason.as_str(), message)
    }
}

/// Structured failure class derived from a gate verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    PreMortemFail,
    CrankBlocked,
    CrankPartial,
    VibeFail,
    /// Any other verdict, lowercased
    Verdict(String),
}

impl FailureClass {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreMortemFail => "pre_mortem_fail",
            Self::CrankBlocked => "crank_blocked",
            Self::CrankPartial => "crank_partial",
            Self::VibeFail => "vibe_fail",
            Self::Verdict(verdict) => verdict,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a gate failure to its class. `None` in, `None` out.
///
/// Verdicts are trimmed and compared upper-case against the per-phase gate
/// table. Anything else (including backend reasons such as `timeout` or
/// `exit_error`) becomes [`FailureClass::Verdict`] with the lowercased text.
pub fn classify_gate_failure_class(
    phase: u32,
    gate: Option<&GateFailure>,
) -> Option<FailureClass> {
    let gate = gate?;
    let verdict = gate.verdict.trim().to_ascii_uppercase();

    let class = match (phase, verdict.as_str()) {
        (1, "FAIL") => FailureClass::PreMortemFail,
        (2, "BLOCKED") => FailureClass::CrankBlocked,
        (2, "PARTIAL") => FailureClass::CrankPartial,
        (3, "FAIL") => FailureClass::VibeFail,
        _ => FailureClass::Verdict(verdict.to_ascii_lowercase()),
    };
    Some(class)
}
