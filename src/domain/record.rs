//! Ledger records and their derived read models.
//!
//! A [`LedgerRecord`] is one immutable fact in the hash-chained ledger.
//! `payload_hash` covers every field except the two hashes; `hash` binds the
//! payload hash to the previous record's hash, so the chain runs across
//! all runs in file order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Current ledger record schema
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

/// One line of the ledger file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub schema_version: u32,
    pub event_id: String,
    pub run_id: String,
    /// UTC RFC 3339 with trimmed nanoseconds
    pub ts: String,
    pub phase: String,
    pub action: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub prev_hash: String,
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default)]
    pub hash: String,
}

/// Hashed view of a record: every field except the hashes, in record order
#[derive(Serialize)]
struct Payload<'a> {
    schema_version: u32,
    event_id: &'a str,
    run_id: &'a str,
    ts: &'a str,
    phase: &'a str,
    action: &'a str,
    details: &'a Value,
    prev_hash: &'a str,
}

impl LedgerRecord {
    /// SHA-256 (hex) of the compact JSON payload
    pub fn compute_payload_hash(&self) -> Result<String, serde_json::Error> {
        let payload = Payload {
            schema_version: self.schema_version,
            event_id: &self.event_id,
            run_id: &self.run_id,
            ts: &self.ts,
            phase: &self.phase,
            action: &self.action,
            details: &self.details,
            prev_hash: &self.prev_hash,
        };
        let bytes = serde_json::to_vec(&payload)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Fill `payload_hash` and `hash` from the other fields
    pub fn seal(&mut self) -> Result<(), serde_json::Error> {
        self.payload_hash = self.compute_payload_hash()?;
        self.hash = chain_hash(&self.payload_hash, &self.prev_hash);
        Ok(())
    }
}

/// `SHA256(payload_hash + "\n" + prev_hash)` as hex
pub fn chain_hash(payload_hash: &str, prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize record details so equal payloads hash identically.
///
/// Absent, null and empty inputs become `{}`. Object keys are ordered by
/// `serde_json::Map` (a sorted map), and nested values are rebuilt so the
/// serialized form never depends on how the caller assembled them.
pub fn normalize_details(details: Option<Value>) -> Value {
    match details {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => canonicalize(value),
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Derived per-run view, rebuilt from the full ledger on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCache {
    pub run_id: String,
    pub event_count: usize,
    /// Last record for this run in ledger order
    pub latest: LedgerRecord,
    pub updated_at: String,
}

/// Outcome of verifying the whole ledger without raising
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub pass: bool,
    pub record_count: usize,
    /// 1-based index of the first bad record, `-1` when the chain verifies
    pub first_broken_index: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl VerifyReport {
    pub fn passing(record_count: usize) -> Self {
        Self {
            pass: true,
            record_count,
            first_broken_index: -1,
            message: String::new(),
        }
    }

    pub fn broken(record_count: usize, index: usize, message: impl Into<String>) -> Self {
        Self {
            pass: false,
            record_count,
            first_broken_index: index as i64,
            message: message.into(),
        }
    }

    /// One-line summary printed by `verify`
    pub fn summary_line(&self) -> String {
        if self.pass {
            format!("PASS records={}", self.record_count)
        } else {
            let message = if self.message.is_empty() {
                "unknown"
            } else {
                self.message.as_str()
            };
            format!(
                "FAIL records={} first_broken_index={} message={}",
                self.record_count, self.first_broken_index, message
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> LedgerRecord {
        LedgerRecord {
            schema_version: LEDGER_SCHEMA_VERSION,
            event_id: "evt-1".to_string(),
            run_id: "run-a".to_string(),
            ts: "2024-05-01T10:00:00Z".to_string(),
            phase: "discovery".to_string(),
            action: "phase_started".to_string(),
            details: json!({}),
            prev_hash: String::new(),
            payload_hash: String::new(),
            hash: String::new(),
        }
    }

    #[test]
    fn test_normalize_details() {
        assert_eq!(normalize_details(None), json!({}));
        assert_eq!(normalize_details(Some(Value::Null)), json!({}));

        let a = normalize_details(Some(json!({"b": {"y": 1, "x": 2}, "a": [3]})));
        let b = normalize_details(Some(json!({"a": [3], "b": {"x": 2, "y": 1}})));
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_seal_binds_prev_hash() {
        let mut first = record();
        first.seal().unwrap();
        assert_eq!(first.hash, chain_hash(&first.payload_hash, ""));
        assert_eq!(first.hash.len(), 64);

        let mut second = record();
        second.prev_hash = first.hash.clone();
        second.seal().unwrap();
        assert_ne!(second.payload_hash, first.payload_hash);
        assert_ne!(second.hash, first.hash);
    }

    #[test]
    fn test_summary_line() {
        assert_eq!(VerifyReport::passing(3).summary_line(), "PASS records=3");
        assert_eq!(
            VerifyReport::broken(3, 2, "hash mismatch").summary_line(),
            "FAIL records=3 first_broken_index=2 message=hash mismatch"
        );
        assert_eq!(
            VerifyReport::broken(0, 1, "").summary_line(),
            "FAIL records=0 first_broken_index=1 message=unknown"
        );
    }
}
