//! Append-only, hash-chained event ledger.
//!
//! The ledger is newline-delimited JSON shared by every run in a repository.
//! Appends are serialized across processes by an exclusive lock on a sibling
//! `.lock` file; the previous hash is recomputed from the file under that
//! lock on every append, so nothing about the chain is cached in memory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::paths;
use crate::domain::record::{chain_hash, normalize_details};
use crate::domain::{LedgerRecord, RunCache, VerifyReport, LEDGER_SCHEMA_VERSION};

use super::atomic::{sync_directory, write_json_atomic};
use super::file_lock::ScopedLock;
use super::timefmt;

/// Errors raised by ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("run_id contains invalid path elements")]
    InvalidRunId,

    #[error("decode ledger line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Chain or record validation failure at a 1-based record index
    #[error("record {index}: {reason}")]
    Integrity { index: usize, reason: String },

    #[error("no ledger records found for run {0}")]
    NotFound(String),

    #[error("lock ledger {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encode ledger record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Ledger rooted at a repository working copy
#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
    ledger_path: PathBuf,
    lock_path: PathBuf,
}

impl Ledger {
    /// Open the ledger for `root` (nothing is created until the first append)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            ledger_path: paths::ledger_path(&root),
            lock_path: paths::ledger_lock_path(&root),
            root,
        }
    }

    pub fn path(&self) -> &Path {
        &self.ledger_path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append one record and return it.
    ///
    /// Blank `run_id`, `phase` or `action` is rejected before touching disk.
    pub fn append(
        &self,
        run_id: &str,
        phase: &str,
        action: &str,
        details: Option<Value>,
    ) -> Result<LedgerRecord, LedgerError> {
        let required: [(&'static str, &str); 3] =
            [("run_id", run_id), ("phase", phase), ("action", action)];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(LedgerError::MissingField(field));
            }
        }

        let ledger_dir = self
            .ledger_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&ledger_dir)?;

        let _lock = ScopedLock::acquire(&self.lock_path).map_err(|source| LedgerError::Lock {
            path: self.lock_path.clone(),
            source,
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.ledger_path)?;

        let prev_hash = last_hash(&mut file)?;

        let mut record = LedgerRecord {
            schema_version: LEDGER_SCHEMA_VERSION,
            event_id: format!("evt-{}", Uuid::new_v4().simple()),
            run_id: run_id.to_string(),
            ts: timefmt::now_rfc3339_nano(),
            phase: phase.to_string(),
            action: action.to_string(),
            details: normalize_details(details),
            prev_hash,
            payload_hash: String::new(),
            hash: String::new(),
        };
        record.seal()?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        file.seek(SeekFrom::End(0))?;
        file.write_all(&line)?;
        file.sync_all()?;
        sync_directory(&ledger_dir)?;

        debug!(
            run_id = %record.run_id,
            phase = %record.phase,
            action = %record.action,
            event_id = %record.event_id,
            "Appended ledger record"
        );
        Ok(record)
    }

    /// Read every record. A missing ledger is empty; a malformed line is fatal.
    pub fn load(&self) -> Result<Vec<LedgerRecord>, LedgerError> {
        match File::open(&self.ledger_path) {
            Ok(file) => decode_records(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Verify the whole ledger without raising.
    ///
    /// A line that cannot be decoded reports that line as the break.
    pub fn verify(&self) -> VerifyReport {
        match self.load() {
            Ok(records) => verification_report(&records),
            Err(LedgerError::Decode { line, source }) => {
                VerifyReport::broken(0, line, format!("decode ledger line {}: {}", line, source))
            }
            Err(err) => VerifyReport::broken(0, 1, err.to_string()),
        }
    }

    /// Rebuild and persist the cache file for one run.
    ///
    /// Integrity is global: any break in the chain blocks materialization,
    /// even when the broken record belongs to another run.
    pub fn materialize_run_cache(&self, run_id: &str) -> Result<(PathBuf, RunCache), LedgerError> {
        validate_run_id(run_id)?;

        let records = self.load()?;
        verify_chain(&records)?;

        let mut latest: Option<&LedgerRecord> = None;
        let mut event_count = 0usize;
        for record in records.iter().filter(|r| r.run_id == run_id) {
            latest = Some(record);
            event_count += 1;
        }
        let latest = latest.ok_or_else(|| LedgerError::NotFound(run_id.to_string()))?;

        let cache = RunCache {
            run_id: run_id.to_string(),
            event_count,
            latest: latest.clone(),
            updated_at: timefmt::now_rfc3339_nano(),
        };

        let cache_path = paths::run_cache_path(&self.root, run_id);
        write_json_atomic(&cache_path, &cache)?;

        info!(run_id, event_count, path = %cache_path.display(), "Materialized run cache");
        Ok((cache_path, cache))
    }
}

/// Reject run ids that could escape the cache directory
pub fn validate_run_id(run_id: &str) -> Result<(), LedgerError> {
    let trimmed = run_id.trim();
    if trimmed.is_empty()
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains("..")
        || trimmed.contains(std::path::MAIN_SEPARATOR)
    {
        return Err(LedgerError::InvalidRunId);
    }
    Ok(())
}

/// Decode JSONL records, skipping blank lines
fn decode_records<R: Read>(reader: R) -> Result<Vec<LedgerRecord>, LedgerError> {
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| LedgerError::Decode {
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Hash of the last record in an open ledger ("" when empty)
fn last_hash(file: &mut File) -> Result<String, LedgerError> {
    file.seek(SeekFrom::Start(0))?;
    let records = decode_records(&mut *file)?;
    Ok(records.last().map(|r| r.hash.clone()).unwrap_or_default())
}

/// Per-record checks that do not depend on the chain position
fn validate_record(record: &LedgerRecord) -> Result<(), String> {
    if record.schema_version != LEDGER_SCHEMA_VERSION {
        return Err(format!(
            "schema_version mismatch: got {} want {}",
            record.schema_version, LEDGER_SCHEMA_VERSION
        ));
    }

    let required = [
        ("event_id", &record.event_id),
        ("run_id", &record.run_id),
        ("phase", &record.phase),
        ("action", &record.action),
        ("ts", &record.ts),
        ("payload_hash", &record.payload_hash),
        ("hash", &record.hash),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(format!("{} is required", field));
        }
    }

    if !timefmt::is_canonical_utc(&record.ts) {
        return Err("ts must be UTC RFC3339Nano".to_string());
    }
    Ok(())
}

/// Check one record against the running previous hash
fn check_record(record: &LedgerRecord, prev_hash: &str) -> Result<(), String> {
    validate_record(record)?;

    if record.prev_hash != prev_hash {
        return Err(format!(
            "prev_hash mismatch: got {:?} want {:?}",
            record.prev_hash, prev_hash
        ));
    }

    let payload_hash = record
        .compute_payload_hash()
        .map_err(|e| format!("encode payload: {}", e))?;
    if record.payload_hash != payload_hash {
        return Err("payload_hash mismatch".to_string());
    }
    if record.hash != chain_hash(&payload_hash, &record.prev_hash) {
        return Err("hash mismatch".to_string());
    }
    Ok(())
}

/// Walk the chain in order; the first violation aborts with its 1-based index
pub fn verify_chain(records: &[LedgerRecord]) -> Result<(), LedgerError> {
    let mut prev_hash = String::new();
    for (idx, record) in records.iter().enumerate() {
        check_record(record, &prev_hash).map_err(|reason| LedgerError::Integrity {
            index: idx + 1,
            reason,
        })?;
        prev_hash = record.hash.clone();
    }
    Ok(())
}

/// Non-raising form of [`verify_chain`]
pub fn verification_report(records: &[LedgerRecord]) -> VerifyReport {
    match verify_chain(records) {
        Ok(()) => VerifyReport::passing(records.len()),
        Err(LedgerError::Integrity { index, reason }) => {
            VerifyReport::broken(records.len(), index, reason)
        }
        Err(err) => VerifyReport::broken(records.len(), 1, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_append_rejects_blank_fields() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());

        let err = ledger.append(" ", "discovery", "start", None).unwrap_err();
        assert_eq!(err.to_string(), "run_id is required");
        let err = ledger.append("r1", "", "start", None).unwrap_err();
        assert_eq!(err.to_string(), "phase is required");
        let err = ledger.append("r1", "discovery", "\t", None).unwrap_err();
        assert_eq!(err.to_string(), "action is required");

        // Validation happens before any I/O
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_append_chains_and_normalizes() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());

        let first = ledger.append("r1", "discovery", "started", None).unwrap();
        let second = ledger
            .append("r1", "discovery", "done", Some(json!({"z": 1, "a": {"y": 2, "b": 3}})))
            .unwrap();

        assert_eq!(first.prev_hash, "");
        assert_eq!(first.details, json!({}));
        assert!(first.event_id.starts_with("evt-"));
        assert_eq!(first.event_id.len(), 4 + 32);
        assert_eq!(second.prev_hash, first.hash);

        let raw = fs::read_to_string(ledger.path()).unwrap();
        assert!(raw.contains(r#""details":{"a":{"b":3,"y":2},"z":1}"#));

        let records = ledger.load().unwrap();
        assert_eq!(records, vec![first, second]);
        verify_chain(&records).unwrap();
    }

    #[test]
    fn test_load_missing_is_empty_and_blank_lines_skipped() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        assert!(ledger.load().unwrap().is_empty());
        assert!(ledger.verify().pass);

        ledger.append("r1", "discovery", "started", None).unwrap();
        let mut raw = fs::read_to_string(ledger.path()).unwrap();
        raw.push_str("\n   \n");
        fs::write(ledger.path(), raw).unwrap();
        assert_eq!(ledger.load().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        ledger.append("r1", "discovery", "started", None).unwrap();

        let mut file = OpenOptions::new().append(true).open(ledger.path()).unwrap();
        writeln!(file, "{{not json").unwrap();

        match ledger.load() {
            Err(LedgerError::Decode { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected decode error, got {:?}", other),
        }

        let report = ledger.verify();
        assert!(!report.pass);
        assert_eq!(report.first_broken_index, 2);

        // Appending on top of a corrupt ledger also refuses
        assert!(matches!(
            ledger.append("r1", "discovery", "again", None),
            Err(LedgerError::Decode { .. })
        ));
    }

    #[test]
    fn test_validate_run_id() {
        assert!(validate_run_id("a1b2c3").is_ok());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("../x").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id("a\\b").is_err());
        assert!(validate_run_id("..").is_err());
    }

    #[test]
    fn test_verify_reports_schema_and_timestamp_problems() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        let record = ledger.append("r1", "discovery", "started", None).unwrap();

        let mut wrong_schema = record.clone();
        wrong_schema.schema_version = 2;
        let report = verification_report(&[wrong_schema]);
        assert_eq!(report.message, "schema_version mismatch: got 2 want 1");
        assert_eq!(report.first_broken_index, 1);

        let mut local_time = record.clone();
        local_time.ts = "2024-05-01T12:00:00+02:00".to_string();
        let report = verification_report(&[local_time]);
        assert_eq!(report.message, "ts must be UTC RFC3339Nano");

        let mut no_action = record;
        no_action.action = String::new();
        let report = verification_report(&[no_action]);
        assert_eq!(report.message, "action is required");
    }
}
