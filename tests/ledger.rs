//! Ledger Integration Tests
//!
//! Tests for chain integrity across interleaved runs, tamper detection,
//! run cache materialization and concurrent appends.

use std::fs;
use std::sync::Arc;

use phasewarden::core::{Ledger, LedgerError};
use phasewarden::domain::{LedgerRecord, RunCache};
use serde_json::json;
use tempfile::TempDir;

fn rewrite_records(ledger: &Ledger, records: &[LedgerRecord]) {
    let body: String = records
        .iter()
        .map(|r| serde_json::to_string(r).unwrap() + "\n")
        .collect();
    fs::write(ledger.path(), body).unwrap();
}

#[test]
fn test_interleaved_runs_share_one_chain() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());

    let a1 = ledger.append("run-a", "discovery", "run_started", None).unwrap();
    let b1 = ledger
        .append("run-b", "discovery", "run_started", Some(json!({"goal": "b"})))
        .unwrap();
    let a2 = ledger.append("run-a", "implementation", "phase_started", None).unwrap();

    assert_eq!(a1.prev_hash, "");
    assert_eq!(b1.prev_hash, a1.hash);
    assert_eq!(a2.prev_hash, b1.hash);

    let report = ledger.verify();
    assert!(report.pass);
    assert_eq!(report.record_count, 3);
    assert_eq!(report.first_broken_index, -1);
    assert_eq!(report.summary_line(), "PASS records=3");
}

#[test]
fn test_tampered_details_reported_at_index() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());
    for phase in ["discovery", "implementation", "validation"] {
        ledger
            .append("run-a", phase, "phase_completed", Some(json!({"ok": true})))
            .unwrap();
    }

    let mut records = ledger.load().unwrap();
    records[1].details = json!({"ok": false});
    rewrite_records(&ledger, &records);

    let report = ledger.verify();
    assert!(!report.pass);
    assert_eq!(report.record_count, 3);
    assert_eq!(report.first_broken_index, 2);
    assert_eq!(report.message, "payload_hash mismatch");
    assert!(report
        .summary_line()
        .starts_with("FAIL records=3 first_broken_index=2"));
}

#[test]
fn test_reordered_records_break_prev_hash() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());
    ledger.append("run-a", "discovery", "one", None).unwrap();
    ledger.append("run-a", "discovery", "two", None).unwrap();

    let mut records = ledger.load().unwrap();
    records.swap(0, 1);
    rewrite_records(&ledger, &records);

    let report = ledger.verify();
    assert!(!report.pass);
    assert_eq!(report.first_broken_index, 1);
    assert!(report.message.starts_with("prev_hash mismatch"));
}

#[test]
fn test_non_utc_timestamp_rejected_even_when_rehashed() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());
    ledger.append("run-a", "discovery", "run_started", None).unwrap();

    let mut records = ledger.load().unwrap();
    records[0].ts = "2026-02-01T10:00:00+02:00".to_string();
    records[0].seal().unwrap();
    rewrite_records(&ledger, &records);

    let report = ledger.verify();
    assert!(!report.pass);
    assert_eq!(report.first_broken_index, 1);
    assert_eq!(report.message, "ts must be UTC RFC3339Nano");
}

#[test]
fn test_verify_is_repeatable() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());
    assert!(ledger.verify().pass);

    ledger.append("run-a", "discovery", "run_started", None).unwrap();
    let before = fs::read(ledger.path()).unwrap();
    let first = ledger.verify();
    let second = ledger.verify();
    assert_eq!(first, second);
    assert_eq!(before, fs::read(ledger.path()).unwrap());
}

#[test]
fn test_materialize_run_cache_folds_latest() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());
    ledger.append("run-a", "discovery", "run_started", None).unwrap();
    ledger.append("run-b", "discovery", "run_started", None).unwrap();
    let last = ledger
        .append("run-a", "validation", "run_completed", Some(json!({"epic_id": "ep-1"})))
        .unwrap();

    let (path, cache) = ledger.materialize_run_cache("run-a").unwrap();
    assert!(path.ends_with(".agents/rpi/runs/run-a.json"));
    assert_eq!(cache.event_count, 2);
    assert_eq!(cache.latest, last);

    let on_disk: RunCache = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk, cache);
}

#[test]
fn test_materialize_refuses_broken_chain_and_unknown_run() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());
    ledger.append("run-a", "discovery", "run_started", None).unwrap();
    ledger.append("run-b", "discovery", "run_started", None).unwrap();

    assert!(matches!(
        ledger.materialize_run_cache("run-zzz"),
        Err(LedgerError::NotFound(_))
    ));

    // Damage run-b's record; run-a's cache is still refused
    let mut records = ledger.load().unwrap();
    records[1].action = "edited".to_string();
    rewrite_records(&ledger, &records);

    assert!(matches!(
        ledger.materialize_run_cache("run-a"),
        Err(LedgerError::Integrity { index: 2, .. })
    ));
    assert!(!temp.path().join(".agents/rpi/runs/run-a.json").exists());
}

#[test]
fn test_materialize_rejects_path_traversal() {
    let temp = TempDir::new().unwrap();
    let ledger = Ledger::new(temp.path());
    ledger.append("run-a", "discovery", "run_started", None).unwrap();

    for bad in ["../escape", "a/b", "", "  "] {
        assert!(matches!(
            ledger.materialize_run_cache(bad),
            Err(LedgerError::InvalidRunId)
        ));
    }
}

#[test]
fn test_concurrent_appends_keep_chain_intact() {
    let temp = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::new(temp.path()));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                for step in 0..5 {
                    ledger
                        .append(
                            &format!("run-{}", worker),
                            "implementation",
                            "phase_started",
                            Some(json!({"step": step})),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = ledger.verify();
    assert!(report.pass, "{}", report.summary_line());
    assert_eq!(report.record_count, 20);
}
