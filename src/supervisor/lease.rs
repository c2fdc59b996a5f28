//! Single-instance supervisor lease.
//!
//! The lease is an exclusive advisory lock on a lease file whose body holds
//! JSON metadata about the holder. The holder rewrites the metadata on a
//! renewal ticker so `expires_at` stays in the future while it is alive.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::file_lock::ScopedLock;
use crate::core::timefmt::parse_rfc3339;

/// Shortest renewal period, whatever the TTL
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("single-flight lease already held: {holder}")]
    AlreadyHeld { holder: String },

    #[error("acquire lease lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write lease metadata {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lease file body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseMetadata {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub acquired_at: String,
    #[serde(default)]
    pub renewed_at: String,
    /// Absent in older lease files, meaning the lease never expires
    #[serde(default)]
    pub expires_at: String,
}

impl LeaseMetadata {
    fn renew(&mut self, now: DateTime<Utc>, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        self.renewed_at = stamp(now);
        self.expires_at = stamp(now + ttl);
    }

    /// `run=<id> pid=<pid> host=<host> renewed_at=<ts>`
    pub fn holder_hint(&self) -> String {
        format!(
            "run={} pid={} host={} renewed_at={}",
            self.run_id, self.pid, self.host, self.renewed_at
        )
    }
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Whether `meta` has expired at `now`.
///
/// An empty `expires_at` never expires; an unparseable one counts as expired.
pub fn lease_expired(meta: &LeaseMetadata, now: DateTime<Utc>) -> bool {
    let raw = meta.expires_at.trim();
    if raw.is_empty() {
        return false;
    }
    match parse_rfc3339(raw) {
        Some(expires) => now > expires,
        None => true,
    }
}

fn read_metadata(path: &Path) -> Option<LeaseMetadata> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn holder_hint(path: &Path) -> String {
    match read_metadata(path) {
        Some(meta) if !meta.run_id.is_empty() => meta.holder_hint(),
        _ => format!("lock={}", path.display()),
    }
}

/// Truncate and rewrite the locked file in place, then fsync
fn write_metadata(mut file: &File, meta: &LeaseMetadata) -> io::Result<()> {
    let mut data = serde_json::to_vec_pretty(meta)?;
    data.push(b'\n');
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&data)?;
    file.sync_all()
}

fn hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
}

/// A held lease; dropping it stops renewal and releases the lock
#[derive(Debug)]
pub struct SupervisorLease {
    lock: Arc<ScopedLock>,
    meta: LeaseMetadata,
    stop: Option<Sender<()>>,
    renewer: Option<JoinHandle<()>>,
}

impl SupervisorLease {
    /// Take the lease at `path` without blocking
    pub fn acquire(
        path: &Path,
        cwd: &Path,
        ttl: Duration,
        run_id: &str,
    ) -> Result<Self, LeaseError> {
        let lock = match ScopedLock::try_acquire(path) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                return Err(LeaseError::AlreadyHeld {
                    holder: holder_hint(path),
                })
            }
            Err(source) => {
                return Err(LeaseError::Lock {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let now = Utc::now();
        let mut meta = LeaseMetadata {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            host: hostname(),
            cwd: cwd.display().to_string(),
            acquired_at: stamp(now),
            ..Default::default()
        };
        meta.renew(now, ttl);
        write_metadata(lock.file(), &meta).map_err(|source| LeaseError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        let lock = Arc::new(lock);
        let (stop, renewer) = spawn_renewal(lock.clone(), meta.clone(), ttl);
        info!(path = %path.display(), %run_id, ttl_secs = ttl.as_secs(), "Supervisor lease acquired");

        Ok(Self {
            lock,
            meta,
            stop: Some(stop),
            renewer: Some(renewer),
        })
    }

    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    /// Metadata as written at acquisition
    pub fn metadata(&self) -> &LeaseMetadata {
        &self.meta
    }

    /// Stop renewing and release the lock
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SupervisorLease {
    fn drop(&mut self) {
        // Closing the channel wakes the renewal thread immediately
        self.stop.take();
        if let Some(handle) = self.renewer.take() {
            let _ = handle.join();
        }
        info!(path = %self.lock.path().display(), "Supervisor lease released");
    }
}

/// Renewal period: half the TTL, at least [`MIN_RENEW_INTERVAL`]
pub fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(MIN_RENEW_INTERVAL)
}

fn spawn_renewal(
    lock: Arc<ScopedLock>,
    mut meta: LeaseMetadata,
    ttl: Duration,
) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let interval = renewal_interval(ttl);
    let handle = std::thread::spawn(move || loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                meta.renew(Utc::now(), ttl);
                match write_metadata(lock.file(), &meta) {
                    Ok(()) => debug!(expires_at = %meta.expires_at, "Supervisor lease renewed"),
                    Err(e) => warn!(error = %e, "Lease renewal failed"),
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    });
    (tx, handle)
}

/// Lease state as seen by an observer
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseStatus {
    Free,
    Held {
        metadata: Option<LeaseMetadata>,
        expired: bool,
    },
}

/// Report whether the lease at `path` is held, without keeping it
pub fn inspect_lease(path: &Path) -> Result<LeaseStatus, LeaseError> {
    if !path.exists() {
        return Ok(LeaseStatus::Free);
    }
    match ScopedLock::try_acquire(path) {
        Ok(Some(_probe)) => Ok(LeaseStatus::Free),
        Ok(None) => {
            let metadata = read_metadata(path);
            let expired = metadata
                .as_ref()
                .is_some_and(|meta| lease_expired(meta, Utc::now()));
            Ok(LeaseStatus::Held { metadata, expired })
        }
        Err(source) => Err(LeaseError::Lock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lease_expired_rules() {
        let now = Utc::now();
        let mut meta = LeaseMetadata::default();
        assert!(!lease_expired(&meta, now));

        meta.expires_at = "garbage".to_string();
        assert!(lease_expired(&meta, now));

        meta.expires_at = stamp(now + chrono::Duration::minutes(2));
        assert!(!lease_expired(&meta, now));

        meta.expires_at = stamp(now - chrono::Duration::seconds(1));
        assert!(lease_expired(&meta, now));
    }

    #[test]
    fn test_renewal_interval_floor() {
        assert_eq!(renewal_interval(Duration::from_secs(120)), Duration::from_secs(60));
        assert_eq!(renewal_interval(Duration::from_secs(10)), Duration::from_secs(15));
    }

    #[test]
    fn test_acquire_writes_metadata_and_blocks_second_holder() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".agents/rpi/supervisor.lock");

        let lease = SupervisorLease::acquire(&path, temp.path(), Duration::from_secs(120), "abc123")
            .unwrap();
        let meta = read_metadata(&path).unwrap();
        assert_eq!(meta.run_id, "abc123");
        assert_eq!(meta.pid, std::process::id());
        assert!(!lease_expired(&meta, Utc::now()));

        let err = SupervisorLease::acquire(&path, temp.path(), Duration::from_secs(120), "other")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("single-flight lease already held: run=abc123"));

        match inspect_lease(&path).unwrap() {
            LeaseStatus::Held { metadata, expired } => {
                assert_eq!(metadata.unwrap().run_id, "abc123");
                assert!(!expired);
            }
            LeaseStatus::Free => panic!("lease should be held"),
        }

        lease.release();
        assert_eq!(inspect_lease(&path).unwrap(), LeaseStatus::Free);
        SupervisorLease::acquire(&path, temp.path(), Duration::from_secs(120), "next").unwrap();
    }

    #[test]
    fn test_missing_lease_file_is_free() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            inspect_lease(&temp.path().join("none.lock")).unwrap(),
            LeaseStatus::Free
        );
    }
}
