//! Single-writer ownership of a data directory.
//!
//! Exactly one process may mutate the goal, task and health stores under a
//! data root. That process holds a file-backed [`LeaderLease`] and renews it
//! while it works; everyone else either fails fast (a second daemon, `once`)
//! or hands its change to the holder through the [`crate::inbox`].
//!
//! Read-modify-write of the lease file itself is serialized with a
//! [`FileLock`], so two processes starting together cannot both win.

use crate::error::{Result, VigilError};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// How long a [`FileLock`] acquisition may spin before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Lock files older than this are assumed orphaned by a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Result of a lease acquisition or renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipDecision {
    /// This instance owns the data directory after the attempt.
    Leader {
        /// `true` when the lease was taken over from an expired holder.
        takeover: bool,
    },
    /// Another live instance owns the data directory.
    Follower {
        leader_instance_id: String,
        leader_pid: u32,
        lease_expires_at: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    instance_id: String,
    pid: u32,
    started_at: u64,
    heartbeat_at: u64,
    lease_expires_at: u64,
}

/// File-backed lease naming the one process allowed to write a data root.
#[derive(Debug)]
pub struct LeaderLease {
    instance_id: String,
    pid: u32,
    path: PathBuf,
    ttl: Duration,
}

impl LeaderLease {
    /// A lease controller for this process. Nothing is written until
    /// [`try_acquire_or_renew`](Self::try_acquire_or_renew).
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            path: path.into(),
            ttl,
        }
    }

    /// Acquire the lease or fail with [`VigilError::Lease`] naming the holder.
    pub fn acquire(path: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let lease = Self::new(path, ttl);
        match lease.try_acquire_or_renew()? {
            LeadershipDecision::Leader { takeover } => {
                if takeover {
                    info!(path = %lease.path.display(), "took over expired scheduler lease");
                }
                Ok(lease)
            }
            LeadershipDecision::Follower {
                leader_instance_id,
                leader_pid,
                lease_expires_at,
            } => Err(VigilError::Lease(format!(
                "{} is held by scheduler {leader_instance_id} (pid {leader_pid}) until {}",
                lease.path.display(),
                format_epoch_millis(lease_expires_at)
            ))),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_acquire_or_renew(&self) -> Result<LeadershipDecision> {
        self.try_acquire_or_renew_at(now_epoch_millis())
    }

    /// Acquire or renew at `now_ms` (epoch milliseconds).
    pub fn try_acquire_or_renew_at(&self, now_ms: u64) -> Result<LeadershipDecision> {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let expires = now_ms.saturating_add(ttl_ms);

        let _guard = FileLock::acquire(lock_path_for(&self.path), LOCK_TIMEOUT)?;
        match read_lease(&self.path)? {
            None => {
                write_lease(&self.path, &self.record(now_ms, now_ms, expires))?;
                Ok(LeadershipDecision::Leader { takeover: false })
            }
            Some(existing) if existing.instance_id == self.instance_id => {
                write_lease(&self.path, &self.record(existing.started_at, now_ms, expires))?;
                Ok(LeadershipDecision::Leader { takeover: false })
            }
            Some(existing) if existing.lease_expires_at <= now_ms => {
                warn!(
                    previous = %existing.instance_id,
                    previous_pid = existing.pid,
                    "scheduler lease expired; taking over"
                );
                write_lease(&self.path, &self.record(now_ms, now_ms, expires))?;
                Ok(LeadershipDecision::Leader { takeover: true })
            }
            Some(existing) => Ok(LeadershipDecision::Follower {
                leader_instance_id: existing.instance_id,
                leader_pid: existing.pid,
                lease_expires_at: existing.lease_expires_at,
            }),
        }
    }

    /// Remove the lease file if this instance still holds it.
    pub fn release(&self) -> Result<()> {
        let _guard = FileLock::acquire(lock_path_for(&self.path), LOCK_TIMEOUT)?;
        match read_lease(&self.path)? {
            Some(existing) if existing.instance_id == self.instance_id => {
                std::fs::remove_file(&self.path)?;
                debug!(path = %self.path.display(), "released scheduler lease");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn record(&self, started_at: u64, heartbeat_at: u64, lease_expires_at: u64) -> LeaseRecord {
        LeaseRecord {
            instance_id: self.instance_id.clone(),
            pid: self.pid,
            started_at,
            heartbeat_at,
            lease_expires_at,
        }
    }
}

impl Drop for LeaderLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), "cannot release scheduler lease: {e}");
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

fn read_lease(path: &Path) -> Result<Option<LeaseRecord>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(VigilError::Lease(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };

    match serde_json::from_slice::<LeaseRecord>(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!("ignoring malformed scheduler lease at {}: {e}", path.display());
            Ok(None)
        }
    }
}

fn write_lease(path: &Path, record: &LeaseRecord) -> Result<()> {
    let json = serde_json::to_vec(record)
        .map_err(|e| VigilError::Lease(format!("cannot serialize lease: {e}")))?;
    crate::persist::write_atomic(path, &json)
}

/// Exclusive lock file, held for the guard's lifetime.
///
/// Created with `create_new`, so at most one holder exists at a time. A lock
/// left behind by a crashed process is evicted once it is older than 30 s.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Spin until the lock is ours or `timeout` elapses.
    pub fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = file.write_all(now_epoch_millis().to_string().as_bytes());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    evict_stale_lock(&path);
                    if started.elapsed() > timeout {
                        return Err(VigilError::Lease(format!(
                            "timed out waiting for lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => {
                    return Err(VigilError::Lease(format!(
                        "cannot create lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn evict_stale_lock(path: &Path) {
    let age = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
    if age.is_some_and(|age| age > STALE_LOCK_AGE) {
        warn!(path = %path.display(), "evicting stale lock");
        let _ = std::fs::remove_file(path);
    }
}

/// Current epoch time in milliseconds.
pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn format_epoch_millis(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map_or_else(|| ms.to_string(), |t| t.to_rfc3339())
}
