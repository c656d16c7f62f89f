//! Liveness, counters and dependency health.
//!
//! The snapshot is rewritten to `health.json` on every update so that
//! `vigil status` can read it without touching the daemon. Counters and the
//! error ring survive restarts; `alive` and the heartbeat are rebuilt.

use crate::error::Result;
use crate::persist;
use crate::workload::WorkloadBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Capacity of the recent-error ring.
pub const MAX_RECENT_ERRORS: usize = 10;

/// Point-in-time scheduler health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub alive: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub dependencies_ok: bool,
    pub recent_errors: VecDeque<String>,
    #[serde(default)]
    pub consecutive_unhealthy: u32,
}

impl HealthSnapshot {
    fn fresh() -> Self {
        Self {
            alive: false,
            last_heartbeat: None,
            started_at: Utc::now(),
            uptime_secs: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            dependencies_ok: false,
            recent_errors: VecDeque::new(),
            consecutive_unhealthy: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.alive && self.dependencies_ok
    }

    /// `true` when no heartbeat landed within `max_age` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(heartbeat) = self.last_heartbeat else {
            return true;
        };
        match now.signed_duration_since(heartbeat).to_std() {
            Ok(age) => age > max_age,
            Err(_) => false,
        }
    }

    fn push_error(&mut self, error: String) {
        if self.recent_errors.len() >= MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error);
    }
}

/// Tracks heartbeat and outcomes, probing the backend on every update.
pub struct HealthMonitor {
    snapshot: HealthSnapshot,
    path: Option<PathBuf>,
    backend: Arc<dyn WorkloadBackend>,
    ping_timeout: Duration,
}

impl HealthMonitor {
    /// Open the monitor backed by `path`. Counters and the error ring carry
    /// over from the persisted snapshot; `alive`, the heartbeat, `started_at`,
    /// `dependencies_ok` and the unhealthy streak describe this process and
    /// start fresh. The file itself is untouched until the first update.
    pub fn open(
        path: impl Into<PathBuf>,
        backend: Arc<dyn WorkloadBackend>,
        ping_timeout: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let mut snapshot = HealthSnapshot::fresh();
        if let Some(prior) = persist::load_record::<HealthSnapshot>(&path)? {
            snapshot.tasks_completed = prior.tasks_completed;
            snapshot.tasks_failed = prior.tasks_failed;
            snapshot.recent_errors = prior.recent_errors;
            snapshot.recent_errors.truncate(MAX_RECENT_ERRORS);
        }
        Ok(Self {
            snapshot,
            path: Some(path),
            backend,
            ping_timeout,
        })
    }

    pub fn in_memory(backend: Arc<dyn WorkloadBackend>, ping_timeout: Duration) -> Self {
        Self {
            snapshot: HealthSnapshot::fresh(),
            path: None,
            backend,
            ping_timeout,
        }
    }

    pub fn snapshot(&self) -> &HealthSnapshot {
        &self.snapshot
    }

    pub fn is_healthy(&self) -> bool {
        self.snapshot.is_healthy()
    }

    /// Heartbeat, accumulate, probe dependencies, persist.
    pub async fn update(
        &mut self,
        completed_delta: u64,
        failed_delta: u64,
        error: Option<String>,
    ) -> Result<&HealthSnapshot> {
        self.accumulate(completed_delta, failed_delta, error);

        let reachable = match tokio::time::timeout(self.ping_timeout, self.backend.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("backend ping timed out after {:?}", self.ping_timeout)),
        };
        match reachable {
            Ok(()) => self.snapshot.dependencies_ok = true,
            Err(reason) => {
                warn!("dependency check failed: {reason}");
                self.snapshot.dependencies_ok = false;
                self.snapshot.push_error(reason);
            }
        }

        if self.snapshot.is_healthy() {
            self.snapshot.consecutive_unhealthy = 0;
        } else {
            self.snapshot.consecutive_unhealthy =
                self.snapshot.consecutive_unhealthy.saturating_add(1);
        }
        debug!(
            healthy = self.snapshot.is_healthy(),
            completed = self.snapshot.tasks_completed,
            failed = self.snapshot.tasks_failed,
            "health updated"
        );

        self.persist()?;
        Ok(&self.snapshot)
    }

    /// Record task outcomes without re-probing the backend.
    pub fn record_outcome(
        &mut self,
        completed_delta: u64,
        failed_delta: u64,
        error: Option<String>,
    ) -> Result<()> {
        self.accumulate(completed_delta, failed_delta, error);
        self.persist()
    }

    /// Clear `alive` on clean shutdown.
    pub fn mark_stopped(&mut self) -> Result<()> {
        self.snapshot.alive = false;
        self.persist()
    }

    fn accumulate(&mut self, completed_delta: u64, failed_delta: u64, error: Option<String>) {
        let now = Utc::now();
        self.snapshot.alive = true;
        self.snapshot.last_heartbeat = Some(now);
        self.snapshot.uptime_secs = now
            .signed_duration_since(self.snapshot.started_at)
            .num_seconds()
            .max(0) as u64;
        self.snapshot.tasks_completed = self.snapshot.tasks_completed.saturating_add(completed_delta);
        self.snapshot.tasks_failed = self.snapshot.tasks_failed.saturating_add(failed_delta);
        if let Some(error) = error {
            self.snapshot.push_error(error);
        }
    }

    fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => persist::save_record(path, &self.snapshot),
            None => Ok(()),
        }
    }
}

/// Read the persisted health snapshot, if one exists.
pub fn load_health_snapshot(path: &Path) -> Result<Option<HealthSnapshot>> {
    persist::load_record(path)
}
