//! Read-only status report for `vigil status`.
//!
//! Built from the persisted snapshots only, so it never contends with a
//! running daemon for the write path.

use crate::error::Result;
use crate::goals::load_goals_snapshot;
use crate::health::{HealthSnapshot, load_health_snapshot};
use crate::tasks::{QueueCounts, TaskStatus, load_tasks_snapshot};
use crate::vigil_dirs::DataPaths;
use chrono::Utc;
use std::fmt;
use std::time::Duration;

/// A terminally failed or blocked task, with its last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub health: Option<HealthSnapshot>,
    /// `true` when the heartbeat is older than the staleness window.
    pub stale: bool,
    pub goals: usize,
    pub enabled_goals: usize,
    pub counts: QueueCounts,
    pub failed: Vec<FailedTask>,
}

impl StatusReport {
    /// Load the persisted snapshots under `paths`.
    ///
    /// A heartbeat older than `stale_after` marks the report stale.
    pub fn load(paths: &DataPaths, stale_after: Duration) -> Result<Self> {
        let health = load_health_snapshot(&paths.health_file())?;
        let goals = load_goals_snapshot(&paths.goals_file())?;
        let tasks = load_tasks_snapshot(&paths.tasks_file())?;

        let stale = health
            .as_ref()
            .is_none_or(|h| h.is_stale(Utc::now(), stale_after));
        let failed = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked))
            .map(|t| FailedTask {
                id: t.id.clone(),
                description: t.description.clone(),
                status: t.status,
                error: t.error.clone(),
            })
            .collect();

        Ok(Self {
            health,
            stale,
            goals: goals.len(),
            enabled_goals: goals.iter().filter(|g| g.enabled).count(),
            counts: QueueCounts::tally(&tasks),
            failed,
        })
    }

    /// Running, heartbeat fresh, dependencies reachable.
    pub fn is_healthy(&self) -> bool {
        !self.stale && self.health.as_ref().is_some_and(HealthSnapshot::is_healthy)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.health {
            None => writeln!(f, "health:    no daemon has run yet")?,
            Some(h) => {
                let state = if !h.alive {
                    "stopped"
                } else if self.stale {
                    "stale"
                } else if h.is_healthy() {
                    "healthy"
                } else {
                    "unhealthy"
                };
                writeln!(f, "health:    {state}")?;
                if let Some(beat) = h.last_heartbeat {
                    writeln!(f, "heartbeat: {}", beat.to_rfc3339())?;
                }
                writeln!(f, "uptime:    {}s", h.uptime_secs)?;
                writeln!(
                    f,
                    "backend:   {}",
                    if h.dependencies_ok { "reachable" } else { "unreachable" }
                )?;
                writeln!(
                    f,
                    "totals:    {} completed, {} failed",
                    h.tasks_completed, h.tasks_failed
                )?;
                for error in &h.recent_errors {
                    writeln!(f, "  recent error: {error}")?;
                }
            }
        }

        writeln!(f, "goals:     {} ({} enabled)", self.goals, self.enabled_goals)?;
        let c = &self.counts;
        writeln!(
            f,
            "tasks:     {} pending, {} running, {} completed, {} failed, {} blocked",
            c.pending, c.running, c.completed, c.failed, c.blocked
        )?;
        for task in &self.failed {
            writeln!(
                f,
                "  {} [{}] {}: {}",
                task.id,
                task.status,
                task.description,
                task.error.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}
