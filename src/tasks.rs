//! Durable task queue with a closed status lifecycle and bounded retry.
//!
//! ```text
//! Pending → Running → Completed
//!    │         └────→ Failed ──(retries < max)──→ Pending
//!    └→ Blocked
//! ```
//!
//! A failed execution re-enters `Pending` in place (same task, same queue
//! position) until `retries` reaches `max_retries`, at which point the task
//! is terminally `Failed`. Every mutation rewrites `tasks.json`.

use crate::error::{Result, VigilError};
use crate::goals::Goal;
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default bound on execution retries per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Error recorded on tasks found `Running` when the daemon starts.
pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Terminal: retries are exhausted.
    Failed,
    /// Terminal: the task can never be admitted as configured.
    Blocked,
}

impl TaskStatus {
    /// `Pending` or `Running`: counts against goal de-duplication.
    pub fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_outstanding()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(label)
    }
}

/// One concrete, retryable unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal_id: Option<String>,
    pub description: String,
    /// Workload unit pinned by the owning goal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
}

impl Task {
    /// Create an ad hoc pending task.
    pub fn new(description: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal_id: None,
            description: description.into(),
            unit: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retries: 0,
            max_retries,
        }
    }

    /// Derive a pending task from a goal.
    pub fn from_goal(goal: &Goal, max_retries: u32) -> Self {
        let mut task = Self::new(goal.description.clone(), max_retries);
        task.goal_id = Some(goal.id.clone());
        task.unit = goal.unit.clone();
        task
    }
}

/// Per-status task counts, reported by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl QueueCounts {
    pub fn tally(tasks: &[Task]) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }
}

/// Durable FIFO task queue.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: Vec<Task>,
    path: Option<PathBuf>,
    default_max_retries: u32,
}

impl TaskQueue {
    /// Open the queue at `path`, loading whatever was persisted there.
    pub fn open(path: impl Into<PathBuf>, default_max_retries: u32) -> Result<Self> {
        let path = path.into();
        let tasks: Vec<Task> = persist::load_collection(&path)?;
        debug!("loaded {} tasks from {}", tasks.len(), path.display());
        Ok(Self {
            tasks,
            path: Some(path),
            default_max_retries,
        })
    }

    /// A queue that never touches disk.
    pub fn in_memory(default_max_retries: u32) -> Self {
        Self {
            tasks: Vec::new(),
            path: None,
            default_max_retries,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts::tally(&self.tasks)
    }

    /// The `Pending`/`Running` task referencing `goal_id`, if any.
    pub fn outstanding_for_goal(&self, goal_id: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.status.is_outstanding() && t.goal_id.as_deref() == Some(goal_id))
    }

    /// Append an ad hoc task. Returns its id.
    pub fn enqueue(&mut self, task: Task) -> Result<String> {
        let id = task.id.clone();
        info!(task_id = %id, "enqueued task");
        self.tasks.push(task);
        self.persist()?;
        Ok(id)
    }

    /// Enqueue a pending task for `goal` unless one is already outstanding.
    ///
    /// Returns the new task id, or `None` when the goal already has work queued.
    pub fn enqueue_if_absent(&mut self, goal: &Goal) -> Result<Option<String>> {
        if let Some(existing) = self.outstanding_for_goal(&goal.id) {
            debug!(
                goal_id = %goal.id,
                task_id = %existing.id,
                "goal already has an outstanding task"
            );
            return Ok(None);
        }

        let task = Task::from_goal(goal, self.default_max_retries);
        let id = task.id.clone();
        info!(goal_id = %goal.id, task_id = %id, priority = %goal.priority, "enqueued task for goal");
        self.tasks.push(task);
        self.persist()?;
        Ok(Some(id))
    }

    /// The oldest pending task.
    pub fn next(&self) -> Option<Task> {
        self.tasks
            .iter()
            .find(|t| t.status == TaskStatus::Pending)
            .cloned()
    }

    /// Move a task through its lifecycle.
    ///
    /// Requesting `Failed` on a running task consumes one retry: the task
    /// returns to `Pending` while `retries < max_retries`, and becomes
    /// terminally `Failed` once they are equal. Returns the status the task
    /// actually ended up in.
    pub fn update_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<TaskStatus> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| VigilError::NotFound(format!("task {task_id}")))?;

        let now = Utc::now();
        let landed = match (task.status, status) {
            (TaskStatus::Pending, TaskStatus::Running) => {
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                TaskStatus::Running
            }
            (TaskStatus::Running, TaskStatus::Completed) => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                task.result = result;
                task.error = None;
                TaskStatus::Completed
            }
            (TaskStatus::Running, TaskStatus::Failed) => {
                task.retries = task.retries.saturating_add(1).min(task.max_retries);
                task.error = error;
                if task.retries < task.max_retries {
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    info!(
                        task_id = %task.id,
                        retries = task.retries,
                        max_retries = task.max_retries,
                        "task failed, re-queued for retry"
                    );
                } else {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(now);
                    warn!(
                        task_id = %task.id,
                        retries = task.retries,
                        error = task.error.as_deref().unwrap_or(""),
                        "task failed permanently"
                    );
                }
                task.status
            }
            (TaskStatus::Pending, TaskStatus::Blocked) => {
                task.status = TaskStatus::Blocked;
                task.completed_at = Some(now);
                task.error = error;
                TaskStatus::Blocked
            }
            (from, to) => {
                return Err(VigilError::IllegalTransition(format!(
                    "task {task_id}: {from} -> {to}"
                )));
            }
        };

        self.persist()?;
        Ok(landed)
    }

    /// Put tasks left `Running` by a crash through the failure path.
    ///
    /// Returns the ids of the recovered tasks.
    pub fn recover_interrupted(&mut self) -> Result<Vec<String>> {
        let interrupted: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone())
            .collect();

        for task_id in &interrupted {
            warn!(task_id = %task_id, "recovering task interrupted by restart");
            self.update_status(
                task_id,
                TaskStatus::Failed,
                None,
                Some(INTERRUPTED_ERROR.to_owned()),
            )?;
        }
        Ok(interrupted)
    }

    /// Drop terminal tasks that finished before `cutoff`. Returns how many
    /// were removed.
    pub fn purge_terminal_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.tasks.len();
        self.tasks.retain(|t| {
            !(t.status.is_terminal() && t.completed_at.is_some_and(|done| done < cutoff))
        });
        let removed = before - self.tasks.len();
        if removed > 0 {
            info!(removed, "janitor dropped aged terminal tasks");
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => persist::save_collection(path, &self.tasks),
            None => Ok(()),
        }
    }
}

/// Read the persisted queue without taking ownership of the write path.
pub fn load_tasks_snapshot(path: &std::path::Path) -> Result<Vec<Task>> {
    persist::load_collection(path)
}
