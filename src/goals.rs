//! Goal registry: durable, recurring or one-shot statements of intent.
//!
//! Goals are registered explicitly, mutated only after a derived task reaches
//! a terminal outcome, and never deleted automatically. The whole registry is
//! rewritten to `goals.json` on every mutation.

use crate::error::{Result, VigilError};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

/// Goal priority. Declaration order is the scheduling order: `Critical`
/// sorts before `High`, and so on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum GoalPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for GoalPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(label)
    }
}

impl FromStr for GoalPriority {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(VigilError::InvalidPriority(format!(
                "'{other}' (expected critical, high, normal or low)"
            ))),
        }
    }
}

/// How often a goal should produce work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run once, then never again.
    OneShot,
    /// Run whenever more than `secs` seconds have passed since the last run.
    Interval {
        /// Interval in seconds between runs.
        secs: u64,
    },
}

impl Schedule {
    /// Parse `once`, `<N>m`, `<N>h` or `<N>d` with `N >= 1`.
    pub fn parse(input: &str) -> Result<Self> {
        let text = input.trim().to_ascii_lowercase();
        if matches!(text.as_str(), "once" | "one-shot" | "oneshot") {
            return Ok(Self::OneShot);
        }

        let invalid = || {
            VigilError::InvalidSchedule(format!(
                "'{input}' (expected once, <N>m, <N>h or <N>d)"
            ))
        };

        let split = text.len().checked_sub(1).ok_or_else(invalid)?;
        if !text.is_char_boundary(split) {
            return Err(invalid());
        }
        let (count, unit) = text.split_at(split);
        let count: u64 = count.parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }

        let unit_secs = match unit {
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            _ => return Err(invalid()),
        };

        let secs = count.checked_mul(unit_secs).ok_or_else(invalid)?;
        Ok(Self::Interval { secs })
    }
}

impl FromStr for Schedule {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneShot => f.write_str("once"),
            Self::Interval { secs } => {
                if *secs >= 86_400 && secs % 86_400 == 0 {
                    write!(f, "every {} days", secs / 86_400)
                } else if *secs >= 3600 && secs % 3600 == 0 {
                    write!(f, "every {} hours", secs / 3600)
                } else {
                    write!(f, "every {} minutes", secs / 60)
                }
            }
        }
    }
}

/// A persistent unit of intent that generates tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// Stable hash of the description.
    pub id: String,
    pub description: String,
    pub priority: GoalPriority,
    pub schedule: Schedule,
    /// Time of the last terminal outcome of a derived task.
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    /// Workload unit this goal is pinned to. `None` follows the roster cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Goal {
    /// Create a new enabled goal that has never run.
    pub fn new(description: impl Into<String>, schedule: Schedule, priority: GoalPriority) -> Self {
        let description = description.into().trim().to_owned();
        Self {
            id: goal_id(&description),
            description,
            priority,
            schedule,
            last_run: None,
            enabled: true,
            success_count: 0,
            failure_count: 0,
            unit: None,
            created_at: Utc::now(),
        }
    }

    /// Pin this goal to a specific workload unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Returns `true` if the goal is enabled and its schedule condition holds at `now`.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }

        let Some(last) = self.last_run else {
            return true;
        };

        match self.schedule {
            Schedule::OneShot => false,
            Schedule::Interval { secs } => {
                let elapsed_ms = now.signed_duration_since(last).num_milliseconds();
                let interval_ms = i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX);
                elapsed_ms > interval_ms
            }
        }
    }
}

/// Stable goal identifier: first 16 hex chars of the BLAKE3 digest of the
/// trimmed description.
pub fn goal_id(description: &str) -> String {
    let digest = blake3::hash(description.trim().as_bytes());
    digest.to_hex().as_str()[..16].to_owned()
}

/// Result of [`GoalStore::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new goal was stored.
    Created(String),
    /// A goal with the same description already exists and was left untouched.
    Existing(String),
}

impl Registration {
    pub fn id(&self) -> &str {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }
}

/// Durable goal registry.
#[derive(Debug)]
pub struct GoalStore {
    goals: Vec<Goal>,
    path: Option<PathBuf>,
}

impl GoalStore {
    /// Open the registry at `path`, loading whatever was persisted there.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let goals = persist::load_collection(&path)?;
        debug!("loaded {} goals from {}", goals.len(), path.display());
        Ok(Self {
            goals,
            path: Some(path),
        })
    }

    /// A registry that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            goals: Vec::new(),
            path: None,
        }
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub fn get(&self, goal_id: &str) -> Option<&Goal> {
        self.goals.iter().find(|g| g.id == goal_id)
    }

    /// Register a goal. Duplicated descriptions keep the stored goal.
    pub fn register(&mut self, goal: Goal) -> Result<Registration> {
        if goal.description.is_empty() {
            return Err(VigilError::InvalidGoal("description must not be empty".to_owned()));
        }
        if let Schedule::Interval { secs: 0 } = goal.schedule {
            return Err(VigilError::InvalidSchedule("interval must be positive".to_owned()));
        }

        if self.get(&goal.id).is_some() {
            debug!(goal_id = %goal.id, "goal already registered");
            return Ok(Registration::Existing(goal.id));
        }

        info!(
            goal_id = %goal.id,
            priority = %goal.priority,
            schedule = %goal.schedule,
            "registered goal"
        );
        let id = goal.id.clone();
        self.goals.push(goal);
        self.persist()?;
        Ok(Registration::Created(id))
    }

    /// Enabled goals that are due now, most urgent first.
    pub fn due_goals(&self) -> Vec<Goal> {
        self.due_goals_at(Utc::now())
    }

    /// Enabled goals due at `now`, sorted ascending by priority. Ties keep
    /// registration order.
    pub fn due_goals_at(&self, now: DateTime<Utc>) -> Vec<Goal> {
        let mut due: Vec<Goal> = self
            .goals
            .iter()
            .filter(|g| g.is_due_at(now))
            .cloned()
            .collect();
        due.sort_by_key(|g| g.priority);
        due
    }

    /// Record a terminal outcome for a goal's task.
    pub fn mark_completed(&mut self, goal_id: &str, success: bool) -> Result<()> {
        self.mark_completed_at(goal_id, success, Utc::now())
    }

    pub fn mark_completed_at(
        &mut self,
        goal_id: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let goal = self
            .goals
            .iter_mut()
            .find(|g| g.id == goal_id)
            .ok_or_else(|| VigilError::NotFound(format!("goal {goal_id}")))?;

        goal.last_run = Some(now);
        if success {
            goal.success_count = goal.success_count.saturating_add(1);
        } else {
            goal.failure_count = goal.failure_count.saturating_add(1);
        }
        self.persist()
    }

    /// Enable or disable a goal by ID.
    pub fn set_enabled(&mut self, goal_id: &str, enabled: bool) -> Result<()> {
        let goal = self
            .goals
            .iter_mut()
            .find(|g| g.id == goal_id)
            .ok_or_else(|| VigilError::NotFound(format!("goal {goal_id}")))?;
        goal.enabled = enabled;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => persist::save_collection(path, &self.goals),
            None => Ok(()),
        }
    }
}

/// Read the persisted registry without taking ownership of the write path.
pub fn load_goals_snapshot(path: &std::path::Path) -> Result<Vec<Goal>> {
    persist::load_collection(path)
}
