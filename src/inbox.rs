//! Store mutations requested from outside the scheduler process.
//!
//! The lease holder is the only writer of `goals.json` and `tasks.json`.
//! CLI commands that change either store go through [`submit`]: with no
//! scheduler running the command takes the lease and applies directly,
//! otherwise it is appended to `inbox.jsonl` and the holder applies it at
//! the start of its next tick.
//!
//! The inbox is an append-only JSONL file guarded by a [`FileLock`];
//! draining reads every line and truncates under the same lock.

use crate::authority::{FileLock, LOCK_TIMEOUT, LeaderLease, LeadershipDecision};
use crate::config::VigilConfig;
use crate::error::{Result, VigilError};
use crate::goals::{Goal, GoalStore, Registration, load_goals_snapshot};
use crate::tasks::TaskQueue;
use crate::vigil_dirs::DataPaths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One queued mutation of the goal or task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StoreCommand {
    RegisterGoal { goal: Goal },
    SetEnabled { goal_id: String, enabled: bool },
    /// Drop terminal tasks last updated before `before`.
    PurgeTerminal { before: DateTime<Utc> },
}

/// What applying a [`StoreCommand`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Registered(Registration),
    Toggled { goal_id: String, enabled: bool },
    Purged(usize),
}

impl StoreCommand {
    pub fn apply(self, goals: &mut GoalStore, tasks: &mut TaskQueue) -> Result<CommandOutcome> {
        match self {
            Self::RegisterGoal { goal } => goals.register(goal).map(CommandOutcome::Registered),
            Self::SetEnabled { goal_id, enabled } => {
                goals.set_enabled(&goal_id, enabled)?;
                Ok(CommandOutcome::Toggled { goal_id, enabled })
            }
            Self::PurgeTerminal { before } => {
                tasks.purge_terminal_before(before).map(CommandOutcome::Purged)
            }
        }
    }

    /// Checks that can be made against a read-only snapshot, so a queued
    /// command is not silently dropped by the holder later.
    fn precheck(&self, paths: &DataPaths) -> Result<()> {
        match self {
            Self::RegisterGoal { goal } if goal.description.is_empty() => Err(
                VigilError::InvalidGoal("description must not be empty".to_owned()),
            ),
            Self::SetEnabled { goal_id, .. } => {
                let known = load_goals_snapshot(&paths.goals_file())?
                    .iter()
                    .any(|g| &g.id == goal_id);
                if known {
                    Ok(())
                } else {
                    Err(VigilError::NotFound(format!("goal {goal_id}")))
                }
            }
            _ => Ok(()),
        }
    }
}

/// Append-only command queue read by the lease holder.
#[derive(Debug, Clone)]
pub struct Inbox {
    path: PathBuf,
}

impl Inbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Append one command.
    pub fn push(&self, command: &StoreCommand) -> Result<()> {
        let mut line = serde_json::to_string(command)
            .map_err(|e| VigilError::Persistence(format!("cannot serialize command: {e}")))?;
        line.push('\n');

        let _guard = FileLock::acquire(self.lock_path(), LOCK_TIMEOUT)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                VigilError::Persistence(format!("cannot open {}: {e}", self.path.display()))
            })?;
        file.write_all(line.as_bytes()).map_err(|e| {
            VigilError::Persistence(format!("cannot append to {}: {e}", self.path.display()))
        })?;
        Ok(())
    }

    /// Take every queued command in submission order, leaving the inbox
    /// empty. Malformed lines are skipped.
    pub fn drain(&self) -> Result<Vec<StoreCommand>> {
        let _guard = FileLock::acquire(self.lock_path(), LOCK_TIMEOUT)?;
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(VigilError::Persistence(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };
        std::fs::remove_file(&self.path).map_err(|e| {
            VigilError::Persistence(format!("cannot clear {}: {e}", self.path.display()))
        })?;

        let commands = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(command) => Some(command),
                Err(e) => {
                    warn!("skipping malformed inbox entry: {e}");
                    None
                }
            })
            .collect::<Vec<_>>();
        if !commands.is_empty() {
            debug!(count = commands.len(), "drained inbox");
        }
        Ok(commands)
    }
}

/// Apply every queued command to the stores. Failing commands are logged and
/// dropped; the rest still apply.
pub fn apply_pending(inbox: &Inbox, goals: &mut GoalStore, tasks: &mut TaskQueue) -> Result<usize> {
    let commands = inbox.drain()?;
    let count = commands.len();
    for command in commands {
        match command.apply(goals, tasks) {
            Ok(outcome) => info!("applied queued command: {outcome:?}"),
            Err(e) => warn!("queued command failed: {e}"),
        }
    }
    Ok(count)
}

/// How [`submit`] handled a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// No scheduler held the data directory; the command was applied here.
    Applied(CommandOutcome),
    /// A running scheduler will apply the command on its next tick.
    Queued { leader_pid: u32 },
}

/// Apply `command` directly if no scheduler owns `paths`, else queue it for
/// the owner.
pub fn submit(config: &VigilConfig, paths: &DataPaths, command: StoreCommand) -> Result<Submission> {
    command.precheck(paths)?;

    let inbox = Inbox::new(paths.inbox_file());
    let lease = LeaderLease::new(paths.lease_file(), config.scheduler.lease_ttl());
    match lease.try_acquire_or_renew()? {
        LeadershipDecision::Leader { .. } => {
            let mut goals = GoalStore::open(paths.goals_file())?;
            let mut tasks = TaskQueue::open(paths.tasks_file(), config.scheduler.max_retries)?;
            // Earlier queued commands go first.
            apply_pending(&inbox, &mut goals, &mut tasks)?;
            let outcome = command.apply(&mut goals, &mut tasks)?;
            Ok(Submission::Applied(outcome))
        }
        LeadershipDecision::Follower { leader_pid, .. } => {
            inbox.push(&command)?;
            info!(leader_pid, "queued command for running scheduler");
            Ok(Submission::Queued { leader_pid })
        }
    }
}
