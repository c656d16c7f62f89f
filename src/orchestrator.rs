//! The control loop that ties the scheduler together.
//!
//! One tick is one pass through:
//!
//! ```text
//! HealthCheck ─┬─ unhealthy ─→ SelfHeal (backoff + janitor)
//!              └─ healthy ───→ GenerateTasks → SelectTask → AdmissionCheck
//!                              → Execute → RecordOutcome
//! ```
//!
//! Ticks never overlap and only one workload is resident at a time. The
//! cancellation token interrupts waits (tick interval, self-heal backoff)
//! but never an in-flight lifecycle step, so the held unit is always
//! released before the loop exits.
//!
//! A persistent orchestrator owns its data directory through a
//! [`LeaderLease`] taken in [`Orchestrator::open`] and renewed at every tick
//! and on a heartbeat while a tick or wait is in progress. Mutations from
//! other processes arrive through the [`Inbox`] and are applied at tick start.

use crate::authority::{LeaderLease, LeadershipDecision};
use crate::config::{SchedulerConfig, VigilConfig};
use crate::error::{Result, VigilError};
use crate::goals::{Goal, GoalStore, Registration};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::inbox::{Inbox, apply_pending};
use crate::lifecycle::{LifecycleState, StepTimeouts, WorkloadLifecycle};
use crate::metrics::{ExecutionRecord, MetricsSink};
use crate::relay::ContextRelay;
use crate::resource::{ResourcePredictor, ResourceSnapshotSource};
use crate::tasks::{Task, TaskQueue, TaskStatus};
use crate::vigil_dirs::DataPaths;
use crate::workload::{WorkloadBackend, WorkloadInput, WorkloadRoster, WorkloadUnit};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Health check failed; waited out the backoff and ran the janitor.
    SelfHealed { purged: usize },
    /// No pending work.
    Idle,
    /// Admission denied; the task stays pending for a later tick.
    Deferred { task_id: String, reason: String },
    /// The task can never run and was moved to `Blocked`.
    Blocked { task_id: String, reason: String },
    /// A lifecycle cycle ran; `status` is where the task landed.
    Executed { task_id: String, status: TaskStatus },
    /// Shutdown was requested before the tick made progress.
    Shutdown,
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfHealed { purged } => write!(f, "self-healed (purged {purged})"),
            Self::Idle => write!(f, "idle"),
            Self::Deferred { task_id, reason } => write!(f, "deferred {task_id}: {reason}"),
            Self::Blocked { task_id, reason } => write!(f, "blocked {task_id}: {reason}"),
            Self::Executed { task_id, status } => write!(f, "executed {task_id} -> {status}"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Owns every store and collaborator; the only writer of goals and tasks.
pub struct Orchestrator {
    goals: GoalStore,
    tasks: TaskQueue,
    predictor: ResourcePredictor,
    lifecycle: WorkloadLifecycle,
    relay: ContextRelay,
    health: HealthMonitor,
    metrics: MetricsSink,
    lease: Option<LeaderLease>,
    lease_heartbeat: Duration,
    inbox: Option<Inbox>,
    roster: WorkloadRoster,
    backend: Arc<dyn WorkloadBackend>,
    scheduler: SchedulerConfig,
    backend_timeout: Duration,
    cancel: CancellationToken,
    tick_id: u64,
}

impl Orchestrator {
    /// Take ownership of the data directory, open all persisted stores under
    /// `paths`, recover interrupted work and apply queued commands.
    ///
    /// # Errors
    ///
    /// Fails with [`VigilError::Lease`] while another live scheduler owns
    /// `paths`, and when any persisted store is unreadable or corrupt.
    pub fn open(
        config: &VigilConfig,
        paths: &DataPaths,
        backend: Arc<dyn WorkloadBackend>,
        probe: Box<dyn ResourceSnapshotSource>,
    ) -> Result<Self> {
        let lease = LeaderLease::acquire(paths.lease_file(), config.scheduler.lease_ttl())?;
        info!(instance = lease.instance_id(), "acquired scheduler lease");

        let goals = GoalStore::open(paths.goals_file())?;
        let tasks = TaskQueue::open(paths.tasks_file(), config.scheduler.max_retries)?;
        let health = HealthMonitor::open(
            paths.health_file(),
            Arc::clone(&backend),
            Duration::from_secs(config.backend.ping_timeout_secs),
        )?;
        let metrics = MetricsSink::open(&paths.metrics_db())?;

        let mut orchestrator = Self::assemble(config, goals, tasks, health, metrics, backend, probe);
        orchestrator.lease = Some(lease);
        orchestrator.inbox = Some(Inbox::new(paths.inbox_file()));
        orchestrator.recover()?;
        orchestrator.apply_inbox();
        Ok(orchestrator)
    }

    /// An orchestrator that persists nothing.
    pub fn in_memory(
        config: &VigilConfig,
        backend: Arc<dyn WorkloadBackend>,
        probe: Box<dyn ResourceSnapshotSource>,
    ) -> Result<Self> {
        let health = HealthMonitor::in_memory(
            Arc::clone(&backend),
            Duration::from_secs(config.backend.ping_timeout_secs),
        );
        let metrics = MetricsSink::in_memory()?;
        Ok(Self::assemble(
            config,
            GoalStore::in_memory(),
            TaskQueue::in_memory(config.scheduler.max_retries),
            health,
            metrics,
            backend,
            probe,
        ))
    }

    fn assemble(
        config: &VigilConfig,
        goals: GoalStore,
        tasks: TaskQueue,
        health: HealthMonitor,
        metrics: MetricsSink,
        backend: Arc<dyn WorkloadBackend>,
        probe: Box<dyn ResourceSnapshotSource>,
    ) -> Self {
        let predictor = ResourcePredictor::new(probe, config.admission.clone())
            .with_sample_timeout(Duration::from_secs(config.resource.probe_timeout_secs));
        let lifecycle =
            WorkloadLifecycle::new(Arc::clone(&backend), StepTimeouts::from(&config.backend));

        Self {
            goals,
            tasks,
            predictor,
            lifecycle,
            relay: ContextRelay::new(config.relay.clone()),
            health,
            metrics,
            lease: None,
            lease_heartbeat: config.scheduler.lease_heartbeat(),
            inbox: None,
            roster: WorkloadRoster::new(config.workloads.clone()),
            backend,
            scheduler: config.scheduler.clone(),
            backend_timeout: Duration::from_secs(config.backend.ping_timeout_secs),
            cancel: CancellationToken::new(),
            tick_id: 0,
        }
    }

    /// Use `cancel` as the shutdown signal.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn goals(&self) -> &GoalStore {
        &self.goals
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn health(&self) -> &HealthSnapshot {
        self.health.snapshot()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn relay(&self) -> &ContextRelay {
        &self.relay
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    pub fn register_goal(&mut self, goal: Goal) -> Result<Registration> {
        self.goals.register(goal)
    }

    pub fn enqueue_task(&mut self, task: Task) -> Result<String> {
        self.tasks.enqueue(task)
    }

    /// Put tasks left `Running` by a previous process through the failure
    /// path. Goals whose task thereby became terminal record a failure.
    pub fn recover(&mut self) -> Result<Vec<String>> {
        let recovered = self.tasks.recover_interrupted()?;
        for task_id in &recovered {
            let Some(task) = self.tasks.get(task_id) else {
                continue;
            };
            if task.status == TaskStatus::Failed {
                if let Some(goal_id) = task.goal_id.clone() {
                    self.finish_goal(&goal_id, false)?;
                }
            }
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted tasks");
        }
        Ok(recovered)
    }

    /// Run a single tick.
    ///
    /// # Errors
    ///
    /// Persistence failures end the tick early; the next tick retries.
    /// [`VigilError::Lease`] means another scheduler took over the data
    /// directory and this one must stop.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(TickOutcome::Shutdown);
        }
        self.tick_id = self.tick_id.wrapping_add(1);
        let tick = self.tick_id;

        self.renew_lease()?;
        self.apply_inbox();

        // HealthCheck
        self.health.update(0, 0, None).await?;
        if !self.health.is_healthy() {
            return self.self_heal(tick).await;
        }

        // GenerateTasks
        for goal in self.goals.due_goals() {
            self.tasks.enqueue_if_absent(&goal)?;
        }

        // SelectTask
        let Some(task) = self.tasks.next() else {
            debug!(tick, "no pending tasks");
            return Ok(TickOutcome::Idle);
        };

        let (unit, from_cursor) = match self.resolve_unit(&task) {
            Ok(resolved) => resolved,
            Err(reason) => return self.block(&task, reason),
        };

        // AdmissionCheck
        let mut snapshot = self.predictor.sample().await;
        let advice = self.predictor.cooldown(snapshot.as_ref());
        if advice.needed {
            info!(tick, "{}; releasing resident units", advice.reason);
            self.cool_down().await;
            snapshot = self.predictor.sample().await;
        }

        if let Some(current) = &snapshot {
            if self.predictor.never_admissible(current, &unit) {
                let reason = format!(
                    "{} needs more than {:.0}% of {} even when idle",
                    unit,
                    self.predictor.policy().critical_threshold * 100.0,
                    current.total
                );
                return self.block(&task, reason);
            }
        }

        let decision = self.predictor.assess(snapshot.as_ref(), &unit);
        if !decision.safe {
            info!(
                tick,
                task_id = %task.id,
                unit = %unit.identifier,
                "admission deferred: {}",
                decision.reason
            );
            return Ok(TickOutcome::Deferred {
                task_id: task.id,
                reason: decision.reason,
            });
        }
        debug!(tick, task_id = %task.id, "admitted: {}", decision.reason);

        // Execute
        self.tasks
            .update_status(&task.id, TaskStatus::Running, None, None)?;
        let context = self
            .roster
            .predecessor(&unit.identifier)
            .and_then(|prev| self.relay.transfer(&prev.identifier, &unit.identifier));
        let input = WorkloadInput::new(&task.id, &task.description).with_context(context);
        let report = renewing(
            self.lease.as_ref(),
            self.lease_heartbeat,
            self.lifecycle.cycle(&unit, &input),
        )
        .await;

        // RecordOutcome
        let (status, error, cost_observed) = match &report.outcome {
            Ok(output) => {
                let status = self.tasks.update_status(
                    &task.id,
                    TaskStatus::Completed,
                    Some(output.text.clone()),
                    None,
                )?;
                let mut metadata = BTreeMap::new();
                metadata.insert("task_id".to_owned(), task.id.clone());
                metadata.insert("tick".to_owned(), tick.to_string());
                if let Some(goal_id) = &task.goal_id {
                    metadata.insert("goal_id".to_owned(), goal_id.clone());
                }
                self.relay.extract(&unit.identifier, &output.text, metadata);
                let tokens = output
                    .metrics
                    .prompt_tokens
                    .saturating_add(output.metrics.output_tokens);
                (status, None, Some(tokens))
            }
            Err(failure) => {
                let message = failure.to_string();
                let status = self.tasks.update_status(
                    &task.id,
                    TaskStatus::Failed,
                    None,
                    Some(message.clone()),
                )?;
                (status, Some(message), None)
            }
        };

        if status.is_terminal() {
            if let Some(goal_id) = &task.goal_id {
                self.finish_goal(goal_id, status == TaskStatus::Completed)?;
            }
        }

        let completed = u64::from(status == TaskStatus::Completed);
        let failed = u64::from(status == TaskStatus::Failed);
        let health_error = error.or_else(|| report.release_failure.as_ref().map(ToString::to_string));
        self.health.record_outcome(completed, failed, health_error)?;

        if from_cursor {
            self.roster.advance_past(&unit.identifier);
        }

        self.record_metrics(ExecutionRecord {
            tick_id: tick,
            task_id: task.id.clone(),
            unit: unit.identifier.clone(),
            outcome: outcome_label(status).to_owned(),
            duration_ms: report.elapsed.as_millis() as u64,
            cost_observed,
            recorded_at: Utc::now(),
        });

        info!(
            tick,
            task_id = %task.id,
            goal_id = task.goal_id.as_deref().unwrap_or("-"),
            unit = %unit.identifier,
            status = %status,
            "tick executed task"
        );
        Ok(TickOutcome::Executed {
            task_id: task.id,
            status,
        })
    }

    /// Tick every `interval` until cancelled, then stop cleanly.
    pub async fn run_daemon(&mut self, interval: Duration) -> Result<()> {
        info!(
            interval_secs = interval.as_secs(),
            goals = self.goals.goals().len(),
            tasks = self.tasks.tasks().len(),
            "scheduler daemon started"
        );

        loop {
            match self.tick().await {
                Ok(TickOutcome::Shutdown) => break,
                Ok(outcome) => debug!(tick = self.tick_id, "{outcome}"),
                Err(e @ VigilError::Lease(_)) => {
                    error!(tick = self.tick_id, "lost data directory ownership: {e}");
                    // The stores now belong to the new owner; only free the slot.
                    if let Some(failure) = self.lifecycle.release().await {
                        warn!("release after losing ownership: {failure}");
                    }
                    return Err(e);
                }
                Err(e) => error!(tick = self.tick_id, "tick failed: {e}"),
            }

            let cancel = &self.cancel;
            let cancelled = renewing(self.lease.as_ref(), self.lease_heartbeat, async {
                tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(interval) => false,
                }
            })
            .await;
            if cancelled {
                info!("shutdown requested");
                break;
            }
        }

        self.shutdown().await
    }

    /// One tick, then a clean stop.
    pub async fn run_once(&mut self) -> Result<TickOutcome> {
        let outcome = self.tick().await;
        self.shutdown().await?;
        outcome
    }

    /// Release anything still held, mark health as stopped and give up the
    /// data directory lease.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(failure) = self.lifecycle.release().await {
            warn!("release during shutdown: {failure}");
        }
        self.health.mark_stopped()?;
        if let Some(lease) = &self.lease {
            if let Err(e) = lease.release() {
                warn!("cannot release scheduler lease: {e}");
            }
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Confirm this process still owns the data directory.
    fn renew_lease(&self) -> Result<()> {
        let Some(lease) = &self.lease else {
            return Ok(());
        };
        match lease.try_acquire_or_renew()? {
            LeadershipDecision::Leader { takeover } => {
                if takeover {
                    warn!("scheduler lease had expired; reacquired");
                }
                Ok(())
            }
            LeadershipDecision::Follower {
                leader_instance_id,
                leader_pid,
                ..
            } => Err(VigilError::Lease(format!(
                "data directory now owned by scheduler {leader_instance_id} (pid {leader_pid})"
            ))),
        }
    }

    /// Apply commands queued by other processes. Failures are logged.
    fn apply_inbox(&mut self) {
        let Some(inbox) = &self.inbox else {
            return;
        };
        if let Err(e) = apply_pending(inbox, &mut self.goals, &mut self.tasks) {
            warn!("cannot read command inbox: {e}");
        }
    }

    async fn self_heal(&mut self, tick: u64) -> Result<TickOutcome> {
        let attempt = self.health.snapshot().consecutive_unhealthy.max(1);
        let backoff = self.scheduler.heal_backoff(attempt);
        warn!(
            tick,
            attempt,
            backoff_secs = backoff.as_secs(),
            "scheduler unhealthy; self-healing"
        );

        let cancel = &self.cancel;
        let cancelled = renewing(self.lease.as_ref(), self.lease_heartbeat, async {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(backoff) => false,
            }
        })
        .await;
        if cancelled {
            return Ok(TickOutcome::Shutdown);
        }

        let cutoff = Utc::now() - self.scheduler.janitor_max_age();
        let purged = self.tasks.purge_terminal_before(cutoff)?;
        Ok(TickOutcome::SelfHealed { purged })
    }

    /// Pick the unit for `task`: its pinned unit, else the roster cursor.
    /// The flag is `true` when the cursor was used.
    fn resolve_unit(&self, task: &Task) -> std::result::Result<(WorkloadUnit, bool), String> {
        match &task.unit {
            Some(identifier) => self
                .roster
                .find(identifier)
                .cloned()
                .map(|unit| (unit, false))
                .ok_or_else(|| format!("unknown workload unit '{identifier}'")),
            None => self
                .roster
                .current()
                .cloned()
                .map(|unit| (unit, true))
                .ok_or_else(|| "no workload units configured".to_owned()),
        }
    }

    fn block(&mut self, task: &Task, reason: String) -> Result<TickOutcome> {
        warn!(task_id = %task.id, "blocking task: {reason}");
        self.tasks
            .update_status(&task.id, TaskStatus::Blocked, None, Some(reason.clone()))?;
        if let Some(goal_id) = &task.goal_id {
            self.finish_goal(goal_id, false)?;
        }
        self.health.record_outcome(0, 1, Some(reason.clone()))?;
        Ok(TickOutcome::Blocked {
            task_id: task.id.clone(),
            reason,
        })
    }

    /// Evict everything the backend reports resident. Returns
    /// `(evicted, failed)`.
    async fn cool_down(&mut self) -> (usize, usize) {
        let resident = match tokio::time::timeout(self.backend_timeout, self.backend.resident()).await
        {
            Ok(Ok(resident)) => resident,
            Ok(Err(e)) => {
                warn!("cannot list resident units: {e}");
                return (0, 0);
            }
            Err(_) => {
                warn!("listing resident units timed out");
                return (0, 0);
            }
        };

        let (mut evicted, mut failed) = (0usize, 0usize);
        for identifier in resident {
            let result = renewing(
                self.lease.as_ref(),
                self.lease_heartbeat,
                self.lifecycle.evict(&identifier),
            )
            .await;
            // Each failure is already logged by evict.
            match result {
                Ok(()) => evicted += 1,
                Err(_) => failed += 1,
            }
        }
        if failed > 0 {
            warn!(evicted, failed, "cooldown left units resident");
        } else {
            info!(evicted, "cooldown eviction finished");
        }
        (evicted, failed)
    }

    fn finish_goal(&mut self, goal_id: &str, success: bool) -> Result<()> {
        if self.goals.get(goal_id).is_none() {
            debug!(goal_id, "owning goal no longer registered");
            return Ok(());
        }
        self.goals.mark_completed(goal_id, success)
    }

    fn record_metrics(&self, record: ExecutionRecord) {
        if let Err(e) = self.metrics.record(&record) {
            warn!(task_id = %record.task_id, "cannot record metrics: {e}");
        }
    }
}

/// Drive `work` to completion, renewing `lease` every `heartbeat` meanwhile.
async fn renewing<F: Future>(
    lease: Option<&LeaderLease>,
    heartbeat: Duration,
    work: F,
) -> F::Output {
    let Some(lease) = lease else {
        return work.await;
    };

    tokio::pin!(work);
    let mut beat = tokio::time::interval(heartbeat.max(Duration::from_millis(1)));
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    beat.tick().await;

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = beat.tick() => match lease.try_acquire_or_renew() {
                Ok(LeadershipDecision::Leader { .. }) => {}
                Ok(LeadershipDecision::Follower { leader_pid, .. }) => {
                    error!(leader_pid, "scheduler lease taken over mid-tick");
                }
                Err(e) => warn!("cannot renew scheduler lease: {e}"),
            },
        }
    }
}

fn outcome_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Completed => "completed",
        TaskStatus::Pending => "retry",
        TaskStatus::Failed => "failed",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Running => "running",
    }
}
