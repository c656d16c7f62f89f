//! Bounded load → prime → run → release lifecycle for one workload unit.
//!
//! ```text
//! Idle → Loading → Warming → Executing → Unloading → Idle
//!           │         │          │            ▲
//!           └─────────┴──────────┴────────────┘  (on failure)
//! ```
//!
//! Every backend call carries a timeout; a timeout is treated like any other
//! step failure. Step failures are returned as [`StepFailure`] values and
//! never escape as errors. Release runs exactly once per acquire, and the
//! machine always comes back to `Idle`, even when release itself fails.
//!
//! Exclusivity comes from `&mut self`: a second unit cannot be acquired
//! while the first is held.

use crate::config::BackendConfig;
use crate::workload::{RunOutput, WorkloadBackend, WorkloadInput, WorkloadUnit};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing resident.
    Idle,
    /// Unit is being loaded.
    Loading,
    /// Priming request in flight.
    Warming,
    /// Real workload running.
    Executing,
    /// Unit is being released.
    Unloading,
}

impl LifecycleState {
    /// Returns `true` if a transition from `self` to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Idle, Self::Loading)
                | (Self::Loading, Self::Warming)
                | (Self::Warming, Self::Executing)
                | (Self::Loading | Self::Warming | Self::Executing, Self::Unloading)
                | (Self::Unloading, Self::Idle)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Warming => "warming",
            Self::Executing => "executing",
            Self::Unloading => "unloading",
        };
        f.write_str(label)
    }
}

/// Which lifecycle step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Load,
    Warmup,
    Execution,
    Release,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Load => "load",
            Self::Warmup => "warmup",
            Self::Execution => "execution",
            Self::Release => "release",
        };
        f.write_str(label)
    }
}

/// A failed lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: StepKind,
    pub message: String,
    pub timed_out: bool,
}

impl StepFailure {
    pub fn new(kind: StepKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timed_out: false,
        }
    }

    fn timeout(kind: StepKind, limit: Duration) -> Self {
        Self {
            kind,
            message: format!("{kind} timed out after {limit:?}"),
            timed_out: true,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.kind, self.message)
    }
}

/// Result of one lifecycle step.
pub type StepResult<T> = std::result::Result<T, StepFailure>;

/// Per-step deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub load: Duration,
    pub prime: Duration,
    pub run: Duration,
    pub release: Duration,
}

impl From<&BackendConfig> for StepTimeouts {
    fn from(config: &BackendConfig) -> Self {
        Self {
            load: Duration::from_secs(config.load_timeout_secs),
            prime: Duration::from_secs(config.prime_timeout_secs),
            run: Duration::from_secs(config.run_timeout_secs),
            release: Duration::from_secs(config.release_timeout_secs),
        }
    }
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

/// What one full cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub unit: String,
    /// Run output, or the first step that failed.
    pub outcome: StepResult<RunOutput>,
    /// Set when the closing release failed. Never affects `outcome`.
    pub release_failure: Option<StepFailure>,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Drives one workload unit at a time through its lifecycle.
pub struct WorkloadLifecycle {
    backend: Arc<dyn WorkloadBackend>,
    timeouts: StepTimeouts,
    state: LifecycleState,
    held: Option<WorkloadUnit>,
    release_failure: Option<StepFailure>,
}

impl WorkloadLifecycle {
    pub fn new(backend: Arc<dyn WorkloadBackend>, timeouts: StepTimeouts) -> Self {
        Self {
            backend,
            timeouts,
            state: LifecycleState::Idle,
            held: None,
            release_failure: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The unit currently resident, if any.
    pub fn held(&self) -> Option<&WorkloadUnit> {
        self.held.as_ref()
    }

    /// Load `unit`. On failure the unit is released and the machine is back
    /// in `Idle` before this returns.
    pub async fn acquire(&mut self, unit: &WorkloadUnit) -> StepResult<()> {
        if let Some(held) = &self.held {
            return Err(StepFailure::new(
                StepKind::Load,
                format!(
                    "cannot acquire {} while {} is resident",
                    unit.identifier, held.identifier
                ),
            ));
        }

        self.transition(LifecycleState::Loading);
        self.held = Some(unit.clone());
        self.release_failure = None;
        debug!(unit = %unit.identifier, "acquiring unit");

        let backend = Arc::clone(&self.backend);
        let result = bounded(StepKind::Load, self.timeouts.load, backend.load(unit)).await;
        if let Err(failure) = &result {
            warn!(unit = %unit.identifier, "{failure}");
            self.release().await;
        }
        result
    }

    /// Issue the minimal priming request against the held unit. On failure
    /// the unit is released immediately.
    pub async fn prime(&mut self) -> StepResult<()> {
        let Some(unit) = self.held.clone() else {
            return Err(StepFailure::new(StepKind::Warmup, "no unit is resident"));
        };

        self.transition(LifecycleState::Warming);
        let backend = Arc::clone(&self.backend);
        let result = bounded(StepKind::Warmup, self.timeouts.prime, backend.prime(&unit)).await;
        if let Err(failure) = &result {
            warn!(unit = %unit.identifier, "{failure}");
            self.release().await;
        }
        result
    }

    /// Execute the workload on the held unit. Failures are returned, and the
    /// unit stays resident until [`release`](Self::release).
    pub async fn run(&mut self, input: &WorkloadInput) -> StepResult<RunOutput> {
        let Some(unit) = self.held.clone() else {
            return Err(StepFailure::new(StepKind::Execution, "no unit is resident"));
        };

        self.transition(LifecycleState::Executing);
        let backend = Arc::clone(&self.backend);
        let result = bounded(
            StepKind::Execution,
            self.timeouts.run,
            backend.run(&unit, input),
        )
        .await;
        if let Err(failure) = &result {
            warn!(unit = %unit.identifier, task_id = %input.task_id, "{failure}");
        }
        result
    }

    /// Release the held unit. A no-op when nothing is resident, so a second
    /// call after an internal release does not unload twice.
    ///
    /// Returns the release failure, if any. The machine is `Idle` afterwards
    /// either way.
    pub async fn release(&mut self) -> Option<StepFailure> {
        let unit = self.held.take()?;

        self.transition(LifecycleState::Unloading);
        let backend = Arc::clone(&self.backend);
        let result = bounded(
            StepKind::Release,
            self.timeouts.release,
            backend.unload(&unit),
        )
        .await;
        self.transition(LifecycleState::Idle);

        match result {
            Ok(()) => {
                debug!(unit = %unit.identifier, "released unit");
                None
            }
            Err(failure) => {
                warn!(unit = %unit.identifier, "{failure}; continuing as idle");
                self.release_failure = Some(failure.clone());
                Some(failure)
            }
        }
    }

    /// acquire → prime → run → release for one unit.
    pub async fn cycle(&mut self, unit: &WorkloadUnit, input: &WorkloadInput) -> CycleReport {
        let started = Instant::now();

        let outcome = match self.acquire(unit).await {
            Err(failure) => Err(failure),
            Ok(()) => match self.prime().await {
                Err(failure) => Err(failure),
                Ok(()) => {
                    let outcome = self.run(input).await;
                    self.release().await;
                    outcome
                }
            },
        };

        let report = CycleReport {
            unit: unit.identifier.clone(),
            outcome,
            release_failure: self.release_failure.take(),
            elapsed: started.elapsed(),
        };
        info!(
            unit = %report.unit,
            task_id = %input.task_id,
            ok = report.succeeded(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "lifecycle cycle finished"
        );
        report
    }

    /// Unload a unit this lifecycle does not hold, e.g. one left resident
    /// by an earlier process. Only valid while idle.
    pub async fn evict(&mut self, identifier: &str) -> StepResult<()> {
        if self.state != LifecycleState::Idle {
            return Err(StepFailure::new(
                StepKind::Release,
                format!("cannot evict {identifier} while {}", self.state),
            ));
        }
        let unit = WorkloadUnit::new(identifier, 0);
        let backend = Arc::clone(&self.backend);
        let result = bounded(StepKind::Release, self.timeouts.release, backend.unload(&unit)).await;
        match &result {
            Ok(()) => info!(unit = %identifier, "evicted resident unit"),
            Err(failure) => warn!(unit = %identifier, "eviction {failure}"),
        }
        result
    }

    fn transition(&mut self, next: LifecycleState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "unexpected lifecycle transition");
        }
        self.state = next;
    }
}

async fn bounded<T>(
    kind: StepKind,
    limit: Duration,
    step: impl Future<Output = crate::Result<T>>,
) -> StepResult<T> {
    match tokio::time::timeout(limit, step).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StepFailure::new(kind, e.to_string())),
        Err(_) => Err(StepFailure::timeout(kind, limit)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::VigilError;
    use crate::workload::RunMetrics;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call and fails the steps it is told to.
    #[derive(Default)]
    struct ScriptedBackend {
        calls: Mutex<Vec<&'static str>>,
        fail: Mutex<Vec<&'static str>>,
        hang_run: bool,
    }

    impl ScriptedBackend {
        fn failing(steps: &[&'static str]) -> Self {
            Self {
                fail: Mutex::new(steps.to_vec()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn step(&self, name: &'static str) -> crate::Result<()> {
            self.calls.lock().unwrap().push(name);
            if self.fail.lock().unwrap().contains(&name) {
                Err(VigilError::Backend(format!("{name} refused")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl WorkloadBackend for ScriptedBackend {
        async fn load(&self, _unit: &WorkloadUnit) -> crate::Result<()> {
            self.step("load")
        }

        async fn prime(&self, _unit: &WorkloadUnit) -> crate::Result<()> {
            self.step("prime")
        }

        async fn run(&self, _unit: &WorkloadUnit, _input: &WorkloadInput) -> crate::Result<RunOutput> {
            if self.hang_run {
                self.calls.lock().unwrap().push("run");
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.step("run")?;
            Ok(RunOutput {
                text: "done".to_owned(),
                metrics: RunMetrics::default(),
            })
        }

        async fn unload(&self, _unit: &WorkloadUnit) -> crate::Result<()> {
            self.step("unload")
        }

        async fn ping(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn lifecycle(backend: Arc<ScriptedBackend>) -> WorkloadLifecycle {
        WorkloadLifecycle::new(backend, StepTimeouts::default())
    }

    fn unit() -> WorkloadUnit {
        WorkloadUnit::new("m", 100)
    }

    fn input() -> WorkloadInput {
        WorkloadInput::new("t1", "do it")
    }

    #[test]
    fn transitions_follow_the_diagram() {
        use LifecycleState::*;
        assert!(Idle.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Warming));
        assert!(Warming.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Unloading));
        assert!(Loading.can_transition_to(Unloading));
        assert!(Unloading.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Executing));
        assert!(!Loading.can_transition_to(Idle));
        assert!(!Executing.can_transition_to(Warming));
    }

    #[tokio::test]
    async fn successful_cycle_releases_once() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut lc = lifecycle(Arc::clone(&backend));

        let report = lc.cycle(&unit(), &input()).await;

        assert!(report.succeeded());
        assert_eq!(report.outcome.unwrap().text, "done");
        assert!(report.release_failure.is_none());
        assert_eq!(backend.calls(), vec!["load", "prime", "run", "unload"]);
        assert_eq!(lc.state(), LifecycleState::Idle);
        assert!(lc.held().is_none());
    }

    #[tokio::test]
    async fn load_failure_still_releases_and_skips_warming() {
        let backend = Arc::new(ScriptedBackend::failing(&["load"]));
        let mut lc = lifecycle(Arc::clone(&backend));

        let report = lc.cycle(&unit(), &input()).await;

        let failure = report.outcome.unwrap_err();
        assert_eq!(failure.kind, StepKind::Load);
        assert_eq!(backend.calls(), vec!["load", "unload"]);
        assert_eq!(lc.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn warmup_failure_releases_immediately() {
        let backend = Arc::new(ScriptedBackend::failing(&["prime"]));
        let mut lc = lifecycle(Arc::clone(&backend));

        let report = lc.cycle(&unit(), &input()).await;

        assert_eq!(report.outcome.unwrap_err().kind, StepKind::Warmup);
        assert_eq!(backend.calls(), vec!["load", "prime", "unload"]);
        assert_eq!(lc.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn execution_failure_is_captured() {
        let backend = Arc::new(ScriptedBackend::failing(&["run"]));
        let mut lc = lifecycle(Arc::clone(&backend));

        let report = lc.cycle(&unit(), &input()).await;

        let failure = report.outcome.unwrap_err();
        assert_eq!(failure.kind, StepKind::Execution);
        assert!(failure.message.contains("run refused"));
        assert_eq!(backend.calls(), vec!["load", "prime", "run", "unload"]);
    }

    #[tokio::test]
    async fn release_failure_still_resets_to_idle() {
        let backend = Arc::new(ScriptedBackend::failing(&["unload"]));
        let mut lc = lifecycle(Arc::clone(&backend));

        let report = lc.cycle(&unit(), &input()).await;

        assert!(report.succeeded());
        assert_eq!(report.release_failure.unwrap().kind, StepKind::Release);
        assert_eq!(lc.state(), LifecycleState::Idle);
        assert!(lc.held().is_none());

        // Next cycle starts clean.
        let report = lc.cycle(&unit(), &input()).await;
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn run_timeout_counts_as_failure() {
        let backend = Arc::new(ScriptedBackend {
            hang_run: true,
            ..ScriptedBackend::default()
        });
        let mut lc = WorkloadLifecycle::new(
            Arc::clone(&backend) as Arc<dyn WorkloadBackend>,
            StepTimeouts {
                run: Duration::from_millis(50),
                ..StepTimeouts::default()
            },
        );

        let report = lc.cycle(&unit(), &input()).await;

        let failure = report.outcome.unwrap_err();
        assert!(failure.timed_out);
        assert_eq!(failure.kind, StepKind::Execution);
        assert_eq!(backend.calls(), vec!["load", "prime", "run", "unload"]);
        assert_eq!(lc.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn second_acquire_is_refused_while_held() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut lc = lifecycle(Arc::clone(&backend));

        lc.acquire(&unit()).await.unwrap();
        let err = lc.acquire(&WorkloadUnit::new("other", 1)).await.unwrap_err();
        assert!(err.message.contains("while m is resident"));

        assert!(lc.release().await.is_none());
        assert!(lc.release().await.is_none());
        assert_eq!(backend.calls(), vec!["load", "unload"]);
    }

    #[tokio::test]
    async fn evict_requires_idle() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut lc = lifecycle(Arc::clone(&backend));

        assert!(lc.evict("stale").await.is_ok());
        lc.acquire(&unit()).await.unwrap();
        assert!(lc.evict("stale").await.is_err());
    }
}
