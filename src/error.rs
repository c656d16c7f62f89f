//! Error types for the vigil scheduler.
//!
//! Admission denials and shutdown requests are not errors; they surface as
//! [`crate::orchestrator::TickOutcome`] variants. Failures inside a workload
//! cycle are captured as [`crate::lifecycle::StepFailure`] and never leave the
//! lifecycle as `Err`.

/// Top-level error type for the scheduler daemon.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// The workload could not be loaded onto the exclusive resource.
    #[error("load failure: {0}")]
    Load(String),

    /// The priming probe against a loaded workload failed.
    #[error("warmup failure: {0}")]
    Warmup(String),

    /// The workload itself failed while executing.
    #[error("execution failure: {0}")]
    Execution(String),

    /// Releasing the resource failed. Non-fatal.
    #[error("release failure: {0}")]
    Release(String),

    /// Reading or writing a goal, task or health store failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A goal schedule string could not be parsed.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A goal priority string could not be parsed.
    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    /// A goal was rejected at registration time.
    #[error("invalid goal: {0}")]
    InvalidGoal(String),

    /// Unknown goal or task identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// A task status change outside the allowed transition graph.
    #[error("illegal task transition: {0}")]
    IllegalTransition(String),

    /// Another scheduler instance owns the data directory, or the
    /// ownership lease could not be read or written.
    #[error("lease error: {0}")]
    Lease(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Workload backend transport or protocol error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Resource snapshot source error.
    #[error("probe error: {0}")]
    Probe(String),

    /// Metrics sink error.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VigilError>;
