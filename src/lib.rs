//! Vigil: resource-aware, persistent autonomous task scheduler.
//!
//! Long-lived goals become concrete tasks; each task's workload is admitted
//! only if it fits under a hard resource ceiling, then driven through a
//! bounded load → prime → run → release lifecycle on an exclusive compute
//! slot. Context flows from one finished unit to the next, and the daemon
//! monitors and heals itself across restarts.
//!
//! # Architecture
//!
//! - **Resource**: snapshot probes and the admission predictor
//! - **Lifecycle**: the per-unit state machine with guaranteed release
//! - **Relay**: keyword-driven insight hand-off between consecutive units
//! - **Goals / Tasks**: durable registry and retrying queue
//! - **Health**: heartbeat, counters, dependency reachability
//! - **Orchestrator**: the single-threaded control loop over all of the above
//! - **Authority / Inbox**: single-writer lease on the data directory, and
//!   the queue other processes use to hand it mutations

pub mod authority;
pub mod config;
pub mod error;
pub mod goals;
pub mod health;
pub mod inbox;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod persist;
pub mod relay;
pub mod resource;
pub mod status;
pub mod tasks;
pub mod vigil_dirs;
pub mod workload;

pub use config::VigilConfig;
pub use error::{Result, VigilError};
pub use goals::{Goal, GoalPriority, GoalStore, Registration, Schedule};
pub use health::{HealthMonitor, HealthSnapshot};
pub use inbox::{StoreCommand, Submission};
pub use lifecycle::{LifecycleState, StepFailure, StepKind, WorkloadLifecycle};
pub use orchestrator::{Orchestrator, TickOutcome};
pub use relay::{ContextRelay, ExecutionContext};
pub use resource::{ResourcePredictor, ResourceSnapshot, ResourceSnapshotSource};
pub use tasks::{Task, TaskQueue, TaskStatus};
pub use vigil_dirs::DataPaths;
pub use workload::{OllamaBackend, WorkloadBackend, WorkloadInput, WorkloadUnit};
