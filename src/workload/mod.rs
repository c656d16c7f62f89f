//! Workload units and the backend that loads and runs them.
//!
//! A [`WorkloadUnit`] is opaque to the scheduler beyond its identifier and
//! cost estimate. The [`WorkloadBackend`] trait is the seam to whatever
//! actually holds the exclusive compute slot; [`OllamaBackend`] talks to an
//! Ollama-compatible HTTP endpoint.

pub mod ollama;

pub use ollama::OllamaBackend;

use crate::error::Result;
use crate::relay::ExecutionContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The thing a task causes to be loaded and run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadUnit {
    /// Backend-specific identifier (e.g. `"llama3.1:8b"`).
    pub identifier: String,
    /// Estimated resource cost when resident, in the probe's unit (MiB).
    pub estimated_cost: u64,
}

impl WorkloadUnit {
    pub fn new(identifier: impl Into<String>, estimated_cost: u64) -> Self {
        Self {
            identifier: identifier.into(),
            estimated_cost,
        }
    }
}

impl fmt::Display for WorkloadUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (~{} MiB)", self.identifier, self.estimated_cost)
    }
}

/// Input handed to [`WorkloadBackend::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadInput {
    pub task_id: String,
    pub description: String,
    /// Context relayed from the predecessor unit, if it produced any.
    pub context: Option<ExecutionContext>,
}

impl WorkloadInput {
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Option<ExecutionContext>) -> Self {
        self.context = context;
        self
    }

    /// Task description followed by any relayed insights.
    pub fn prompt(&self) -> String {
        let Some(context) = self.context.as_ref().filter(|c| !c.insights.is_empty()) else {
            return self.description.clone();
        };

        let mut prompt = self.description.clone();
        prompt.push_str("\n\nContext from ");
        prompt.push_str(&context.producer_id);
        prompt.push(':');
        for insight in &context.insights {
            prompt.push_str("\n- ");
            prompt.push_str(insight);
        }
        prompt
    }
}

/// Cost metrics reported by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    /// Backend-reported wall time, in milliseconds.
    pub backend_ms: u64,
}

/// Successful run output.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub text: String,
    pub metrics: RunMetrics,
}

/// Backend that owns the exclusive compute slot.
///
/// Every method may block on the network; callers wrap each call in a
/// timeout.
#[async_trait]
pub trait WorkloadBackend: Send + Sync {
    /// Make `unit` resident.
    async fn load(&self, unit: &WorkloadUnit) -> Result<()>;

    /// One minimal request against the loaded unit.
    async fn prime(&self, unit: &WorkloadUnit) -> Result<()>;

    /// Execute the real workload.
    async fn run(&self, unit: &WorkloadUnit, input: &WorkloadInput) -> Result<RunOutput>;

    /// Release `unit`.
    async fn unload(&self, unit: &WorkloadUnit) -> Result<()>;

    /// Reachability check used by health monitoring.
    async fn ping(&self) -> Result<()>;

    /// Identifiers currently resident on the backend.
    async fn resident(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Ordered cycle of workload units.
///
/// Tasks without a pinned unit are assigned round-robin from the cursor.
/// The predecessor of a unit is the previous entry, wrapping.
#[derive(Debug, Clone)]
pub struct WorkloadRoster {
    units: Vec<WorkloadUnit>,
    cursor: usize,
}

impl WorkloadRoster {
    pub fn new(units: Vec<WorkloadUnit>) -> Self {
        Self { units, cursor: 0 }
    }

    pub fn units(&self) -> &[WorkloadUnit] {
        &self.units
    }

    /// Unit at the cursor, or `None` for an empty roster.
    pub fn current(&self) -> Option<&WorkloadUnit> {
        self.units.get(self.cursor)
    }

    pub fn find(&self, identifier: &str) -> Option<&WorkloadUnit> {
        self.units.iter().find(|u| u.identifier == identifier)
    }

    /// Previous unit in the cycle. A single-unit roster is its own
    /// predecessor.
    pub fn predecessor(&self, identifier: &str) -> Option<&WorkloadUnit> {
        let index = self.units.iter().position(|u| u.identifier == identifier)?;
        let prev = if index == 0 {
            self.units.len() - 1
        } else {
            index - 1
        };
        self.units.get(prev)
    }

    /// Move the cursor past `identifier`.
    pub fn advance_past(&mut self, identifier: &str) {
        if let Some(index) = self.units.iter().position(|u| u.identifier == identifier) {
            self.cursor = (index + 1) % self.units.len();
        }
    }
}
