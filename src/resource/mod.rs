//! Resource accounting for the exclusive compute slot.
//!
//! A [`ResourceSnapshotSource`] samples current usage; the
//! [`ResourcePredictor`] turns a snapshot plus a workload's estimated cost
//! into an admission decision. Snapshots are ephemeral and never persisted.

pub mod predictor;
pub mod probe;

pub use predictor::{AdmissionDecision, CooldownAdvice, ResourcePredictor};
pub use probe::{
    FixedProbe, NvidiaSmiProbe, ResourceSnapshotSource, SystemMemoryProbe, probe_from_config,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time usage of the tracked resource, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub used: u64,
    pub total: u64,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(used: u64, total: u64) -> Self {
        Self {
            used,
            total,
            sampled_at: Utc::now(),
        }
    }

    /// Fraction of the resource in use, or `None` when `total` is zero.
    pub fn utilization(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.used as f64 / self.total as f64)
    }
}
