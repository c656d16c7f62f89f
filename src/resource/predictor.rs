//! Admission control against the resource ceiling.
//!
//! ```text
//! predicted = (used + estimated_cost + fixed_overhead) / total
//! safe      = predicted <= critical_threshold
//! cooldown  = used / total > cooldown_threshold
//! ```
//!
//! Decisions are pure functions of a snapshot. When no snapshot is
//! available the predictor denies: admission degrades toward refusal, never
//! toward silent approval.

use super::{ResourceSnapshot, ResourceSnapshotSource};
use crate::config::AdmissionConfig;
use crate::workload::WorkloadUnit;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    pub safe: bool,
    /// Predicted utilization after loading, when a snapshot was available.
    pub predicted: Option<f64>,
    pub reason: String,
}

/// Whether the currently resident workload should be released first.
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownAdvice {
    pub needed: bool,
    pub reason: String,
}

/// Decides whether a workload fits under the resource ceiling.
pub struct ResourcePredictor {
    source: Box<dyn ResourceSnapshotSource>,
    policy: AdmissionConfig,
    sample_timeout: Duration,
}

impl ResourcePredictor {
    pub fn new(source: Box<dyn ResourceSnapshotSource>, policy: AdmissionConfig) -> Self {
        Self {
            source,
            policy,
            sample_timeout: Duration::from_secs(5),
        }
    }

    /// Bound how long a single sample may take.
    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &AdmissionConfig {
        &self.policy
    }

    /// Take a snapshot. Failures and timeouts are logged and yield `None`.
    pub async fn sample(&self) -> Option<ResourceSnapshot> {
        match tokio::time::timeout(self.sample_timeout, self.source.sample()).await {
            Ok(Ok(snapshot)) => {
                debug!(
                    probe = self.source.name(),
                    used = snapshot.used,
                    total = snapshot.total,
                    "sampled resource"
                );
                Some(snapshot)
            }
            Ok(Err(e)) => {
                warn!(probe = self.source.name(), "resource probe failed: {e}");
                None
            }
            Err(_) => {
                warn!(
                    probe = self.source.name(),
                    "resource probe timed out after {:?}", self.sample_timeout
                );
                None
            }
        }
    }

    /// Sample and assess in one step.
    pub async fn can_admit(&self, unit: &WorkloadUnit) -> AdmissionDecision {
        let snapshot = self.sample().await;
        self.assess(snapshot.as_ref(), unit)
    }

    /// Decide admission for `unit` given `snapshot`.
    pub fn assess(&self, snapshot: Option<&ResourceSnapshot>, unit: &WorkloadUnit) -> AdmissionDecision {
        let Some(snapshot) = snapshot.filter(|s| s.total > 0) else {
            return AdmissionDecision {
                safe: false,
                predicted: None,
                reason: "resource snapshot unavailable; denying conservatively".to_owned(),
            };
        };

        let demand = snapshot
            .used
            .saturating_add(unit.estimated_cost)
            .saturating_add(self.policy.fixed_overhead);
        let predicted = demand as f64 / snapshot.total as f64;
        let safe = predicted <= self.policy.critical_threshold;

        let reason = format!(
            "predicted {:.1}% ({} + {} + {} of {}) {} limit {:.1}%",
            predicted * 100.0,
            snapshot.used,
            unit.estimated_cost,
            self.policy.fixed_overhead,
            snapshot.total,
            if safe { "within" } else { "exceeds" },
            self.policy.critical_threshold * 100.0
        );

        AdmissionDecision {
            safe,
            predicted: Some(predicted),
            reason,
        }
    }

    /// Sample and advise on cooldown in one step.
    pub async fn needs_cooldown(&self) -> CooldownAdvice {
        let snapshot = self.sample().await;
        self.cooldown(snapshot.as_ref())
    }

    /// Advise releasing resident workloads when utilization is above the
    /// cooldown threshold.
    pub fn cooldown(&self, snapshot: Option<&ResourceSnapshot>) -> CooldownAdvice {
        let Some(utilization) = snapshot.and_then(ResourceSnapshot::utilization) else {
            return CooldownAdvice {
                needed: false,
                reason: "resource snapshot unavailable".to_owned(),
            };
        };

        let needed = utilization > self.policy.cooldown_threshold;
        CooldownAdvice {
            needed,
            reason: format!(
                "utilization {:.1}% {} cooldown threshold {:.1}%",
                utilization * 100.0,
                if needed { "above" } else { "within" },
                self.policy.cooldown_threshold * 100.0
            ),
        }
    }

    /// `true` when `unit` would exceed the ceiling even on an empty resource.
    pub fn never_admissible(&self, snapshot: &ResourceSnapshot, unit: &WorkloadUnit) -> bool {
        if snapshot.total == 0 {
            return false;
        }
        let floor = unit.estimated_cost.saturating_add(self.policy.fixed_overhead);
        floor as f64 / snapshot.total as f64 > self.policy.critical_threshold
    }
}
