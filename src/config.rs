//! Configuration types for the vigil daemon.
//!
//! Loaded from `config.toml` under the data root. Every section is optional;
//! missing fields fall back to the defaults below. The admission thresholds
//! and retry/backoff constants are empirically chosen defaults, exposed so
//! deployments can tune them.

use crate::error::{Result, VigilError};
use crate::workload::WorkloadUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Control-loop timing, retries and self-heal.
    pub scheduler: SchedulerConfig,
    /// Admission-control thresholds.
    pub admission: AdmissionConfig,
    /// Which resource probe feeds admission control.
    pub resource: ResourceConfig,
    /// Workload backend endpoint and per-step timeouts.
    pub backend: BackendConfig,
    /// Context relay extraction settings.
    pub relay: RelayConfig,
    /// Ordered roster of workload units. Tasks rotate through it and each
    /// unit receives context relayed from its predecessor.
    pub workloads: Vec<WorkloadUnit>,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            admission: AdmissionConfig::default(),
            resource: ResourceConfig::default(),
            backend: BackendConfig::default(),
            relay: RelayConfig::default(),
            workloads: vec![
                WorkloadUnit::new("llama3.1:8b", 5_500),
                WorkloadUnit::new("qwen2.5:7b", 5_200),
            ],
        }
    }
}

/// Control-loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between daemon ticks.
    pub tick_interval_secs: u64,
    /// Initial self-heal backoff; doubles per consecutive unhealthy tick.
    pub heal_backoff_secs: u64,
    /// Ceiling for the self-heal backoff.
    pub heal_backoff_max_secs: u64,
    /// Terminal tasks older than this are dropped by the janitor.
    pub janitor_max_age_hours: u64,
    /// Retry bound given to newly created tasks.
    pub max_retries: u32,
    /// Seconds a data-directory lease stays valid without renewal.
    pub lease_ttl_secs: u64,
    /// Seconds between lease renewals while a tick is busy or idle.
    pub lease_heartbeat_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            heal_backoff_secs: 5,
            heal_backoff_max_secs: 300,
            janitor_max_age_hours: 168,
            max_retries: crate::tasks::DEFAULT_MAX_RETRIES,
            lease_ttl_secs: 60,
            lease_heartbeat_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Backoff for the `n`th consecutive unhealthy tick (1-based).
    pub fn heal_backoff(&self, consecutive_unhealthy: u32) -> Duration {
        let shift = consecutive_unhealthy.saturating_sub(1).min(16);
        let secs = self
            .heal_backoff_secs
            .saturating_mul(1u64 << shift)
            .min(self.heal_backoff_max_secs);
        Duration::from_secs(secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_heartbeat(&self) -> Duration {
        Duration::from_secs(self.lease_heartbeat_secs)
    }

    pub fn janitor_max_age(&self) -> chrono::Duration {
        let hours = i64::try_from(self.janitor_max_age_hours).unwrap_or(i64::MAX / 3600);
        chrono::Duration::hours(hours.min(24 * 365 * 100))
    }
}

/// Admission-control thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum predicted utilization (0..=1) at which a load is admitted.
    pub critical_threshold: f64,
    /// Utilization above which resident workloads are released first.
    pub cooldown_threshold: f64,
    /// Fixed per-load overhead added to every estimate (MiB).
    pub fixed_overhead: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            critical_threshold: 0.85,
            cooldown_threshold: 0.60,
            fixed_overhead: 512,
        }
    }
}

/// Resource probe selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// System RAM.
    #[default]
    SystemMemory,
    /// GPU memory via `nvidia-smi`.
    NvidiaSmi,
    /// Constants from `fixed_used` / `fixed_total`.
    Fixed,
}

/// Resource probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub probe: ProbeKind,
    /// Maximum seconds one sample may take.
    pub probe_timeout_secs: u64,
    /// Used MiB reported by the fixed probe.
    pub fixed_used: u64,
    /// Total MiB reported by the fixed probe.
    pub fixed_total: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::default(),
            probe_timeout_secs: 5,
            fixed_used: 0,
            fixed_total: 8_192,
        }
    }
}

/// Workload backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of an Ollama-compatible endpoint.
    pub base_url: String,
    /// How long a loaded unit may stay resident on the backend side.
    pub keep_alive: String,
    pub load_timeout_secs: u64,
    pub prime_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub release_timeout_secs: u64,
    /// Timeout for the reachability probe used by health checks.
    pub ping_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            keep_alive: "10m".to_owned(),
            load_timeout_secs: 180,
            prime_timeout_secs: 60,
            run_timeout_secs: 600,
            release_timeout_secs: 30,
            ping_timeout_secs: 5,
        }
    }
}

/// Context relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Sentences containing any of these (case-insensitive) become insights.
    pub keywords: Vec<String>,
    /// How many leading sentences of the output are scanned.
    pub sentence_window: usize,
    /// Insights longer than this many characters are truncated.
    pub max_insight_chars: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keywords: [
                "important",
                "key",
                "must",
                "should",
                "found",
                "result",
                "recommend",
                "conclusion",
                "next",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            sentence_window: 5,
            max_insight_chars: 200,
        }
    }
}

impl VigilConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| VigilError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VigilError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the scheduler cannot run safely.
    pub fn validate(&self) -> Result<()> {
        let a = &self.admission;
        if !(a.critical_threshold > 0.0 && a.critical_threshold <= 1.0) {
            return Err(VigilError::Config(format!(
                "admission.critical_threshold must be in (0, 1], got {}",
                a.critical_threshold
            )));
        }
        if !(a.cooldown_threshold > 0.0 && a.cooldown_threshold <= a.critical_threshold) {
            return Err(VigilError::Config(format!(
                "admission.cooldown_threshold must be in (0, critical_threshold], got {}",
                a.cooldown_threshold
            )));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(VigilError::Config(
                "scheduler.tick_interval_secs must be positive".to_owned(),
            ));
        }
        let s = &self.scheduler;
        if s.lease_heartbeat_secs == 0 || s.lease_heartbeat_secs >= s.lease_ttl_secs {
            return Err(VigilError::Config(format!(
                "scheduler.lease_heartbeat_secs must be in (0, lease_ttl_secs), got {} with ttl {}",
                s.lease_heartbeat_secs, s.lease_ttl_secs
            )));
        }
        if self.workloads.is_empty() {
            return Err(VigilError::Config(
                "at least one [[workloads]] entry is required".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for unit in &self.workloads {
            if unit.identifier.trim().is_empty() {
                return Err(VigilError::Config("workload identifier must not be empty".to_owned()));
            }
            if !seen.insert(unit.identifier.as_str()) {
                return Err(VigilError::Config(format!(
                    "duplicate workload identifier '{}'",
                    unit.identifier
                )));
            }
        }
        Ok(())
    }
}
