//! Centralized filesystem paths for vigil.
//!
//! Every persisted store lives under a single data root so that one
//! environment variable relocates the whole daemon.
//!
//! # Directory Layout
//!
//! | File | Purpose |
//! |------|---------|
//! | `config.toml` | Daemon configuration |
//! | `goals.json` | Goal registry |
//! | `tasks.json` | Task queue |
//! | `health.json` | Last health snapshot |
//! | `metrics.db` | Append-only execution metrics (SQLite) |
//! | `scheduler.lease` | Single-writer ownership lease |
//! | `inbox.jsonl` | Mutations queued for the lease holder |
//! | `logs/` | Daily rolling daemon logs |
//!
//! # Environment Overrides
//!
//! - `VIGIL_DATA_DIR`: overrides [`data_dir`]

use std::path::PathBuf;

/// Environment variable that designates the data directory root.
pub const DATA_DIR_ENV: &str = "VIGIL_DATA_DIR";

/// Data root directory.
///
/// Resolves to `dirs::data_dir()/vigil/` by default. Override with
/// the `VIGIL_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("vigil"))
        .unwrap_or_else(|| PathBuf::from("/tmp/vigil-data"))
}

/// Resolved store locations under one data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Paths rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths rooted at [`data_dir`].
    pub fn from_env() -> Self {
        Self::new(data_dir())
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn goals_file(&self) -> PathBuf {
        self.root.join("goals.json")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn health_file(&self) -> PathBuf {
        self.root.join("health.json")
    }

    pub fn metrics_db(&self) -> PathBuf {
        self.root.join("metrics.db")
    }

    pub fn lease_file(&self) -> PathBuf {
        self.root.join("scheduler.lease")
    }

    pub fn inbox_file(&self) -> PathBuf {
        self.root.join("inbox.jsonl")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
