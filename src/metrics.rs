//! Append-only execution metrics in SQLite.
//!
//! One row per completed lifecycle cycle. The scheduler never reads these
//! back; they exist for external reporting.

use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    tick_id       INTEGER NOT NULL,
    task_id       TEXT NOT NULL,
    unit          TEXT NOT NULL,
    outcome       TEXT NOT NULL,
    duration_ms   INTEGER NOT NULL,
    cost_observed INTEGER,
    recorded_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id);
";

/// One execution, as written to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub tick_id: u64,
    pub task_id: String,
    pub unit: String,
    /// `completed`, `retry`, `failed`, ...
    pub outcome: String,
    pub duration_ms: u64,
    /// Tokens consumed by the run (prompt plus output), when reported.
    pub cost_observed: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

/// SQLite-backed metrics sink.
///
/// Thread-safe via an internal `Mutex<Connection>`.
pub struct MetricsSink {
    conn: Mutex<Connection>,
}

impl MetricsSink {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::with_connection(conn)
    }

    /// A sink that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO executions \
             (tick_id, task_id, unit, outcome, duration_ms, cost_observed, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                i64::try_from(record.tick_id).unwrap_or(i64::MAX),
                record.task_id,
                record.unit,
                record.outcome,
                i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
                record.cost_observed.map(|c| i64::try_from(c).unwrap_or(i64::MAX)),
                record.recorded_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Number of recorded executions.
    pub fn count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))
            .map_err(sql_err)?;
        Ok(n.max(0) as u64)
    }

    /// Outcome labels recorded for `task_id`, oldest first.
    pub fn outcomes_for_task(&self, task_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT outcome FROM executions WHERE task_id = ?1 ORDER BY id ASC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![task_id], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;

        let mut outcomes = Vec::new();
        for r in rows {
            outcomes.push(r.map_err(sql_err)?);
        }
        Ok(outcomes)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VigilError::Metrics("metrics connection lock poisoned".to_owned()))
    }
}

fn sql_err(e: rusqlite::Error) -> VigilError {
    VigilError::Metrics(e.to_string())
}
