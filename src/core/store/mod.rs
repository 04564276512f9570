//! Durable orchestrator state on sqlite: task profiles, schedules and
//! their trigger bookkeeping, run records, the per-task state ledger,
//! the dedup set, and the bounded SQL surface.

mod ledger;
mod profiles;
mod query;
mod runs;
mod schedules;

pub use ledger::TaskStateEntry;
pub use query::QueryOutput;
pub use schedules::ScheduleMark;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::error::Result;
use crate::core::types::RunStatus;

pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(e.to_string()),
                    )
                })?;
            }
        }
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        let orphaned = Self::sweep_orphaned_runs(&db)?;
        if orphaned > 0 {
            warn!("failed {orphaned} run(s) left running by a previous process");
        }
        info!("orchestrator store opened at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Fresh private database, used for test isolation.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init_schema(db: &Connection) -> rusqlite::Result<()> {
        db.execute_batch("PRAGMA busy_timeout = 5000;")?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS task_profiles (
                task_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                entrypoint TEXT NOT NULL,
                resources_path TEXT,
                queue_group TEXT NOT NULL DEFAULT 'default',
                timeout_sec INTEGER NOT NULL DEFAULT 300,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                retry_backoff_sec REAL NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS schedules (
                schedule_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                mode TEXT NOT NULL,
                execution_order INTEGER NOT NULL DEFAULT 100,
                misfire_policy TEXT NOT NULL DEFAULT 'queue_latest',
                run_frequency_minutes INTEGER,
                timezone TEXT,
                run_times TEXT NOT NULL DEFAULT '[]',
                days_of_week TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Derived trigger bookkeeping, kept apart from the schedule
        // definitions the engine must never mutate.
        db.execute(
            "CREATE TABLE IF NOT EXISTS schedule_marks (
                schedule_id TEXT PRIMARY KEY,
                frequency_anchor TEXT,
                last_calendar_slot TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS task_runs (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                description TEXT,
                error TEXT,
                resume_token TEXT,
                user_response TEXT,
                killed_by TEXT,
                queued_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS task_state (
                task_id TEXT NOT NULL,
                state_key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (task_id, state_key)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS seen_items (
                task_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                item_key TEXT NOT NULL,
                metadata TEXT,
                seen_at TEXT NOT NULL,
                PRIMARY KEY (task_id, provider, item_key)
            )",
            [],
        )?;

        Ok(())
    }

    /// A run still `running` at open was abandoned by a crashed process
    /// and can never finish; fail it so status counts stay truthful.
    /// Queued and waiting runs survive restarts untouched.
    fn sweep_orphaned_runs(db: &Connection) -> rusqlite::Result<usize> {
        db.execute(
            "UPDATE task_runs SET status = ?1, error = ?2, finished_at = ?3 WHERE status = ?4",
            params![
                RunStatus::Failed.as_str(),
                "orphaned by process restart",
                ts(Utc::now()),
                RunStatus::Running.as_str(),
            ],
        )
    }

    pub(crate) fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn bad_column(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::from(format!("unexpected {what}: {value:?}")),
    )
}
