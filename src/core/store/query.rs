//! Bounded SQL escape hatch over the orchestrator's own store. Trusted
//! callers only; arbitrary statements run under a read-only check, a
//! wall-clock timeout, and a row cap.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::types::ValueRef;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Store;
use crate::core::error::{OrchestratorError, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub rows_affected: usize,
    /// True when more rows matched than `max_rows` allowed; excess rows
    /// are dropped, not errored.
    pub truncated: bool,
}

fn bind_json_param(
    stmt: &mut rusqlite::Statement<'_>,
    index: usize,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    match value {
        serde_json::Value::Null => stmt.raw_bind_parameter(index, None::<i64>),
        serde_json::Value::Bool(b) => stmt.raw_bind_parameter(index, *b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                stmt.raw_bind_parameter(index, i)
            } else {
                stmt.raw_bind_parameter(index, n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => stmt.raw_bind_parameter(index, s.as_str()),
        // Arrays and objects bind as their JSON text.
        other => stmt.raw_bind_parameter(index, other.to_string()),
    }
}

fn column_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(hex::encode(b)),
    }
}

fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::OperationInterrupted
    )
}

fn run_statement(
    db: &Connection,
    sql: &str,
    params: &[serde_json::Value],
    read_only: bool,
    max_rows: usize,
) -> Result<QueryOutput> {
    let mut stmt = db.prepare(sql)?;
    if read_only && !stmt.readonly() {
        return Err(OrchestratorError::QueryRejected(
            "statement would mutate data or schema but read_only was requested".to_string(),
        ));
    }
    let expected = stmt.parameter_count();
    if expected != params.len() {
        return Err(OrchestratorError::QueryRejected(format!(
            "statement expects {} parameter(s), got {}",
            expected,
            params.len()
        )));
    }
    for (i, value) in params.iter().enumerate() {
        bind_json_param(&mut stmt, i + 1, value)?;
    }

    if stmt.column_count() == 0 {
        let rows_affected = stmt.raw_execute()?;
        return Ok(QueryOutput {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
            truncated: false,
        });
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut out_rows = Vec::new();
    let mut truncated = false;
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        if out_rows.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(column_to_json(row.get_ref(i)?));
        }
        out_rows.push(values);
    }
    Ok(QueryOutput {
        columns,
        rows: out_rows,
        rows_affected: 0,
        truncated,
    })
}

impl Store {
    /// Execute a single statement with policy bounds. Timeout enforcement
    /// interrupts the statement through sqlite's interrupt handle, so a
    /// runaway query cannot hold the store lock past its budget.
    pub async fn execute_sql(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        read_only: bool,
        timeout_sec: u64,
        max_rows: usize,
    ) -> Result<QueryOutput> {
        if timeout_sec == 0 {
            return Err(OrchestratorError::QueryRejected(
                "timeout_sec must be greater than zero".to_string(),
            ));
        }

        // The statement runs on a blocking thread, never on a runtime
        // worker: a slow query must not stall the executor, and the
        // watchdog needs the async side free to fire the interrupt. The
        // interrupt handle is sent out once the connection lock is held,
        // so the budget covers statement time, not lock contention.
        let db = Arc::clone(self.db());
        let sql = sql.to_string();
        let params = params.to_vec();
        let (handle_tx, handle_rx) = oneshot::channel();
        let work = tokio::task::spawn_blocking(move || {
            let db = db.blocking_lock();
            let _ = handle_tx.send(db.get_interrupt_handle());
            run_statement(&db, &sql, &params, read_only, max_rows)
        });

        let finished = CancellationToken::new();
        let watchdog_done = finished.clone();
        let budget = Duration::from_secs(timeout_sec);
        let watchdog = tokio::spawn(async move {
            let Ok(interrupt) = handle_rx.await else { return };
            tokio::select! {
                _ = watchdog_done.cancelled() => {}
                _ = tokio::time::sleep(budget) => {
                    debug!("sql surface: interrupting statement past its budget");
                    interrupt.interrupt();
                }
            }
        });

        let joined = work.await;
        finished.cancel();
        watchdog.abort();
        let result = joined.map_err(|e| {
            OrchestratorError::QueryRejected(format!("query worker failed: {e}"))
        })?;

        match result {
            Err(OrchestratorError::Storage(ref e)) if is_interrupted(e) => {
                Err(OrchestratorError::Timeout(timeout_sec))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_returns_rows_and_columns() {
        let store = Store::open_in_memory().unwrap();
        store
            .mark_seen("listings", "craigslist", "item-1", None)
            .await
            .unwrap();

        let out = store
            .execute_sql(
                "SELECT task_id, provider FROM seen_items WHERE item_key = ?1",
                &[serde_json::json!("item-1")],
                true,
                5,
                100,
            )
            .await
            .unwrap();
        assert_eq!(out.columns, vec!["task_id", "provider"]);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0][0], serde_json::json!("listings"));
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn read_only_rejects_mutation() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .execute_sql("DELETE FROM task_runs", &[], true, 5, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QueryRejected(_)));
    }

    #[tokio::test]
    async fn writes_allowed_when_not_read_only() {
        let store = Store::open_in_memory().unwrap();
        let out = store
            .execute_sql(
                "INSERT INTO task_state (task_id, state_key, value, updated_by, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                &[
                    serde_json::json!("listings"),
                    serde_json::json!("cursor"),
                    serde_json::json!("42"),
                    serde_json::json!("sql-surface"),
                    serde_json::json!("2026-08-28T00:00:00+00:00"),
                ],
                false,
                5,
                100,
            )
            .await
            .unwrap();
        assert_eq!(out.rows_affected, 1);
    }

    #[tokio::test]
    async fn excess_rows_truncate_instead_of_erroring() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..10 {
            store
                .mark_seen("listings", "craigslist", &format!("item-{i}"), None)
                .await
                .unwrap();
        }
        let out = store
            .execute_sql("SELECT item_key FROM seen_items", &[], true, 5, 3)
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 3);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn parameter_count_mismatch_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .execute_sql(
                "SELECT * FROM task_runs WHERE run_id = ?1",
                &[],
                true,
                5,
                100,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QueryRejected(_)));
    }

    #[tokio::test]
    async fn runaway_statement_is_interrupted_at_its_budget() {
        let store = Store::open_in_memory().unwrap();
        let started = std::time::Instant::now();
        // Unbounded recursive CTE; only the interrupt can stop it.
        let err = store
            .execute_sql(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                 SELECT count(*) FROM c",
                &[],
                true,
                1,
                10,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(1)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .execute_sql("SELECT 1", &[], true, 0, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QueryRejected(_)));
    }
}
