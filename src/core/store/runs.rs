use chrono::Utc;
use rusqlite::{Row, params};

use super::{Store, bad_column, parse_opt_ts, parse_ts, ts};
use crate::core::error::Result;
use crate::core::types::{RunStatus, TaskRun};

fn run_from_row(row: &Row) -> rusqlite::Result<TaskRun> {
    let status_raw: String = row.get(2)?;
    let status =
        RunStatus::from_status(&status_raw).ok_or_else(|| bad_column("run status", &status_raw))?;
    let queued_at_raw: String = row.get(9)?;
    Ok(TaskRun {
        run_id: row.get(0)?,
        task_id: row.get(1)?,
        status,
        requested_by: row.get(3)?,
        description: row.get(4)?,
        error: row.get(5)?,
        resume_token: row.get(6)?,
        user_response: row.get(7)?,
        killed_by: row.get(8)?,
        queued_at: parse_ts(&queued_at_raw)?,
        started_at: parse_opt_ts(row.get(10)?)?,
        finished_at: parse_opt_ts(row.get(11)?)?,
    })
}

const RUN_COLUMNS: &str = "run_id, task_id, status, requested_by, description, error, \
                           resume_token, user_response, killed_by, queued_at, started_at, \
                           finished_at";

impl Store {
    /// Create a run in `queued`. run_id is the sqlite rowid: unique and
    /// monotonic-ish, which is all ordering needs.
    pub async fn insert_run(
        &self,
        task_id: &str,
        requested_by: &str,
        description: Option<&str>,
    ) -> Result<TaskRun> {
        let queued_at = Utc::now();
        let run_id = {
            let db = self.db().lock().await;
            db.execute(
                "INSERT INTO task_runs (task_id, status, requested_by, description, queued_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task_id,
                    RunStatus::Queued.as_str(),
                    requested_by,
                    description,
                    ts(queued_at),
                ],
            )?;
            db.last_insert_rowid()
        };
        Ok(TaskRun {
            run_id,
            task_id: task_id.to_string(),
            status: RunStatus::Queued,
            requested_by: requested_by.to_string(),
            description: description.map(str::to_string),
            error: None,
            resume_token: None,
            user_response: None,
            killed_by: None,
            queued_at,
            started_at: None,
            finished_at: None,
        })
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<TaskRun>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE run_id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![run_id], run_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Newest first by queued time.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<TaskRun>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs ORDER BY queued_at DESC, run_id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn list_runs_with_status(
        &self,
        status: RunStatus,
        limit: usize,
    ) -> Result<Vec<TaskRun>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE status = ?1 \
             ORDER BY queued_at DESC, run_id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], run_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Queued runs oldest first, for the dispatch loop.
    pub async fn next_queued(&self, limit: usize) -> Result<Vec<TaskRun>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE status = 'queued' \
             ORDER BY queued_at ASC, run_id ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn count_runs_with_status(&self, status: RunStatus) -> Result<i64> {
        let db = self.db().lock().await;
        let count = db.query_row(
            "SELECT COUNT(*) FROM task_runs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Compare-and-set claim: queued -> running. False means someone else
    /// (a kill, usually) got there first.
    pub async fn claim_queued_run(&self, run_id: i64) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE task_runs SET status = 'running', started_at = ?2 \
             WHERE run_id = ?1 AND status = 'queued'",
            params![run_id, ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// Compare-and-set terminal transition from `running`. A run already
    /// terminal (killed under us) is left untouched and reported false.
    pub async fn complete_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE task_runs SET status = ?2, error = ?3, finished_at = ?4 \
             WHERE run_id = ?1 AND status = 'running'",
            params![run_id, status.as_str(), error, ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// running -> waiting_for_input, parking an opaque resumption token.
    pub async fn park_run(&self, run_id: i64, resume_token: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE task_runs SET status = 'waiting_for_input', resume_token = ?2 \
             WHERE run_id = ?1 AND status = 'running'",
            params![run_id, resume_token],
        )?;
        Ok(changed > 0)
    }

    /// waiting_for_input -> running, recording the user's response.
    pub async fn resume_run_record(&self, run_id: i64, user_response: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE task_runs SET status = 'running', user_response = ?2, started_at = ?3 \
             WHERE run_id = ?1 AND status = 'waiting_for_input'",
            params![run_id, user_response, ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// Kill is only valid while queued or running. Whichever of kill and
    /// completion lands first wins; the loser's update matches zero rows.
    pub async fn kill_run_record(&self, run_id: i64, requested_by: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE task_runs SET status = 'killed', killed_by = ?2, finished_at = ?3 \
             WHERE run_id = ?1 AND status IN ('queued', 'running')",
            params![run_id, requested_by, ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_then_complete_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let run = store.insert_run("inbox", "scheduler", None).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        assert!(store.claim_queued_run(run.run_id).await.unwrap());
        // Second claim loses the compare-and-set.
        assert!(!store.claim_queued_run(run.run_id).await.unwrap());

        assert!(
            store
                .complete_run(run.run_id, RunStatus::Done, None)
                .await
                .unwrap()
        );
        let done = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Done);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn reopen_fails_runs_abandoned_mid_flight() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("valet.db");
        let stale_id = {
            let store = Store::open(&db_path).await.unwrap();
            let run = store.insert_run("inbox", "scheduler", None).await.unwrap();
            store.claim_queued_run(run.run_id).await.unwrap();
            store.insert_run("inbox", "scheduler", None).await.unwrap();
            run.run_id
        };

        let store = Store::open(&db_path).await.unwrap();
        let stale = store.get_run(stale_id).await.unwrap().unwrap();
        assert_eq!(stale.status, RunStatus::Failed);
        assert!(stale.error.as_deref().unwrap().contains("orphaned"));
        assert!(stale.finished_at.is_some());

        // Queued runs survive the sweep and remain dispatchable.
        assert_eq!(
            store
                .count_runs_with_status(RunStatus::Queued)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn kill_never_overwrites_a_terminal_state() {
        let store = Store::open_in_memory().unwrap();
        let run = store.insert_run("inbox", "scheduler", None).await.unwrap();
        store.claim_queued_run(run.run_id).await.unwrap();
        store
            .complete_run(run.run_id, RunStatus::Done, None)
            .await
            .unwrap();

        assert!(!store.kill_run_record(run.run_id, "user").await.unwrap());
        let after = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(after.status, RunStatus::Done);
    }

    #[tokio::test]
    async fn completion_after_kill_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        let run = store.insert_run("inbox", "scheduler", None).await.unwrap();
        store.claim_queued_run(run.run_id).await.unwrap();
        assert!(store.kill_run_record(run.run_id, "user").await.unwrap());

        assert!(
            !store
                .complete_run(run.run_id, RunStatus::Done, None)
                .await
                .unwrap()
        );
        let after = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(after.status, RunStatus::Killed);
        assert_eq!(after.killed_by.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn park_and_resume_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let run = store.insert_run("inbox", "user", None).await.unwrap();
        store.claim_queued_run(run.run_id).await.unwrap();

        assert!(store.park_run(run.run_id, "cursor-7").await.unwrap());
        let waiting = store
            .list_runs_with_status(RunStatus::WaitingForInput, 10)
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].resume_token.as_deref(), Some("cursor-7"));

        assert!(store.resume_run_record(run.run_id, "yes, go ahead").await.unwrap());
        // Resuming a run that is no longer waiting is a no-op.
        assert!(!store.resume_run_record(run.run_id, "again").await.unwrap());
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_bounded() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_run("inbox", "scheduler", Some(&format!("sweep {i}")))
                .await
                .unwrap();
        }
        let runs = store.list_runs(3).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].run_id > runs[1].run_id);
        assert!(runs[1].run_id > runs[2].run_id);

        let queued = store.next_queued(10).await.unwrap();
        assert_eq!(queued.len(), 5);
        assert!(queued[0].run_id < queued[4].run_id);
    }
}
