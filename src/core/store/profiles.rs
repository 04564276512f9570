use chrono::Utc;
use rusqlite::{Row, params};

use super::{Store, bad_column, ts};
use crate::core::error::Result;
use crate::core::types::{RetryPolicy, TaskKind, TaskProfile};

fn profile_from_row(row: &Row) -> rusqlite::Result<TaskProfile> {
    let kind_raw: String = row.get(2)?;
    let kind = TaskKind::from_name(&kind_raw).ok_or_else(|| bad_column("task kind", &kind_raw))?;
    Ok(TaskProfile {
        task_id: row.get(0)?,
        name: row.get(1)?,
        kind,
        entrypoint: row.get(3)?,
        resources_path: row.get(4)?,
        queue_group: row.get(5)?,
        timeout_sec: row.get::<_, i64>(6)?.max(0) as u64,
        retry: RetryPolicy {
            max_attempts: row.get::<_, i64>(7)?.max(0) as u32,
            backoff_sec: row.get(8)?,
        },
        enabled: row.get::<_, i64>(9)? != 0,
    })
}

const PROFILE_COLUMNS: &str = "task_id, name, kind, entrypoint, resources_path, queue_group, \
                               timeout_sec, max_attempts, retry_backoff_sec, enabled";

impl Store {
    /// Idempotent by task_id: inserting twice updates in place.
    pub async fn upsert_profile(&self, profile: &TaskProfile) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT OR REPLACE INTO task_profiles \
             (task_id, name, kind, entrypoint, resources_path, queue_group, \
              timeout_sec, max_attempts, retry_backoff_sec, enabled, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                profile.task_id,
                profile.name,
                profile.kind.as_str(),
                profile.entrypoint,
                profile.resources_path,
                profile.queue_group,
                profile.timeout_sec as i64,
                profile.retry.max_attempts as i64,
                profile.retry.backoff_sec,
                profile.enabled as i64,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_profile(&self, task_id: &str) -> Result<Option<TaskProfile>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM task_profiles WHERE task_id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![task_id], profile_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn list_profiles(&self) -> Result<Vec<TaskProfile>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM task_profiles ORDER BY task_id"
        ))?;
        let rows = stmt.query_map([], profile_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn delete_profile(&self, task_id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let deleted = db.execute(
            "DELETE FROM task_profiles WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(task_id: &str) -> TaskProfile {
        TaskProfile {
            task_id: task_id.to_string(),
            name: "Inbox sweep".to_string(),
            kind: TaskKind::Script,
            entrypoint: "tasks/inbox_sweep.sh".to_string(),
            resources_path: None,
            queue_group: "mail".to_string(),
            timeout_sec: 120,
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_sec: 1.5,
            },
            enabled: true,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_task_id() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_profile(&profile("inbox")).await.unwrap();

        let mut updated = profile("inbox");
        updated.timeout_sec = 600;
        updated.enabled = false;
        store.upsert_profile(&updated).await.unwrap();

        let profiles = store.list_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].timeout_sec, 600);
        assert!(!profiles[0].enabled);
    }

    #[tokio::test]
    async fn get_and_delete() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_profile(&profile("inbox")).await.unwrap();

        let found = store.get_profile("inbox").await.unwrap().unwrap();
        assert_eq!(found.retry.max_attempts, 2);
        assert!(store.get_profile("missing").await.unwrap().is_none());

        assert!(store.delete_profile("inbox").await.unwrap());
        assert!(!store.delete_profile("inbox").await.unwrap());
    }
}
