//! Per-task key/value state and the "seen item" dedup set. Jobs use
//! these to carry cursors across runs and to skip already-processed
//! external items after a restart (at-least-once, not exactly-once).

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{Store, parse_ts, ts};
use crate::core::error::Result;

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStateEntry {
    pub task_id: String,
    pub state_key: String,
    pub value: serde_json::Value,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Last-writer-wins overwrite.
    pub async fn upsert_task_state(
        &self,
        task_id: &str,
        state_key: &str,
        value: &serde_json::Value,
        updated_by: &str,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT OR REPLACE INTO task_state (task_id, state_key, value, updated_by, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task_id,
                state_key,
                serde_json::to_string(value)?,
                updated_by,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Returns None when no entry exists; never fabricates a default.
    pub async fn get_task_state(
        &self,
        task_id: &str,
        state_key: &str,
    ) -> Result<Option<TaskStateEntry>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT value, updated_by, updated_at FROM task_state \
             WHERE task_id = ?1 AND state_key = ?2",
        )?;
        let mut rows = stmt.query_map(params![task_id, state_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (value_raw, updated_by, updated_at_raw) = row?;
                Ok(Some(TaskStateEntry {
                    task_id: task_id.to_string(),
                    state_key: state_key.to_string(),
                    value: serde_json::from_str(&value_raw)?,
                    updated_by,
                    updated_at: parse_ts(&updated_at_raw)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Idempotent insert: re-marking an item already seen is a success,
    /// and keeps the original metadata.
    pub async fn mark_seen(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let metadata_raw = metadata.map(serde_json::to_string).transpose()?;
        let db = self.db().lock().await;
        db.execute(
            "INSERT OR IGNORE INTO seen_items (task_id, provider, item_key, metadata, seen_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, provider, item_key, metadata_raw, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn has_seen(&self, task_id: &str, provider: &str, item_key: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM seen_items \
             WHERE task_id = ?1 AND provider = ?2 AND item_key = ?3",
            params![task_id, provider, item_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_is_last_writer_wins() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_task_state("listings", "last_page", &serde_json::json!(3), "run-1")
            .await
            .unwrap();
        store
            .upsert_task_state("listings", "last_page", &serde_json::json!(7), "run-2")
            .await
            .unwrap();

        let entry = store
            .get_task_state("listings", "last_page")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, serde_json::json!(7));
        assert_eq!(entry.updated_by, "run-2");
    }

    #[tokio::test]
    async fn missing_state_is_explicitly_absent() {
        let store = Store::open_in_memory().unwrap();
        assert!(
            store
                .get_task_state("listings", "nope")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn mark_seen_twice_is_a_no_op_success() {
        let store = Store::open_in_memory().unwrap();
        store
            .mark_seen(
                "listings",
                "craigslist",
                "item-1",
                Some(&serde_json::json!({"price": 120})),
            )
            .await
            .unwrap();
        // Second mark must not error and must not clobber metadata.
        store
            .mark_seen("listings", "craigslist", "item-1", None)
            .await
            .unwrap();

        assert!(
            store
                .has_seen("listings", "craigslist", "item-1")
                .await
                .unwrap()
        );
        assert!(
            !store
                .has_seen("listings", "zillow", "item-1")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn dedup_is_keyed_per_task_and_provider() {
        let store = Store::open_in_memory().unwrap();
        store
            .mark_seen("task-a", "craigslist", "item-1", None)
            .await
            .unwrap();
        assert!(!store.has_seen("task-b", "craigslist", "item-1").await.unwrap());
    }
}
