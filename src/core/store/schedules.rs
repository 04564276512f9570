use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

use super::{Store, bad_column, parse_opt_ts, ts};
use crate::core::error::Result;
use crate::core::types::{MisfirePolicy, Schedule, ScheduleMode};

/// Derived "last triggered" bookkeeping, owned by the schedule engine.
#[derive(Debug, Clone, Default)]
pub struct ScheduleMark {
    pub frequency_anchor: Option<DateTime<Utc>>,
    pub last_calendar_slot: Option<String>,
}

fn schedule_from_row(row: &Row) -> rusqlite::Result<Schedule> {
    let mode_raw: String = row.get(3)?;
    let mode =
        ScheduleMode::from_name(&mode_raw).ok_or_else(|| bad_column("schedule mode", &mode_raw))?;
    let policy_raw: String = row.get(5)?;
    let misfire_policy = MisfirePolicy::from_name(&policy_raw)
        .ok_or_else(|| bad_column("misfire policy", &policy_raw))?;
    let run_times_raw: String = row.get(8)?;
    let days_raw: String = row.get(9)?;
    Ok(Schedule {
        schedule_id: row.get(0)?,
        task_id: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        mode,
        execution_order: row.get(4)?,
        misfire_policy,
        run_frequency_minutes: row.get::<_, Option<i64>>(6)?.map(|m| m.max(0) as u32),
        timezone: row.get(7)?,
        run_times: serde_json::from_str(&run_times_raw)
            .map_err(|_| bad_column("run_times", &run_times_raw))?,
        days_of_week: serde_json::from_str(&days_raw)
            .map_err(|_| bad_column("days_of_week", &days_raw))?,
    })
}

const SCHEDULE_COLUMNS: &str = "schedule_id, task_id, enabled, mode, execution_order, \
                                misfire_policy, run_frequency_minutes, timezone, run_times, \
                                days_of_week";

impl Store {
    pub async fn upsert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT OR REPLACE INTO schedules \
             (schedule_id, task_id, enabled, mode, execution_order, misfire_policy, \
              run_frequency_minutes, timezone, run_times, days_of_week, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                schedule.schedule_id,
                schedule.task_id,
                schedule.enabled as i64,
                schedule.mode.as_str(),
                schedule.execution_order,
                schedule.misfire_policy.as_str(),
                schedule.run_frequency_minutes.map(|m| m as i64),
                schedule.timezone,
                serde_json::to_string(&schedule.run_times)?,
                serde_json::to_string(&schedule.days_of_week)?,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE schedule_id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![schedule_id], schedule_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All schedules in deterministic evaluation order: execution_order
    /// ascending, then schedule_id ascending.
    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY execution_order, schedule_id"
        ))?;
        let rows = stmt.query_map([], schedule_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        db.execute(
            "DELETE FROM schedule_marks WHERE schedule_id = ?1",
            params![schedule_id],
        )?;
        let deleted = db.execute(
            "DELETE FROM schedules WHERE schedule_id = ?1",
            params![schedule_id],
        )?;
        Ok(deleted > 0)
    }

    pub async fn get_schedule_mark(&self, schedule_id: &str) -> Result<ScheduleMark> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT frequency_anchor, last_calendar_slot FROM schedule_marks \
             WHERE schedule_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![schedule_id], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
            ))
        })?;
        match rows.next() {
            Some(row) => {
                let (anchor_raw, last_calendar_slot) = row?;
                Ok(ScheduleMark {
                    frequency_anchor: parse_opt_ts(anchor_raw)?,
                    last_calendar_slot,
                })
            }
            None => Ok(ScheduleMark::default()),
        }
    }

    pub async fn set_frequency_anchor(
        &self,
        schedule_id: &str,
        anchor: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO schedule_marks (schedule_id, frequency_anchor) VALUES (?1, ?2) \
             ON CONFLICT(schedule_id) DO UPDATE SET frequency_anchor = excluded.frequency_anchor",
            params![schedule_id, ts(anchor)],
        )?;
        Ok(())
    }

    pub async fn set_calendar_slot(&self, schedule_id: &str, slot: &str) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO schedule_marks (schedule_id, last_calendar_slot) VALUES (?1, ?2) \
             ON CONFLICT(schedule_id) DO UPDATE SET last_calendar_slot = excluded.last_calendar_slot",
            params![schedule_id, slot],
        )?;
        Ok(())
    }
}
