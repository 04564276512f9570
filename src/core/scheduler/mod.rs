//! Schedule engine: decides which schedules are due "now or since the
//! last check" and emits run requests. It never executes jobs and never
//! mutates schedule definitions, only their trigger bookkeeping marks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc, Weekday};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::Result;
use crate::core::runqueue::RunQueue;
use crate::core::store::Store;
use crate::core::types::ScheduleMode;

pub const SCHEDULER_REQUESTER: &str = "scheduler";

/// A `(schedule_id, task_id)` pair the engine found due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTrigger {
    pub schedule_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrequencyDecision {
    /// No anchor recorded yet: initialize to now, fire one interval later.
    Initialize,
    Wait,
    Fire { next_anchor: DateTime<Utc> },
}

/// Frequency mode: due when a full interval has elapsed since the anchor.
/// On a normal trigger the anchor advances by exactly one interval so
/// drift does not compound; when more than one interval elapsed (process
/// was down), queue_latest collapses the misses into one trigger and
/// resets the anchor to now.
pub(crate) fn frequency_decision(
    now: DateTime<Utc>,
    anchor: Option<DateTime<Utc>>,
    interval_minutes: u32,
) -> FrequencyDecision {
    let Some(anchor) = anchor else {
        return FrequencyDecision::Initialize;
    };
    let interval = chrono::Duration::minutes(interval_minutes as i64);
    if interval <= chrono::Duration::zero() {
        return FrequencyDecision::Wait;
    }
    let elapsed = now - anchor;
    if elapsed < interval {
        FrequencyDecision::Wait
    } else if elapsed >= interval * 2 {
        FrequencyDecision::Fire { next_anchor: now }
    } else {
        FrequencyDecision::Fire {
            next_anchor: anchor + interval,
        }
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Calendar mode: due when the wall clock in the schedule's timezone
/// matches a configured `(day, HH:MM)` and that specific `(date, HH:MM)`
/// slot has not fired yet. Returns the slot key to record on fire.
pub(crate) fn calendar_due(
    now: DateTime<Utc>,
    tz: &Tz,
    run_times: &[String],
    days_of_week: &[String],
    last_slot: Option<&str>,
) -> Option<String> {
    let local = now.with_timezone(tz);
    let day = weekday_name(local.weekday());
    if !days_of_week.iter().any(|d| d == day) {
        return None;
    }
    let hhmm = local.format("%H:%M").to_string();
    if !run_times.iter().any(|t| t == &hhmm) {
        return None;
    }
    let slot = format!("{} {}", local.format("%Y-%m-%d"), hhmm);
    if last_slot == Some(slot.as_str()) {
        return None;
    }
    Some(slot)
}

pub struct ScheduleEngine {
    store: Arc<Store>,
}

impl ScheduleEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Evaluate every enabled schedule against `now`. Due triggers come
    /// back in execution_order, then schedule_id order; disabled
    /// schedules are never evaluated.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<DueTrigger>> {
        let mut due = Vec::new();
        for schedule in self.store.list_schedules().await? {
            if !schedule.enabled {
                continue;
            }
            match schedule.mode {
                ScheduleMode::Frequency => {
                    let Some(minutes) = schedule.run_frequency_minutes else {
                        warn!(
                            schedule = %schedule.schedule_id,
                            "frequency schedule has no interval, skipping"
                        );
                        continue;
                    };
                    let mark = self.store.get_schedule_mark(&schedule.schedule_id).await?;
                    match frequency_decision(now, mark.frequency_anchor, minutes) {
                        FrequencyDecision::Initialize => {
                            self.store
                                .set_frequency_anchor(&schedule.schedule_id, now)
                                .await?;
                        }
                        FrequencyDecision::Wait => {}
                        FrequencyDecision::Fire { next_anchor } => {
                            self.store
                                .set_frequency_anchor(&schedule.schedule_id, next_anchor)
                                .await?;
                            due.push(DueTrigger {
                                schedule_id: schedule.schedule_id.clone(),
                                task_id: schedule.task_id.clone(),
                            });
                        }
                    }
                }
                ScheduleMode::Calendar => {
                    let tz_name = schedule.timezone.as_deref().unwrap_or("UTC");
                    let tz: Tz = match tz_name.parse() {
                        Ok(tz) => tz,
                        Err(_) => {
                            warn!(
                                schedule = %schedule.schedule_id,
                                timezone = tz_name,
                                "calendar schedule has unknown timezone, skipping"
                            );
                            continue;
                        }
                    };
                    let mark = self.store.get_schedule_mark(&schedule.schedule_id).await?;
                    if let Some(slot) = calendar_due(
                        now,
                        &tz,
                        &schedule.run_times,
                        &schedule.days_of_week,
                        mark.last_calendar_slot.as_deref(),
                    ) {
                        self.store
                            .set_calendar_slot(&schedule.schedule_id, &slot)
                            .await?;
                        due.push(DueTrigger {
                            schedule_id: schedule.schedule_id.clone(),
                            task_id: schedule.task_id.clone(),
                        });
                    }
                }
            }
        }
        Ok(due)
    }
}

/// Periodic tick: evaluate schedules and hand due triggers to the run
/// queue. Enqueue failures (a schedule pointing at a deleted or disabled
/// profile) are logged and never abort the loop.
pub async fn run_scheduler_loop(
    engine: Arc<ScheduleEngine>,
    run_queue: Arc<RunQueue>,
    tick: Duration,
    shutdown: CancellationToken,
) {
    info!("schedule engine loop started (tick {:?})", tick);
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let due = match engine.evaluate(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                warn!("schedule evaluation failed: {e}");
                continue;
            }
        };
        for trigger in due {
            debug!(
                schedule = %trigger.schedule_id,
                task = %trigger.task_id,
                "schedule due, enqueueing run"
            );
            if let Err(e) = run_queue
                .enqueue(
                    &trigger.task_id,
                    Some(&format!("schedule {}", trigger.schedule_id)),
                    SCHEDULER_REQUESTER,
                )
                .await
            {
                warn!(
                    schedule = %trigger.schedule_id,
                    task = %trigger.task_id,
                    "could not enqueue scheduled run: {e}"
                );
            }
        }
    }
    info!("schedule engine loop stopped");
}
