use chrono::{DateTime, NaiveTime, Utc};

use crate::core::error::OrchestratorError;

/// Full lowercase weekday names, Monday first. Calendar schedules store
/// `days_of_week` as a subset of these.
pub const WEEKDAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Script,
    Module,
    Agentic,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Script => "script",
            TaskKind::Module => "module",
            TaskKind::Agentic => "agentic",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "script" => Some(TaskKind::Script),
            "module" => Some(TaskKind::Module),
            "agentic" => Some(TaskKind::Agentic),
            _ => None,
        }
    }
}

/// Retry behavior for failures inside a single run attempt. Governs
/// attempts within one run, never across runs.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_sec: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_sec: 0.0,
        }
    }
}

/// A registered, runnable unit of background work.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskProfile {
    pub task_id: String,
    pub name: String,
    pub kind: TaskKind,
    pub entrypoint: String,
    pub resources_path: Option<String>,
    pub queue_group: String,
    pub timeout_sec: u64,
    pub retry: RetryPolicy,
    pub enabled: bool,
}

impl TaskProfile {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.task_id.trim().is_empty() {
            return Err(OrchestratorError::UnknownTask("empty task_id".to_string()));
        }
        if self.timeout_sec == 0 {
            return Err(OrchestratorError::ScheduleValidation(format!(
                "task {} has timeout_sec 0",
                self.task_id
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(OrchestratorError::ScheduleValidation(format!(
                "task {} has max_attempts 0",
                self.task_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Frequency,
    Calendar,
}

impl ScheduleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleMode::Frequency => "frequency",
            ScheduleMode::Calendar => "calendar",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "frequency" => Some(ScheduleMode::Frequency),
            "calendar" => Some(ScheduleMode::Calendar),
            _ => None,
        }
    }
}

/// Only `queue_latest` has defined semantics: missed trigger instants
/// collapse into a single due trigger. Any other value is a validation
/// error, not a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    QueueLatest,
}

impl MisfirePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            MisfirePolicy::QueueLatest => "queue_latest",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "queue_latest" => Some(MisfirePolicy::QueueLatest),
            _ => None,
        }
    }
}

/// A trigger rule bound to a task profile. The schedule engine never
/// mutates these; derived "last triggered" bookkeeping lives in a
/// separate mark table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub task_id: String,
    pub enabled: bool,
    pub mode: ScheduleMode,
    pub execution_order: i64,
    pub misfire_policy: MisfirePolicy,
    pub run_frequency_minutes: Option<u32>,
    pub timezone: Option<String>,
    pub run_times: Vec<String>,
    pub days_of_week: Vec<String>,
}

impl Schedule {
    /// Normalize mode-specific fields in place: lowercase and dedup days,
    /// dedup run times. Call before `validate`.
    pub fn normalize(&mut self) {
        for day in &mut self.days_of_week {
            *day = day.trim().to_lowercase();
        }
        self.days_of_week.sort();
        self.days_of_week.dedup();
        for time in &mut self.run_times {
            *time = time.trim().to_string();
        }
        self.run_times.sort();
        self.run_times.dedup();
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let fail = |msg: String| Err(OrchestratorError::ScheduleValidation(msg));

        if self.schedule_id.trim().is_empty() {
            return fail("empty schedule_id".to_string());
        }
        match self.mode {
            ScheduleMode::Frequency => {
                match self.run_frequency_minutes {
                    Some(m) if m > 0 => {}
                    Some(_) => {
                        return fail(format!(
                            "schedule {}: run_frequency_minutes must be > 0",
                            self.schedule_id
                        ));
                    }
                    None => {
                        return fail(format!(
                            "schedule {}: frequency mode requires run_frequency_minutes",
                            self.schedule_id
                        ));
                    }
                }
                if !self.run_times.is_empty() || !self.days_of_week.is_empty() {
                    return fail(format!(
                        "schedule {}: frequency mode must not carry run_times or days_of_week",
                        self.schedule_id
                    ));
                }
            }
            ScheduleMode::Calendar => {
                let tz = match &self.timezone {
                    Some(tz) => tz,
                    None => {
                        return fail(format!(
                            "schedule {}: calendar mode requires a timezone",
                            self.schedule_id
                        ));
                    }
                };
                if tz.parse::<chrono_tz::Tz>().is_err() {
                    return fail(format!(
                        "schedule {}: unknown timezone {:?}",
                        self.schedule_id, tz
                    ));
                }
                if self.enabled && self.run_times.is_empty() {
                    return fail(format!(
                        "schedule {}: calendar mode requires at least one run time",
                        self.schedule_id
                    ));
                }
                if self.enabled && self.days_of_week.is_empty() {
                    return fail(format!(
                        "schedule {}: calendar mode requires at least one day of week",
                        self.schedule_id
                    ));
                }
                for time in &self.run_times {
                    if NaiveTime::parse_from_str(time, "%H:%M").is_err() {
                        return fail(format!(
                            "schedule {}: run time {:?} is not HH:MM",
                            self.schedule_id, time
                        ));
                    }
                }
                for day in &self.days_of_week {
                    if !WEEKDAY_NAMES.contains(&day.as_str()) {
                        return fail(format!(
                            "schedule {}: unknown day of week {:?}",
                            self.schedule_id, day
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingForInput,
    Done,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::WaitingForInput => "waiting_for_input",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Killed => "killed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "waiting_for_input" => Some(RunStatus::WaitingForInput),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            "killed" => Some(RunStatus::Killed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Killed)
    }
}

/// One execution instance of a task.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskRun {
    pub run_id: i64,
    pub task_id: String,
    pub status: RunStatus,
    pub requested_by: String,
    pub description: Option<String>,
    pub error: Option<String>,
    pub resume_token: Option<String>,
    pub user_response: Option<String>,
    pub killed_by: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
