use thiserror::Error;

/// Error taxonomy for the orchestration core.
///
/// Validation errors surface synchronously to the caller of the mutating
/// operation. Job-body failures never reach this enum: they are captured
/// into the run's terminal `failed` status as an error string.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("schedule validation failed: {0}")]
    ScheduleValidation(String),

    #[error("run not found: {0}")]
    RunNotFound(i64),

    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidState {
        run_id: i64,
        status: String,
        expected: String,
    },

    #[error("provider call failed after {attempts} attempt(s): {message}")]
    ProviderCall { attempts: u32, message: String },

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
