//! valet: the background orchestration core of a personal automation
//! assistant.
//!
//! The crate schedules and executes named background jobs, serializes
//! and paces calls to rate-limited external providers, budgets worker
//! capacity between scheduled jobs and ad-hoc work, tracks per-job
//! cursor/dedup state across runs, and gates high-risk actions behind an
//! explicit human-approval protocol.
//!
//! It runs as a single local authority per installation and guarantees
//! at-least-once execution with a dedup ledger, not exactly-once across
//! process crashes. The conversational front-end, HTTP transport, and
//! process bootstrap live in the surrounding application; they drive
//! this crate through [`OrchestratorContext`].

pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::OrchestratorConfig;
pub use crate::core::approval::{ApprovalRequest, GatedAction, RiskLevel};
pub use crate::core::context::{OrchestratorContext, ScheduleSpec, Status};
pub use crate::core::error::{OrchestratorError, Result};
pub use crate::core::provider_queue::{CallResult, GroupConfig, GroupStats, ProviderQueues};
pub use crate::core::runqueue::{
    JobContext, JobError, JobExecutor, JobOutcome, RunQueue, RunQueueConfig,
};
pub use crate::core::scheduler::{DueTrigger, ScheduleEngine};
pub use crate::core::store::{QueryOutput, Store, TaskStateEntry};
pub use crate::core::types::{
    MisfirePolicy, RetryPolicy, RunStatus, Schedule, ScheduleMode, TaskKind, TaskProfile, TaskRun,
};
