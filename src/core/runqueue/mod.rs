//! Run queue: owns the life cycle of task runs and is the sole writer of
//! run status. Runs move `queued -> running -> {done | failed |
//! waiting_for_input | killed}`; every transition is a compare-and-set in
//! the store, so a kill racing a run's own completion can never regress a
//! terminal state.

pub mod capacity;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::{OrchestratorError, Result};
use crate::core::provider_queue::ProviderQueues;
use crate::core::store::Store;
use crate::core::types::{RunStatus, TaskProfile, TaskRun};

const DISPATCH_BATCH: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct RunQueueConfig {
    pub max_concurrent_workers: i64,
    /// Slots held back for direct (non-scheduled) worker usage.
    pub reserve_for_workers: i64,
    pub dispatch_interval: Duration,
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            reserve_for_workers: 1,
            dispatch_interval: Duration::from_millis(250),
        }
    }
}

/// Everything a job body gets to work with. The cancellation token is
/// how kill and timeout interrupt the body; long-running bodies must
/// check it.
#[derive(Clone)]
pub struct JobContext {
    pub run_id: i64,
    pub profile: TaskProfile,
    pub description: Option<String>,
    pub resume_token: Option<String>,
    pub user_response: Option<String>,
    pub attempt: u32,
    pub store: Arc<Store>,
    pub providers: Arc<ProviderQueues>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done,
    /// Park the run until a human answers; the token is opaque to the
    /// orchestrator and handed back on resume.
    WaitingForInput { resume_token: String },
}

/// A failure inside one run attempt. `retryable` feeds the profile's
/// retry policy; fatal errors fail the run immediately.
#[derive(Debug, Clone)]
pub struct JobError {
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::fatal(format!("{err:#}"))
    }
}

/// Seam between the orchestrator and actual job bodies (script runners,
/// module calls, agentic work).
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> std::result::Result<JobOutcome, JobError>;
}

enum Finish {
    Done,
    Waiting(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

pub struct RunQueue {
    store: Arc<Store>,
    providers: Arc<ProviderQueues>,
    executor: Arc<dyn JobExecutor>,
    config: RunQueueConfig,
    active: Mutex<HashMap<i64, CancellationToken>>,
}

impl RunQueue {
    pub fn new(
        store: Arc<Store>,
        providers: Arc<ProviderQueues>,
        executor: Arc<dyn JobExecutor>,
        config: RunQueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            providers,
            executor,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RunQueueConfig {
        &self.config
    }

    /// Workers currently executing in this process.
    pub async fn active_workers(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Create a queued run for a registered, enabled profile. Execution
    /// is asynchronous; the returned run is always `queued`.
    pub async fn enqueue(
        &self,
        task_id: &str,
        description: Option<&str>,
        requested_by: &str,
    ) -> Result<TaskRun> {
        let profile = self
            .store
            .get_profile(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?;
        if !profile.enabled {
            return Err(OrchestratorError::UnknownTask(format!(
                "{task_id} (disabled)"
            )));
        }
        let run = self.store.insert_run(task_id, requested_by, description).await?;
        info!(run_id = run.run_id, task = task_id, requested_by, "run enqueued");
        Ok(run)
    }

    /// Kill a queued or running run. Safe to race against the run's own
    /// completion: whichever transition lands first wins and the loser is
    /// a no-op.
    pub async fn kill(&self, run_id: i64, requested_by: &str) -> Result<TaskRun> {
        let before = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        if !self.store.kill_run_record(run_id, requested_by).await? {
            return Err(OrchestratorError::InvalidState {
                run_id,
                status: before.status.as_str().to_string(),
                expected: "queued or running".to_string(),
            });
        }
        if let Some(cancel) = self.active.lock().await.get(&run_id) {
            cancel.cancel();
        }
        info!(run_id, requested_by, "run killed");
        self.store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Resume a run parked in `waiting_for_input`. The run goes straight
    /// back to `running`; its slot was conceptually held while waiting,
    /// so resume does not pass through the capacity gate.
    pub async fn resume(
        self: &Arc<Self>,
        run_id: i64,
        user_response: &str,
        requested_by: &str,
    ) -> Result<TaskRun> {
        let before = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        if !self.store.resume_run_record(run_id, user_response).await? {
            return Err(OrchestratorError::InvalidState {
                run_id,
                status: before.status.as_str().to_string(),
                expected: RunStatus::WaitingForInput.as_str().to_string(),
            });
        }
        let profile = match self.store.get_profile(&before.task_id).await? {
            Some(profile) => profile,
            None => {
                self.store
                    .complete_run(run_id, RunStatus::Failed, Some("task profile removed"))
                    .await?;
                return Err(OrchestratorError::UnknownTask(before.task_id));
            }
        };
        info!(run_id, requested_by, "run resumed");
        self.spawn_execution(
            run_id,
            profile,
            before.description.clone(),
            before.resume_token.clone(),
            Some(user_response.to_string()),
        )
        .await;
        self.store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<TaskRun>> {
        self.store.list_runs(limit).await
    }

    pub async fn list_waiting(&self, limit: usize) -> Result<Vec<TaskRun>> {
        self.store
            .list_runs_with_status(RunStatus::WaitingForInput, limit)
            .await
    }

    /// Dispatch loop: admit queued runs while the capacity policy allows.
    /// Runs that cannot be admitted simply stay queued; there is no busy
    /// failure.
    pub async fn run_dispatch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "dispatch loop started (max {} workers, {} reserved)",
            self.config.max_concurrent_workers, self.config.reserve_for_workers
        );
        let mut interval = tokio::time::interval(self.config.dispatch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.dispatch_once().await {
                warn!("dispatch pass failed: {e}");
            }
        }
        info!("dispatch loop stopped");
    }

    async fn dispatch_once(self: &Arc<Self>) -> Result<()> {
        let candidates = self.store.next_queued(DISPATCH_BATCH).await?;
        for run in candidates {
            // Re-evaluated on every attempt, never cached.
            let running = self.active.lock().await.len() as i64;
            if !capacity::can_dispatch(
                running,
                self.config.max_concurrent_workers,
                self.config.reserve_for_workers,
            ) {
                break;
            }
            let profile = match self.store.get_profile(&run.task_id).await? {
                Some(profile) if profile.enabled => profile,
                _ => {
                    // Profile vanished or was disabled after queueing.
                    if self.store.claim_queued_run(run.run_id).await? {
                        self.store
                            .complete_run(
                                run.run_id,
                                RunStatus::Failed,
                                Some("task profile removed or disabled"),
                            )
                            .await?;
                    }
                    continue;
                }
            };
            // A concurrent kill may have taken the run; losing the claim
            // just means there is nothing to dispatch.
            if !self.store.claim_queued_run(run.run_id).await? {
                continue;
            }
            debug!(run_id = run.run_id, task = %run.task_id, "run dispatched");
            self.spawn_execution(run.run_id, profile, run.description.clone(), None, None)
                .await;
        }
        Ok(())
    }

    async fn spawn_execution(
        self: &Arc<Self>,
        run_id: i64,
        profile: TaskProfile,
        description: Option<String>,
        resume_token: Option<String>,
        user_response: Option<String>,
    ) {
        let cancel = CancellationToken::new();
        self.active.lock().await.insert(run_id, cancel.clone());
        let queue = self.clone();
        tokio::spawn(async move {
            queue
                .execute_run(run_id, profile, description, resume_token, user_response, cancel)
                .await;
        });
    }

    async fn execute_run(
        self: Arc<Self>,
        run_id: i64,
        profile: TaskProfile,
        description: Option<String>,
        resume_token: Option<String>,
        user_response: Option<String>,
        cancel: CancellationToken,
    ) {
        let timeout = Duration::from_secs(profile.timeout_sec.max(1));
        let max_attempts = profile.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        let finish = loop {
            let ctx = JobContext {
                run_id,
                profile: profile.clone(),
                description: description.clone(),
                resume_token: resume_token.clone(),
                user_response: user_response.clone(),
                attempt,
                store: self.store.clone(),
                providers: self.providers.clone(),
                cancel: cancel.clone(),
            };
            let attempt_result = tokio::select! {
                _ = cancel.cancelled() => break Finish::Cancelled,
                res = tokio::time::timeout(timeout, self.executor.execute(ctx)) => res,
            };
            match attempt_result {
                Err(_) => break Finish::TimedOut,
                Ok(Ok(JobOutcome::Done)) => break Finish::Done,
                Ok(Ok(JobOutcome::WaitingForInput { resume_token })) => {
                    break Finish::Waiting(resume_token);
                }
                Ok(Err(job_err)) => {
                    attempt += 1;
                    if job_err.retryable && attempt < max_attempts {
                        warn!(
                            run_id,
                            task = %profile.task_id,
                            attempt,
                            "attempt failed, retrying: {}",
                            job_err.message
                        );
                        let backoff = Duration::from_secs_f64(profile.retry.backoff_sec.max(0.0));
                        tokio::select! {
                            _ = cancel.cancelled() => break Finish::Cancelled,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    } else {
                        break Finish::Failed(job_err.message);
                    }
                }
            }
        };

        // Job failures land in the run record, never on the scheduler.
        let parked = matches!(finish, Finish::Waiting(_));
        let transition = match finish {
            Finish::Done => {
                info!(run_id, task = %profile.task_id, "run done");
                self.store.complete_run(run_id, RunStatus::Done, None).await
            }
            Finish::Waiting(token) => {
                info!(run_id, task = %profile.task_id, "run waiting for input");
                // Deregister before the row says waiting_for_input: the
                // instant it does, a resume may register a fresh token
                // under this run_id, and this task must not sweep it.
                self.active.lock().await.remove(&run_id);
                self.store.park_run(run_id, &token).await
            }
            Finish::Failed(message) => {
                warn!(run_id, task = %profile.task_id, "run failed: {message}");
                self.store
                    .complete_run(run_id, RunStatus::Failed, Some(&message))
                    .await
            }
            Finish::TimedOut => {
                // Stop any sub-work the body spawned, then record the
                // timeout.
                cancel.cancel();
                warn!(run_id, task = %profile.task_id, "run timed out");
                self.store
                    .complete_run(
                        run_id,
                        RunStatus::Failed,
                        Some(&format!("timed out after {}s", profile.timeout_sec)),
                    )
                    .await
            }
            // The kill path already wrote the terminal state.
            Finish::Cancelled => Ok(false),
        };
        if let Err(e) = transition {
            error!(run_id, "could not record run transition: {e}");
        }
        if !parked {
            self.active.lock().await.remove(&run_id);
        }
    }
}
