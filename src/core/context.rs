//! The orchestrator context: one explicitly-constructed object owning
//! the store, provider queues, schedule engine, and run queue. Built
//! once at startup and passed by reference; tests get clean isolation by
//! constructing a fresh context over an in-memory store.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::core::error::{OrchestratorError, Result};
use crate::core::provider_queue::ProviderQueues;
use crate::core::runqueue::{JobExecutor, RunQueue, capacity};
use crate::core::scheduler::{ScheduleEngine, run_scheduler_loop};
use crate::core::store::{QueryOutput, Store, TaskStateEntry};
use crate::core::types::{
    MisfirePolicy, RunStatus, Schedule, ScheduleMode, TaskProfile, TaskRun,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub enabled_in_config: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeStatus {
    pub queued_count: i64,
    pub running_count: i64,
    pub active_workers: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Status {
    pub service: ServiceStatus,
    pub runtime: RuntimeStatus,
}

/// Caller-facing shape of a schedule upsert. `schedule_id` is derived
/// from the profile name and task when unspecified.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ScheduleSpec {
    pub schedule_id: Option<String>,
    pub task_id: String,
    pub enabled: bool,
    pub mode: ScheduleMode,
    #[serde(default)]
    pub execution_order: Option<i64>,
    #[serde(default)]
    pub misfire_policy: Option<String>,
    #[serde(default)]
    pub run_frequency_minutes: Option<u32>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub run_times: Vec<String>,
    #[serde(default)]
    pub days_of_week: Vec<String>,
}

struct LoopGuard {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct OrchestratorContext {
    config: OrchestratorConfig,
    store: Arc<Store>,
    providers: Arc<ProviderQueues>,
    run_queue: Arc<RunQueue>,
    engine: Arc<ScheduleEngine>,
    loops: Mutex<Option<LoopGuard>>,
}

fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

impl OrchestratorContext {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<Store>,
        executor: Arc<dyn JobExecutor>,
    ) -> Arc<Self> {
        let providers = Arc::new(ProviderQueues::new(config.provider_defaults));
        let run_queue = RunQueue::new(
            store.clone(),
            providers.clone(),
            executor,
            config.run_queue_config(),
        );
        let engine = Arc::new(ScheduleEngine::new(store.clone()));
        Arc::new(Self {
            config,
            store,
            providers,
            run_queue,
            engine,
            loops: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn providers(&self) -> &Arc<ProviderQueues> {
        &self.providers
    }

    pub fn run_queue(&self) -> &Arc<RunQueue> {
        &self.run_queue
    }

    pub fn schedule_engine(&self) -> &Arc<ScheduleEngine> {
        &self.engine
    }

    // --- Lifecycle ---

    /// Start the scheduler tick and dispatch loops. Idempotent; a second
    /// start while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            warn!("orchestrator disabled in config, not starting loops");
            return;
        }
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            debug!("orchestrator already running");
            return;
        }
        let shutdown = CancellationToken::new();
        let handles = vec![
            tokio::spawn(run_scheduler_loop(
                self.engine.clone(),
                self.run_queue.clone(),
                self.config.scheduler_tick(),
                shutdown.clone(),
            )),
            tokio::spawn(
                self.run_queue
                    .clone()
                    .run_dispatch_loop(shutdown.clone()),
            ),
        ];
        *loops = Some(LoopGuard { shutdown, handles });
        info!("orchestrator started");
    }

    /// Stop the loops. In-flight runs are left to finish on their own;
    /// kill and timeout remain the only cancellation paths for job
    /// bodies.
    pub async fn stop(&self) {
        let guard = self.loops.lock().await.take();
        if let Some(guard) = guard {
            guard.shutdown.cancel();
            for handle in guard.handles {
                let _ = handle.await;
            }
            info!("orchestrator stopped");
        }
    }

    pub async fn status(&self) -> Result<Status> {
        let running = self.loops.lock().await.is_some();
        let queued_count = self.store.count_runs_with_status(RunStatus::Queued).await?;
        let running_count = self.store.count_runs_with_status(RunStatus::Running).await?;
        let active_workers = self.run_queue.active_workers().await;
        let mut warnings = Vec::new();
        if let Some(w) = capacity::capacity_warning(
            queued_count,
            active_workers as i64,
            self.config.max_concurrent_workers,
            self.config.reserve_for_workers,
        ) {
            warnings.push(w);
        }
        Ok(Status {
            service: ServiceStatus {
                running,
                enabled_in_config: self.config.enabled,
            },
            runtime: RuntimeStatus {
                queued_count,
                running_count,
                active_workers,
                warnings,
            },
        })
    }

    // --- Task profiles ---

    pub async fn upsert_task_profile(&self, profile: &TaskProfile) -> Result<()> {
        profile.validate()?;
        self.store.upsert_profile(profile).await
    }

    pub async fn delete_task_profile(&self, task_id: &str) -> Result<bool> {
        self.store.delete_profile(task_id).await
    }

    pub async fn list_defined_tasks(&self) -> Result<Vec<TaskProfile>> {
        self.store.list_profiles().await
    }

    // --- Schedules ---

    pub async fn upsert_schedule(&self, spec: ScheduleSpec) -> Result<Schedule> {
        let profile = self
            .store
            .get_profile(&spec.task_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownTask(spec.task_id.clone()))?;
        let misfire_policy = match spec.misfire_policy.as_deref() {
            None => MisfirePolicy::QueueLatest,
            Some(raw) => MisfirePolicy::from_name(raw).ok_or_else(|| {
                OrchestratorError::ScheduleValidation(format!(
                    "unknown misfire policy {raw:?}; only queue_latest is defined"
                ))
            })?,
        };
        let schedule_id = spec
            .schedule_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}:{}", spec.task_id, slug(&profile.name)));
        let mut schedule = Schedule {
            schedule_id,
            task_id: spec.task_id,
            enabled: spec.enabled,
            mode: spec.mode,
            execution_order: spec.execution_order.unwrap_or(100),
            misfire_policy,
            run_frequency_minutes: spec.run_frequency_minutes,
            timezone: spec.timezone,
            run_times: spec.run_times,
            days_of_week: spec.days_of_week,
        };
        schedule.normalize();
        schedule.validate()?;
        self.store.upsert_schedule(&schedule).await?;
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        self.store.delete_schedule(schedule_id).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.store.list_schedules().await
    }

    // --- Runs ---

    pub async fn trigger_profile(
        &self,
        task_id: &str,
        description: Option<&str>,
        requested_by: &str,
    ) -> Result<TaskRun> {
        self.run_queue.enqueue(task_id, description, requested_by).await
    }

    pub async fn kill_run(&self, run_id: i64, requested_by: &str) -> Result<TaskRun> {
        self.run_queue.kill(run_id, requested_by).await
    }

    pub async fn resume_run(
        &self,
        run_id: i64,
        user_response: &str,
        requested_by: &str,
    ) -> Result<TaskRun> {
        self.run_queue.resume(run_id, user_response, requested_by).await
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<TaskRun>> {
        self.run_queue.list_runs(limit).await
    }

    pub async fn list_waiting_runs(&self, limit: usize) -> Result<Vec<TaskRun>> {
        self.run_queue.list_waiting(limit).await
    }

    // --- Task state and dedup ledger ---

    pub async fn upsert_task_state(
        &self,
        task_id: &str,
        state_key: &str,
        value: &serde_json::Value,
        updated_by: &str,
    ) -> Result<()> {
        self.store
            .upsert_task_state(task_id, state_key, value, updated_by)
            .await
    }

    pub async fn get_task_state(
        &self,
        task_id: &str,
        state_key: &str,
    ) -> Result<Option<TaskStateEntry>> {
        self.store.get_task_state(task_id, state_key).await
    }

    pub async fn mark_task_item_seen(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.store.mark_seen(task_id, provider, item_key, metadata).await
    }

    pub async fn has_task_item_seen(
        &self,
        task_id: &str,
        provider: &str,
        item_key: &str,
    ) -> Result<bool> {
        self.store.has_seen(task_id, provider, item_key).await
    }

    // --- Diagnostics ---

    pub async fn metrics(&self) -> Result<serde_json::Value> {
        let mut run_counts = serde_json::Map::new();
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::WaitingForInput,
            RunStatus::Done,
            RunStatus::Failed,
            RunStatus::Killed,
        ] {
            run_counts.insert(
                status.as_str().to_string(),
                serde_json::json!(self.store.count_runs_with_status(status).await?),
            );
        }
        Ok(serde_json::json!({
            "runs": run_counts,
            "active_workers": self.run_queue.active_workers().await,
            "provider_groups": self.providers.stats(),
        }))
    }

    pub async fn execute_sql(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        read_only: bool,
        timeout_sec: u64,
        max_rows: Option<usize>,
    ) -> Result<QueryOutput> {
        self.store
            .execute_sql(
                sql,
                params,
                read_only,
                timeout_sec,
                max_rows.unwrap_or(self.config.sql_max_rows),
            )
            .await
    }
}
