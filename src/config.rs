use std::time::Duration;

use crate::core::provider_queue::GroupConfig;
use crate::core::runqueue::RunQueueConfig;

/// Orchestrator settings, deserializable from the installation's config
/// file. Every field has a default so a missing section means "on, with
/// stock limits".
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub enabled: bool,
    pub max_concurrent_workers: i64,
    pub reserve_for_workers: i64,
    pub scheduler_tick_secs: u64,
    pub dispatch_interval_ms: u64,
    /// Default row cap for the SQL surface when the caller does not set
    /// one.
    pub sql_max_rows: usize,
    /// Pacing/retry defaults for provider groups not configured
    /// explicitly.
    pub provider_defaults: GroupConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_workers: 4,
            reserve_for_workers: 1,
            scheduler_tick_secs: 20,
            dispatch_interval_ms: 250,
            sql_max_rows: 500,
            provider_defaults: GroupConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn run_queue_config(&self) -> RunQueueConfig {
        RunQueueConfig {
            max_concurrent_workers: self.max_concurrent_workers,
            reserve_for_workers: self.reserve_for_workers,
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms),
        }
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"max_concurrent_workers": 2}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_concurrent_workers, 2);
        assert_eq!(config.reserve_for_workers, 1);
        assert_eq!(config.sql_max_rows, 500);
    }
}
