//! Per-group serialization and pacing of outbound provider calls.
//!
//! Each named group (one per rate-limited external integration) admits a
//! single in-flight call at a time. The group's call lock is the sole
//! concurrency boundary: pacing sleeps happen while holding it, so
//! concurrent callers queue behind it. Counters live under a separate,
//! short-held lock so status reads never block on an in-flight call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Minimum spacing between the end of one call and the start of the
    /// next in the same group.
    pub min_interval_sec: f64,
    /// Extra random delay in `[0, jitter_sec]` applied after interval
    /// pacing to avoid thundering-herd alignment across groups.
    pub jitter_sec: f64,
    /// Retries beyond the first attempt, applied only to failures the
    /// caller's predicate classifies as retryable.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `retry_backoff_sec * 2^n`.
    pub retry_backoff_sec: f64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            min_interval_sec: 0.0,
            jitter_sec: 0.0,
            max_retries: 0,
            retry_backoff_sec: 1.0,
        }
    }
}

#[derive(Debug, Default)]
struct GroupCounters {
    calls_total: u64,
    calls_success: u64,
    calls_failed: u64,
    last_error: Option<String>,
    last_wait_sec: f64,
    max_wait_sec: f64,
    wait_sum_sec: f64,
}

/// Point-in-time view of a group's counters, safe to read while a call
/// is in flight.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupStats {
    pub group: String,
    pub calls_total: u64,
    pub calls_success: u64,
    pub calls_failed: u64,
    pub last_error: Option<String>,
    pub last_wait_sec: f64,
    pub max_wait_sec: f64,
    pub avg_wait_sec: f64,
}

#[derive(Debug, Default)]
struct Pacing {
    last_finished: Option<Instant>,
}

/// Where a finished call spent its time before the body began executing,
/// separate from the call's own latency.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueInfo {
    pub group: String,
    pub wait_sec: f64,
    pub attempt: u32,
}

/// Structured call result. Failures are carried as a value, never thrown
/// past the queue boundary, so callers can apply their own fallback.
#[derive(Debug)]
pub struct CallResult<T> {
    pub outcome: Result<T, String>,
    pub queue: QueueInfo,
}

impl<T> CallResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct ProviderGroup {
    name: String,
    config: GroupConfig,
    // Held for the whole call: serialization boundary for the group.
    pacing: Mutex<Pacing>,
    // Short-held; status reads never wait on an in-flight call.
    counters: std::sync::Mutex<GroupCounters>,
}

impl ProviderGroup {
    fn new(name: String, config: GroupConfig) -> Self {
        Self {
            name,
            config,
            pacing: Mutex::new(Pacing::default()),
            counters: std::sync::Mutex::new(GroupCounters::default()),
        }
    }

    /// Run `body` under the group's serialization, pacing, and retry
    /// rules. `retryable` classifies which failures are worth retrying.
    pub async fn call<T, F, Fut, R>(&self, body: F, retryable: R) -> CallResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        R: Fn(&anyhow::Error) -> bool,
    {
        let queued_at = Instant::now();
        let mut pacing = self.pacing.lock().await;

        // Pace from the previous call's finish time, not its start.
        if let Some(last_finished) = pacing.last_finished {
            let min_interval = Duration::from_secs_f64(self.config.min_interval_sec.max(0.0));
            let since = last_finished.elapsed();
            if since < min_interval {
                tokio::time::sleep(min_interval - since).await;
            }
        }
        if self.config.jitter_sec > 0.0 {
            let jitter: f64 = rand::thread_rng().gen_range(0.0..=self.config.jitter_sec);
            tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
        }

        let wait_sec = queued_at.elapsed().as_secs_f64();
        let mut attempt = 0u32;
        let outcome = loop {
            match body().await {
                Ok(value) => break Ok(value),
                Err(err) => {
                    if attempt >= self.config.max_retries || !retryable(&err) {
                        break Err(err.to_string());
                    }
                    let backoff = self.config.retry_backoff_sec * 2f64.powi(attempt as i32);
                    debug!(
                        group = %self.name,
                        attempt,
                        backoff_sec = backoff,
                        "provider call failed, retrying: {err:#}"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(backoff.max(0.0))).await;
                    attempt += 1;
                }
            }
        };
        pacing.last_finished = Some(Instant::now());
        drop(pacing);

        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.calls_total += 1;
            match &outcome {
                Ok(_) => counters.calls_success += 1,
                Err(error) => {
                    counters.calls_failed += 1;
                    counters.last_error = Some(error.clone());
                    warn!(group = %self.name, attempt, "provider call exhausted: {error}");
                }
            }
            counters.last_wait_sec = wait_sec;
            counters.max_wait_sec = counters.max_wait_sec.max(wait_sec);
            counters.wait_sum_sec += wait_sec;
        }

        CallResult {
            outcome,
            queue: QueueInfo {
                group: self.name.clone(),
                wait_sec,
                attempt,
            },
        }
    }

    pub fn stats(&self) -> GroupStats {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let avg_wait_sec = if counters.calls_total == 0 {
            0.0
        } else {
            counters.wait_sum_sec / counters.calls_total as f64
        };
        GroupStats {
            group: self.name.clone(),
            calls_total: counters.calls_total,
            calls_success: counters.calls_success,
            calls_failed: counters.calls_failed,
            last_error: counters.last_error.clone(),
            last_wait_sec: counters.last_wait_sec,
            max_wait_sec: counters.max_wait_sec,
            avg_wait_sec,
        }
    }
}

/// Registry of provider groups. Calls in different groups never block
/// each other.
pub struct ProviderQueues {
    default_config: GroupConfig,
    groups: std::sync::Mutex<HashMap<String, Arc<ProviderGroup>>>,
}

impl ProviderQueues {
    pub fn new(default_config: GroupConfig) -> Self {
        Self {
            default_config,
            groups: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a group with explicit pacing/retry settings. Replaces any
    /// previous configuration for the name; counters start fresh.
    pub fn configure(&self, name: &str, config: GroupConfig) -> Arc<ProviderGroup> {
        let group = Arc::new(ProviderGroup::new(name.to_string(), config));
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.insert(name.to_string(), group.clone());
        group
    }

    /// Fetch a group, creating it with the default config on first use.
    pub fn group(&self, name: &str) -> Arc<ProviderGroup> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderGroup::new(name.to_string(), self.default_config))
            })
            .clone()
    }

    pub fn stats(&self) -> Vec<GroupStats> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats: Vec<GroupStats> = groups.values().map(|g| g.stats()).collect();
        stats.sort_by(|a, b| a.group.cmp(&b.group));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn never_retry(_: &anyhow::Error) -> bool {
        false
    }

    #[tokio::test]
    async fn calls_in_same_group_are_serialized() {
        let queues = ProviderQueues::new(GroupConfig::default());
        let group = queues.group("listings");
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let group = group.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                group
                    .call(
                        || {
                            let in_flight = in_flight.clone();
                            let peak = peak.clone();
                            async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok::<_, anyhow::Error>(())
                            }
                        },
                        never_retry,
                    )
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        let stats = group.stats();
        assert_eq!(stats.calls_total, 4);
        assert_eq!(stats.calls_success + stats.calls_failed, stats.calls_total);
    }

    #[tokio::test]
    async fn different_groups_do_not_block_each_other() {
        let queues = ProviderQueues::new(GroupConfig {
            min_interval_sec: 5.0,
            ..GroupConfig::default()
        });
        // First call in each group pays no pacing delay, so two groups
        // complete quickly even with a large interval configured.
        let started = Instant::now();
        let a = queues.group("a");
        let b = queues.group("b");
        let (ra, rb) = tokio::join!(
            a.call(|| async { Ok::<_, anyhow::Error>(1) }, never_retry),
            b.call(|| async { Ok::<_, anyhow::Error>(2) }, never_retry),
        );
        assert!(ra.is_ok() && rb.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retries_until_success_and_reports_attempt() {
        let queues = ProviderQueues::new(GroupConfig {
            max_retries: 5,
            retry_backoff_sec: 0.0,
            ..GroupConfig::default()
        });
        let group = queues.group("flaky");
        let failures = Arc::new(AtomicU32::new(2));
        let result = group
            .call(
                || {
                    let failures = failures.clone();
                    async move {
                        if failures.load(Ordering::SeqCst) > 0 {
                            failures.fetch_sub(1, Ordering::SeqCst);
                            anyhow::bail!("transient upstream hiccup");
                        }
                        Ok(42)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.outcome.as_ref().copied().ok(), Some(42));
        assert_eq!(result.queue.attempt, 2);
        assert_eq!(group.stats().calls_success, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_returned_not_retried() {
        let queues = ProviderQueues::new(GroupConfig {
            max_retries: 5,
            retry_backoff_sec: 0.0,
            ..GroupConfig::default()
        });
        let group = queues.group("auth");
        let calls = Arc::new(AtomicU32::new(0));
        let result: CallResult<()> = group
            .call(
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("invalid credentials")
                    }
                },
                never_retry,
            )
            .await;
        assert!(!result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = group.stats();
        assert_eq!(stats.calls_failed, 1);
        assert!(stats.last_error.as_deref().unwrap().contains("credentials"));
    }

    #[tokio::test]
    async fn exhausted_retries_count_one_failed_call() {
        let queues = ProviderQueues::new(GroupConfig {
            max_retries: 2,
            retry_backoff_sec: 0.0,
            ..GroupConfig::default()
        });
        let group = queues.group("flaky");
        let result: CallResult<()> = group
            .call(
                || async { anyhow::bail!("still broken") },
                |_| true,
            )
            .await;
        assert!(!result.is_ok());
        assert_eq!(result.queue.attempt, 2);
        let stats = group.stats();
        assert_eq!(stats.calls_total, 1);
        assert_eq!(stats.calls_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_spaces_calls_from_previous_finish() {
        let queues = ProviderQueues::new(GroupConfig {
            min_interval_sec: 10.0,
            ..GroupConfig::default()
        });
        let group = queues.group("paced");
        let first = group
            .call(|| async { Ok::<_, anyhow::Error>(()) }, never_retry)
            .await;
        assert!(first.queue.wait_sec < 1.0);
        let second = group
            .call(|| async { Ok::<_, anyhow::Error>(()) }, never_retry)
            .await;
        // Second call had to sit out the configured interval.
        assert!(second.queue.wait_sec >= 9.0, "wait {}", second.queue.wait_sec);
    }
}
