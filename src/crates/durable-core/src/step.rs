//! Step Executor - memoized units of work
//!
//! `step(name, op)` looks up `name` in history for the current namespace
//! before doing anything:
//!
//! ```text
//! step("charge", op)
//!   │
//!   ├── record found ──→ succeeded: return recorded value   (op NOT called)
//!   │                    failed:    return recorded error   (op NOT called)
//!   │
//!   └── no record ─────→ run op (with retries)
//!                        ├── Ok(v)       → append succeeded, then return v
//!                        ├── Err(e)      → append failed,    then return e
//!                        └── Suspended / fatal → return without recording
//! ```
//!
//! The record is appended and the append awaited *before* the value is handed
//! back, so a crash can never leave an operation that ran without a record
//! unless the crash happened inside the operation itself.
//!
//! # Example
//!
//! ```rust,ignore
//! let total: u64 = ctx.step("price", || async { Ok(compute_price()) }).await?;
//!
//! let receipt: Receipt = ctx
//!     .step_with_config(
//!         "charge",
//!         StepConfig::new().with_retry(RetryPolicy::new(3).with_error_kinds(["Throttled"])),
//!         || async { gateway.charge(total).await },
//!     )
//!     .await?;
//! ```

use crate::context::DurableContext;
use crate::error::{DurableError, Result};
use crate::retry::{RetryPolicy, RetryState};
use durable_checkpoint::{HistoryError, StepRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, error, warn};

/// Per-step options
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    /// Retry policy; falls back to the engine's `[retry]` section when absent
    pub retry: Option<RetryPolicy>,
}

impl StepConfig {
    /// Options with no overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

impl DurableContext {
    /// Run `op` at most once per execution under `name`.
    ///
    /// On replay the recorded value (or error) is returned without calling `op`.
    pub async fn step<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.step_with_config(name, StepConfig::default(), op).await
    }

    /// [`step`](Self::step) with explicit options
    pub async fn step_with_config<T, F, Fut>(
        &self,
        name: &str,
        config: StepConfig,
        mut op: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.claim(name)?;
        if let Some(recorded) = self.lookup::<T>(name).await? {
            return recorded;
        }

        let policy = config.retry.or_else(|| self.runtime.config.retry.to_policy());
        let outcome = self.run_with_retry(name, policy.as_ref(), &mut op).await;
        self.commit(name, outcome).await
    }

    /// Call `op` until it succeeds or the policy gives up
    async fn run_with_retry<T, F, Fut>(
        &self,
        name: &str,
        policy: Option<&RetryPolicy>,
        op: &mut F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::new();
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            state.record_failure(&err);

            let Some(policy) = policy else {
                return Err(err);
            };
            let retries_done = state.retries();
            if !policy.should_retry(&err, retries_done) {
                return Err(err);
            }

            let delay = policy.calculate_delay(retries_done + 1);
            warn!(
                execution_id = %self.execution_id(),
                namespace = %self.namespace(),
                step = name,
                retry = retries_done + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "step failed, retrying"
            );
            self.runtime.clock.sleep(delay).await;
        }
    }

    /// Run `op` unless `name` is already recorded; no claim, no retry
    pub(crate) async fn run_once<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(recorded) = self.lookup::<T>(name).await? {
            return recorded;
        }
        let outcome = op().await;
        self.commit(name, outcome).await
    }

    /// Recorded outcome of `name`, if any.
    ///
    /// The outer `Result` carries store failures; the inner one is the
    /// recorded outcome.
    pub(crate) async fn lookup<T: DeserializeOwned>(&self, name: &str) -> Result<Option<Result<T>>> {
        let key = self.key(name);
        let Some(record) = self.runtime.history.get(&key).await? else {
            return Ok(None);
        };

        debug!(
            execution_id = %self.execution_id(),
            namespace = %self.namespace(),
            step = name,
            sequence = record.sequence,
            "replaying recorded step"
        );
        Ok(Some(match record.outcome() {
            Ok(value) => serde_json::from_value(value).map_err(DurableError::from),
            Err(error) => Err(DurableError::from_error_object(error)),
        }))
    }

    /// Append the outcome of `name` and hand it back once the append is durable.
    ///
    /// Suspensions and fatal errors pass through unrecorded.
    pub(crate) async fn commit<T: Serialize>(&self, name: &str, outcome: Result<T>) -> Result<T> {
        let now = self.runtime.clock.now();
        let key = self.key(name);
        let record = match &outcome {
            Ok(value) => Some(StepRecord::succeeded(key, serde_json::to_value(value)?, now)),
            Err(err) if err.is_recordable() => {
                Some(StepRecord::failed(key, err.to_error_object(), now))
            }
            Err(_) => None,
        };
        let Some(record) = record else {
            return outcome;
        };

        match self.runtime.history.append(record).await {
            Ok(stored) => {
                debug!(
                    execution_id = %self.execution_id(),
                    namespace = %self.namespace(),
                    step = name,
                    sequence = stored.sequence,
                    status = ?stored.status,
                    "step committed"
                );
                outcome
            }
            Err(HistoryError::Conflict(_)) => Err(self.duplicate(name)),
            Err(err) => {
                error!(
                    execution_id = %self.execution_id(),
                    step = name,
                    error = %err,
                    "failed to commit step record"
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::context::testing::Harness;
    use durable_checkpoint::{HistoryStore, StepStatus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_step_runs_once_across_attempts() {
        let harness = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let ctx = harness.attempt();
            let calls = Arc::clone(&calls);
            let value: u32 = ctx
                .step("a", || {
                    let calls = Arc::clone(&calls);
                    async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 10) }
                })
                .await
                .unwrap();
            assert_eq!(value, 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_step_replays_error() {
        let harness = Harness::new().await;

        let first: Result<u32> = harness
            .attempt()
            .step("charge", || async { Err(DurableError::operation("Declined", "no funds")) })
            .await;
        assert_eq!(first.unwrap_err().kind(), "Declined");

        let replayed: Result<u32> = harness
            .attempt()
            .step("charge", || async { Ok(1) })
            .await;
        let err = replayed.unwrap_err();
        assert_eq!(err.kind(), "Declined");
        assert_eq!(err.to_string(), "Declined: no funds");

        let history = harness.history.history("exec-test").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_name_in_one_attempt() {
        let harness = Harness::new().await;
        let ctx = harness.attempt();
        let _: u32 = ctx.step("a", || async { Ok(1) }).await.unwrap();

        let err = ctx.step::<u32, _, _>("a", || async { Ok(2) }).await.unwrap_err();
        assert!(matches!(err, DurableError::DuplicateStepName { .. }));
    }

    #[tokio::test]
    async fn test_retry_records_single_outcome() {
        let harness = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let start = harness.clock.now();

        let policy = RetryPolicy::new(3).with_interval(2.0).with_backoff_rate(2.0);
        let value: u32 = harness
            .attempt()
            .step_with_config("flaky", StepConfig::new().with_retry(policy), || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(DurableError::operation("Throttled", "slow down"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s before the first retry, 4s before the second
        assert_eq!((harness.clock.now() - start).num_seconds(), 6);
        assert_eq!(harness.history.record_count().await, 1);
    }

    #[tokio::test]
    async fn test_retry_skips_unmatched_kinds() {
        let harness = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5).with_error_kinds(["Throttled"]);

        let result: Result<u32> = harness
            .attempt()
            .step_with_config("strict", StepConfig::new().with_retry(policy), || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DurableError::operation("Invalid", "bad input"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), "Invalid");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_engine_default_retry_applies() {
        let mut harness = Harness::new().await;
        harness.config.retry.max_attempts = 2;
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<u32> = harness
            .attempt()
            .step("always-fails", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DurableError::failed("boom"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_fatal_and_unrecorded() {
        let harness = Harness::new().await;
        harness.history.set_available(false);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<u32> = harness
            .attempt()
            .step("a", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await;

        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suspension_from_op_is_not_recorded() {
        let harness = Harness::new().await;
        let result: Result<u32> = harness
            .attempt()
            .step("a", || async { Err(DurableError::Suspended(Default::default())) })
            .await;

        assert!(result.unwrap_err().is_suspended());
        assert_eq!(harness.history.record_count().await, 0);
    }
}
