//! Fan-Out Combinator - concurrent branches with a barrier join
//!
//! `map` and `parallel` run every branch as a checkpointed child run named
//! `<label>-<i>` inside a container namespace `<label>`:
//!
//! ```text
//! map("images", [a, b, c], f)
//!
//!   ns ""        step "images" ─────────────── aggregated Vec<R> / FanOutError
//!   ns "images"  ├── "images-0"  f(ctx, a, 0)
//!                ├── "images-1"  f(ctx, b, 1)   ← at most `max_concurrency`
//!                └── "images-2"  f(ctx, c, 2)     running at a time
//! ```
//!
//! Branches are tokio tasks gated by a semaphore. The join waits for every
//! branch to reach a terminal state or its own checkpoint, then decides:
//!
//! 1. any fatal error → propagate it (nothing is recorded)
//! 2. any suspension → suspend with the merged wake time and callback ids
//! 3. otherwise → results in input order, or [`DurableError::FanOut`] listing
//!    every failed branch
//!
//! A failed branch never cancels its siblings, and a branch that already
//! committed is replayed from history instead of being run again.

use crate::context::DurableContext;
use crate::error::{kinds, BranchFailure, DurableError, Result, Suspension};
use durable_checkpoint::ErrorObject;
use futures::future::{join_all, BoxFuture};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// One unit of work for [`DurableContext::parallel`]
pub type Branch<R> = Box<dyn FnOnce(DurableContext) -> BoxFuture<'static, Result<R>> + Send>;

/// Box an async closure as a [`Branch`]
pub fn branch<R, F, Fut>(f: F) -> Branch<R>
where
    F: FnOnce(DurableContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

/// Options for a single map/parallel call
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    /// Branches allowed to run at once; falls back to `execution.max_concurrency`
    pub max_concurrency: Option<usize>,
}

impl MapConfig {
    /// Options with no overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit how many branches run at once
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }
}

/// Terminal state of one branch, as returned by [`DurableContext::map_settled`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BranchOutcome<R> {
    /// Branch returned a value
    Succeeded {
        /// Branch value
        result: R,
    },
    /// Branch failed with a recordable error
    Failed {
        /// Recorded error
        error: ErrorObject,
    },
}

impl<R> BranchOutcome<R> {
    /// Whether the branch succeeded
    pub fn is_succeeded(&self) -> bool {
        matches!(self, BranchOutcome::Succeeded { .. })
    }

    /// Convert into a plain `Result`
    pub fn into_result(self) -> std::result::Result<R, ErrorObject> {
        match self {
            BranchOutcome::Succeeded { result } => Ok(result),
            BranchOutcome::Failed { error } => Err(error),
        }
    }
}

impl DurableContext {
    /// Run `f` for every item concurrently and collect the results in input order
    pub async fn map<I, R, F, Fut>(&self, label: &str, items: Vec<I>, f: F) -> Result<Vec<R>>
    where
        I: Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(DurableContext, I, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.map_with_config(label, items, MapConfig::default(), f)
            .await
    }

    /// [`map`](Self::map) with explicit options
    pub async fn map_with_config<I, R, F, Fut>(
        &self,
        label: &str,
        items: Vec<I>,
        config: MapConfig,
        f: F,
    ) -> Result<Vec<R>>
    where
        I: Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(DurableContext, I, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.parallel_with_config(label, item_branches(items, f), config)
            .await
    }

    /// Like [`map`](Self::map) but returns every branch outcome instead of failing
    pub async fn map_settled<I, R, F, Fut>(
        &self,
        label: &str,
        items: Vec<I>,
        config: MapConfig,
        f: F,
    ) -> Result<Vec<BranchOutcome<R>>>
    where
        I: Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(DurableContext, I, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let branches = item_branches(items, f);
        let limit = self.concurrency_limit(&config);
        let owned = label.to_string();
        self.run_in_child_context(label, move |container| async move {
            container.fan_out(&owned, branches, limit).await
        })
        .await
    }

    /// Run heterogeneous branches concurrently and collect results in order
    pub async fn parallel<R>(&self, label: &str, branches: Vec<Branch<R>>) -> Result<Vec<R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        self.parallel_with_config(label, branches, MapConfig::default())
            .await
    }

    /// [`parallel`](Self::parallel) with explicit options
    pub async fn parallel_with_config<R>(
        &self,
        label: &str,
        branches: Vec<Branch<R>>,
        config: MapConfig,
    ) -> Result<Vec<R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let limit = self.concurrency_limit(&config);
        let owned = label.to_string();
        self.run_in_child_context(label, move |container| async move {
            let outcomes = container.fan_out(&owned, branches, limit).await?;
            collect_or_fail(&owned, outcomes)
        })
        .await
    }

    fn concurrency_limit(&self, config: &MapConfig) -> usize {
        config
            .max_concurrency
            .unwrap_or(self.runtime.config.execution.max_concurrency)
            .max(1)
    }

    /// Spawn every branch under the semaphore and wait for all of them
    async fn fan_out<R>(
        &self,
        label: &str,
        branches: Vec<Branch<R>>,
        limit: usize,
    ) -> Result<Vec<BranchOutcome<R>>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        debug!(
            execution_id = %self.execution_id(),
            namespace = %self.namespace(),
            label,
            branches = branches.len(),
            limit,
            "fanning out"
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let handles: Vec<_> = branches
            .into_iter()
            .enumerate()
            .map(|(index, task)| {
                let ctx = self.clone();
                let semaphore = Arc::clone(&semaphore);
                let name = format!("{}-{}", label, index);
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| DurableError::Fatal("fan-out semaphore closed".to_string()))?;
                    ctx.run_in_child_context(&name, task).await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut suspension: Option<Suspension> = None;
        let mut fatal: Option<DurableError> = None;

        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            let result = joined.unwrap_or_else(|join_error| {
                warn!(label, index, error = %join_error, "fan-out branch panicked");
                Err(DurableError::operation(
                    kinds::PANIC,
                    format!("branch {} of '{}' panicked: {}", index, label, join_error),
                ))
            });
            match result {
                Ok(value) => outcomes.push(BranchOutcome::Succeeded { result: value }),
                Err(DurableError::Suspended(next)) => {
                    suspension = Some(match suspension {
                        Some(current) => current.merge(next),
                        None => next,
                    });
                }
                Err(err) if err.is_fatal() => {
                    fatal.get_or_insert(err);
                }
                Err(err) => outcomes.push(BranchOutcome::Failed {
                    error: err.to_error_object(),
                }),
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        if let Some(suspension) = suspension {
            debug!(
                label,
                wake_at = ?suspension.wake_at,
                callbacks = ?suspension.callbacks,
                "fan-out suspended"
            );
            return Err(DurableError::Suspended(suspension));
        }
        Ok(outcomes)
    }
}

fn item_branches<I, R, F, Fut>(items: Vec<I>, f: F) -> Vec<Branch<R>>
where
    I: Send + 'static,
    F: Fn(DurableContext, I, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let f = Arc::clone(&f);
            branch(move |ctx| f(ctx, item, index))
        })
        .collect()
}

fn collect_or_fail<R>(label: &str, outcomes: Vec<BranchOutcome<R>>) -> Result<Vec<R>> {
    let mut results = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            BranchOutcome::Succeeded { result } => results.push(result),
            BranchOutcome::Failed { error } => failures.push(BranchFailure { index, error }),
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        Err(DurableError::FanOut {
            label: label.to_string(),
            failures,
        })
    }
}
