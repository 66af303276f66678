//! Workflow functions
//!
//! A workflow is ordinary async code that receives a [`DurableContext`] and
//! the execution input. Everything with side effects goes through the
//! context; everything else must be deterministic, because the driver replays
//! the function from the top on every resume.

use crate::context::DurableContext;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;

/// A durable workflow function
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Run (or replay) the workflow
    async fn run(&self, ctx: DurableContext, input: Value) -> Result<Value>;

    /// Name used in logs
    fn name(&self) -> &str {
        "workflow"
    }
}

/// [`Workflow`] backed by a closure, see [`workflow_fn`]
pub struct FnWorkflow<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for FnWorkflow<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWorkflow").field("name", &self.name).finish()
    }
}

/// Wrap an async closure as a named [`Workflow`]
///
/// ```rust,ignore
/// let workflow = workflow_fn("greet", |ctx, input| async move {
///     let name: String = ctx.step("name", || async { Ok("world".to_string()) }).await?;
///     Ok(json!({ "greeting": format!("hello {}", name), "input": input }))
/// });
/// ```
pub fn workflow_fn<F, Fut>(name: impl Into<String>, f: F) -> FnWorkflow<F>
where
    F: Fn(DurableContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnWorkflow {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> Workflow for FnWorkflow<F>
where
    F: Fn(DurableContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn run(&self, ctx: DurableContext, input: Value) -> Result<Value> {
        (self.f)(ctx, input).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
