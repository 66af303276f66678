//! Invoke Bridge - calling other units of work as one checkpointed step
//!
//! `ctx.invoke(label, target, payload)` is a [`step`](crate::DurableContext::step)
//! whose operation calls an [`Invoker`]. There is no extra replay logic: once
//! the call's result is recorded under `label` it is returned on every replay.
//!
//! [`LocalInvoker`] dispatches to async closures registered by name, which is
//! enough for tests and single-process deployments. Remote targets implement
//! [`Invoker`] themselves.

use crate::context::DurableContext;
use crate::error::{kinds, DurableError, Result};
use crate::step::StepConfig;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Address of an invocable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRef {
    /// Function name
    pub name: String,
    /// Optional version or alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
}

impl FunctionRef {
    /// Reference a function by name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            qualifier: None,
        }
    }

    /// Pin a version or alias
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{}:{}", self.name, qualifier),
            None => write!(f, "{}", self.name),
        }
    }
}

impl From<&str> for FunctionRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Calls external units of work
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invoke `target` with `payload` and return its result
    async fn invoke(&self, target: &FunctionRef, payload: Value) -> Result<Value>;
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// In-process [`Invoker`] backed by registered async closures.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct LocalInvoker {
    handlers: Arc<parking_lot::RwLock<HashMap<String, Handler>>>,
}

impl LocalInvoker {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name` (builder style)
    pub fn with_function<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    /// Register `handler` under `name`
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.write().insert(name.into(), handler);
    }

    /// Registered function names
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for LocalInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalInvoker")
            .field("functions", &self.function_names())
            .finish()
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, target: &FunctionRef, payload: Value) -> Result<Value> {
        let handler = self.handlers.read().get(&target.name).cloned();
        match handler {
            Some(handler) => handler(payload).await,
            None => Err(DurableError::operation(
                kinds::FUNCTION_NOT_FOUND,
                format!("no function registered as '{}'", target),
            )),
        }
    }
}

impl DurableContext {
    /// Call `target` with `payload` as a checkpointed step named `label`
    pub async fn invoke<P, R>(&self, label: &str, target: impl Into<FunctionRef>, payload: P) -> Result<R>
    where
        P: Serialize,
        R: Serialize + DeserializeOwned,
    {
        self.invoke_with_config(label, target, payload, StepConfig::default())
            .await
    }

    /// [`invoke`](Self::invoke) with explicit step options (e.g. retries)
    pub async fn invoke_with_config<P, R>(
        &self,
        label: &str,
        target: impl Into<FunctionRef>,
        payload: P,
        config: StepConfig,
    ) -> Result<R>
    where
        P: Serialize,
        R: Serialize + DeserializeOwned,
    {
        let target = target.into();
        let payload = serde_json::to_value(payload)?;
        let invoker = Arc::clone(&self.runtime.invoker);

        let value: Value = self
            .step_with_config(label, config, || {
                let invoker = Arc::clone(&invoker);
                let target = target.clone();
                let payload = payload.clone();
                async move {
                    debug!(function = %target, "invoking function");
                    invoker.invoke(&target, payload).await
                }
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_invoke_is_memoized() {
        let harness = Harness::new().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        harness.invoker.register("double", move |payload| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(payload["n"].as_i64().unwrap_or(0) * 2))
            }
        });

        for _ in 0..3 {
            let result: i64 = harness
                .attempt()
                .invoke("double-it", "double", json!({"n": 21}))
                .await
                .unwrap();
            assert_eq!(result, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_is_recorded_failure() {
        let harness = Harness::new().await;
        let err = harness
            .attempt()
            .invoke::<_, Value>("call", FunctionRef::new("missing").with_qualifier("v2"), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kinds::FUNCTION_NOT_FOUND);
        assert!(err.to_string().contains("missing:v2"));
    }

    #[test]
    fn test_function_names_sorted() {
        let invoker = LocalInvoker::new()
            .with_function("b", |v| async move { Ok(v) })
            .with_function("a", |v| async move { Ok(v) });
        assert_eq!(invoker.function_names(), vec!["a".to_string(), "b".to_string()]);
    }
}
