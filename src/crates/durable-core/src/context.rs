//! The handle workflow code uses to reach durable primitives
//!
//! A [`DurableContext`] is created by the [`ExecutionDriver`](crate::ExecutionDriver)
//! for every attempt of a workflow and passed to the workflow function. Child
//! contexts and fan-out branches receive their own context scoped to a nested
//! [`Namespace`].
//!
//! # Scope
//!
//! ```text
//! DurableContext
//! ├── runtime (shared by every context of one attempt)
//! │   ├── execution_id
//! │   ├── history store / callback store
//! │   ├── clock / invoker / callback submitter
//! │   └── engine config
//! └── scope (one per namespace)
//!     ├── namespace        "" | "images" | "images/images-0"
//!     ├── claimed names    duplicate detection within this attempt
//!     └── wait counter     names for unnamed timed waits
//! ```
//!
//! The primitives themselves live in [`step`](crate::step), [`wait`](crate::wait),
//! [`fanout`](crate::fanout), [`child`](crate::child) and [`invoke`](crate::invoke).

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{DurableError, Result};
use crate::invoke::Invoker;
use crate::submitter::CallbackSubmitter;
use durable_checkpoint::{CallbackStore, HistoryStore, Namespace, RecordKey};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Collaborators shared by every context of one attempt
pub(crate) struct Runtime {
    pub(crate) execution_id: String,
    pub(crate) history: Arc<dyn HistoryStore>,
    pub(crate) callbacks: Arc<dyn CallbackStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) invoker: Arc<dyn Invoker>,
    pub(crate) submitter: Arc<dyn CallbackSubmitter>,
    pub(crate) config: EngineConfig,
}

/// Per-namespace bookkeeping for one attempt
struct Scope {
    namespace: Namespace,
    claimed: Mutex<HashSet<String>>,
    wait_counter: AtomicU64,
}

impl Scope {
    fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            claimed: Mutex::new(HashSet::new()),
            wait_counter: AtomicU64::new(0),
        }
    }
}

/// Durable primitive surface for workflow code.
///
/// Cheap to clone; clones share the same namespace scope.
///
/// Step names must be unique within a namespace. Reusing a name inside one
/// attempt fails with [`DurableError::DuplicateStepName`]. Workflow code must
/// call primitives in the same order on every replay and must not branch on
/// anything that is not itself the result of a primitive.
#[derive(Clone)]
pub struct DurableContext {
    pub(crate) runtime: Arc<Runtime>,
    scope: Arc<Scope>,
}

impl DurableContext {
    /// Root context of an attempt
    pub(crate) fn root(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            scope: Arc::new(Scope::new(Namespace::root())),
        }
    }

    /// Execution this context belongs to
    pub fn execution_id(&self) -> &str {
        &self.runtime.execution_id
    }

    /// Namespace of this context
    pub fn namespace(&self) -> &Namespace {
        &self.scope.namespace
    }

    /// Engine configuration in effect
    pub fn config(&self) -> &EngineConfig {
        &self.runtime.config
    }

    /// Context for the nested namespace `label`
    pub(crate) fn child(&self, label: &str) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            scope: Arc::new(Scope::new(self.scope.namespace.child(label))),
        }
    }

    /// Reserve `name` in this namespace for the current attempt
    pub(crate) fn claim(&self, name: &str) -> Result<()> {
        if self.scope.claimed.lock().insert(name.to_string()) {
            Ok(())
        } else {
            Err(self.duplicate(name))
        }
    }

    pub(crate) fn duplicate(&self, name: &str) -> DurableError {
        DurableError::DuplicateStepName {
            namespace: self.scope.namespace.as_str().to_string(),
            name: name.to_string(),
        }
    }

    /// History key of `name` in this namespace
    pub(crate) fn key(&self, name: &str) -> RecordKey {
        RecordKey::new(
            self.runtime.execution_id.clone(),
            self.scope.namespace.clone(),
            name,
        )
    }

    /// `namespace/name`, or just `name` at the root
    pub(crate) fn qualified(&self, name: &str) -> String {
        if self.scope.namespace.is_root() {
            name.to_string()
        } else {
            format!("{}/{}", self.scope.namespace.as_str(), name)
        }
    }

    /// Next auto-generated name for an unnamed timed wait
    pub(crate) fn next_wait_name(&self) -> String {
        let n = self.scope.wait_counter.fetch_add(1, Ordering::SeqCst);
        format!("wait-{}", n)
    }
}

impl fmt::Debug for DurableContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableContext")
            .field("execution_id", &self.runtime.execution_id)
            .field("namespace", &self.scope.namespace)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Harness;

    #[tokio::test]
    async fn test_claim_rejects_duplicates_per_namespace() {
        let harness = Harness::new().await;
        let ctx = harness.attempt();

        ctx.claim("a").unwrap();
        assert!(ctx.claim("a").is_err());

        let child = ctx.child("nested");
        child.claim("a").unwrap();
        assert_eq!(child.qualified("a"), "nested/a");
        assert_eq!(ctx.qualified("a"), "a");
    }

    #[tokio::test]
    async fn test_fresh_attempt_resets_claims() {
        let harness = Harness::new().await;
        harness.attempt().claim("a").unwrap();
        harness.attempt().claim("a").unwrap();
    }

    #[tokio::test]
    async fn test_wait_names_are_sequential_per_scope() {
        let harness = Harness::new().await;
        let ctx = harness.attempt();
        assert_eq!(ctx.next_wait_name(), "wait-0");
        assert_eq!(ctx.clone().next_wait_name(), "wait-1");
        assert_eq!(ctx.child("c").next_wait_name(), "wait-0");
    }
}
