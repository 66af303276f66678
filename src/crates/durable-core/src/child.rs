//! Child Context Manager - nested sub-workflows
//!
//! `run_in_child_context(label, f)` runs `f` against a context whose namespace
//! is the enclosing namespace plus `label`. The whole child run is a single
//! checkpointed step named `label` in the parent namespace:
//!
//! ```text
//! parent ns ""                       child ns "resize"
//! ┌───────────────────────┐          ┌──────────────────────────┐
//! │ step "validate"       │          │ step "download"          │
//! │ step "resize" ────────┼─────────→│ step "scale"             │
//! │   (aggregated result) │          │ wait "wait-0"            │
//! │ step "publish"        │          │ step "upload"            │
//! └───────────────────────┘          └──────────────────────────┘
//! ```
//!
//! Once `resize` is committed in the parent, later replays return the stored
//! value without entering the child at all. Labels must be non-empty.

use crate::context::DurableContext;
use crate::error::{DurableError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::debug;

impl DurableContext {
    /// Run `f` in an isolated namespace and checkpoint its result under `label`
    pub async fn run_in_child_context<T, F, Fut>(&self, label: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(DurableContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if label.is_empty() {
            return Err(DurableError::Validation(format!(
                "child context label in namespace '{}' must not be empty",
                self.namespace()
            )));
        }
        self.claim(label)?;
        let child = self.child(label);
        self.run_once(label, move || {
            debug!(
                execution_id = %child.execution_id(),
                namespace = %child.namespace(),
                "entering child context"
            );
            f(child)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::context::testing::Harness;
    use crate::error::{DurableError, Result};
    use durable_checkpoint::{HistoryStore, Namespace, RecordKey};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_same_step_name_in_parent_and_child() {
        let harness = Harness::new().await;
        let ctx = harness.attempt();

        let parent: String = ctx.step("x", || async { Ok("parent".to_string()) }).await.unwrap();
        let child: String = ctx
            .run_in_child_context("nested", |child| async move {
                child.step("x", || async { Ok("child".to_string()) }).await
            })
            .await
            .unwrap();

        assert_eq!(parent, "parent");
        assert_eq!(child, "child");

        let root_x = harness
            .history
            .get(&RecordKey::new("exec-test", Namespace::root(), "x"))
            .await
            .unwrap()
            .unwrap();
        let child_x = harness
            .history
            .get(&RecordKey::new("exec-test", Namespace::root().child("nested"), "x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root_x.result, Some(json!("parent")));
        assert_eq!(child_x.result, Some(json!("child")));
    }

    #[tokio::test]
    async fn test_committed_child_is_not_reentered() {
        let harness = Harness::new().await;
        let entered = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let entered = Arc::clone(&entered);
            let total: u32 = harness
                .attempt()
                .run_in_child_context("sum", move |child| async move {
                    entered.fetch_add(1, Ordering::SeqCst);
                    let a: u32 = child.step("a", || async { Ok(1) }).await?;
                    let b: u32 = child.step("b", || async { Ok(2) }).await?;
                    Ok(a + b)
                })
                .await
                .unwrap();
            assert_eq!(total, 3);
        }

        assert_eq!(entered.load(Ordering::SeqCst), 1);
        // a, b and the aggregated record
        assert_eq!(harness.history.record_count().await, 3);
    }

    #[tokio::test]
    async fn test_child_failure_recorded_in_parent() {
        let harness = Harness::new().await;

        let first: Result<u32> = harness
            .attempt()
            .run_in_child_context("broken", |child| async move {
                child
                    .step("boom", || async { Err::<u32, _>(DurableError::failed("child failed")) })
                    .await
            })
            .await;
        assert!(first.is_err());

        let replayed: Result<u32> = harness
            .attempt()
            .run_in_child_context("broken", |_| async { Ok(7) })
            .await;
        assert_eq!(replayed.unwrap_err().to_string(), "OperationError: child failed");
    }

    #[tokio::test]
    async fn test_empty_label_rejected_without_touching_parent() {
        let harness = Harness::new().await;
        let ctx = harness.attempt();
        let _: String = ctx.step("x", || async { Ok("outer".to_string()) }).await.unwrap();

        let entered = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&entered);
        let result: Result<String> = ctx
            .run_in_child_context("", move |child| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                child.step("x", || async { Ok("inner".to_string()) }).await
            })
            .await;

        assert!(matches!(result, Err(DurableError::Validation(_))));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        assert_eq!(harness.history.record_count().await, 1);

        let mapped: Result<Vec<u32>> = ctx.map("", vec![1u32], |_, item, _| async move { Ok(item) }).await;
        assert!(matches!(mapped, Err(DurableError::Validation(_))));
    }
}
