//! Storage traits consumed by the durable execution engine
//!
//! The engine never talks to a database directly. It goes through two narrow
//! interfaces:
//!
//! - **[`HistoryStore`]** - execution records plus the append-only step log
//! - **[`CallbackStore`]** - wait tokens and the signals that resolve them
//!
//! # Contract
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  durable-core                                                │
//! │  • step / wait / map / child / invoke                        │
//! │  • look up (execution, namespace, name) before doing work    │
//! │  • append exactly one record per step, await the commit      │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ HistoryStore / CallbackStore
//!              ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Backend (in-memory reference, or your own)                  │
//! │  • append: reject a second write for an existing key         │
//! │  • append: assign a monotonic per-execution sequence         │
//! │  • durability: append returns only after the write is safe   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A backend must make `append` durable before returning: the executor hands a
//! step's result back to workflow code only after the append future resolves.
//!
//! # Implementing a Backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use durable_checkpoint::*;
//!
//! struct PostgresHistory { pool: sqlx::PgPool }
//!
//! #[async_trait]
//! impl HistoryStore for PostgresHistory {
//!     async fn append(&self, record: StepRecord) -> Result<StepRecord> {
//!         // INSERT ... ON CONFLICT (execution_id, namespace, name) DO NOTHING
//!         // zero rows affected -> HistoryError::Conflict
//!         todo!()
//!     }
//!     // ...
//! }
//! ```

use crate::{
    error::{HistoryError, Result},
    record::{CallbackEntry, ExecutionRecord, RecordKey, SignalOutcome, StepRecord, WaitToken},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, TryStreamExt};
use serde_json::Value;
use std::pin::Pin;

/// Async stream of step records in sequence order
pub type HistoryStream = Pin<Box<dyn Stream<Item = Result<StepRecord>> + Send + 'static>>;

/// Append-only history of step outcomes, keyed per execution
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new execution record.
    ///
    /// Fails with [`HistoryError::AlreadyExists`] if the id is taken.
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord>;

    /// Load an execution record
    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>>;

    /// Replace the mutable fields of an execution (status, result, error, attempts).
    ///
    /// Backends must reject any update of an execution that is already terminal.
    async fn update_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Append a step record.
    ///
    /// Assigns `sequence` and returns the stored record. A second append for
    /// an existing key fails with [`HistoryError::Conflict`].
    async fn append(&self, record: StepRecord) -> Result<StepRecord>;

    /// Look up a single record
    async fn get(&self, key: &RecordKey) -> Result<Option<StepRecord>>;

    /// Stream all records of an execution in sequence order
    async fn list(&self, execution_id: &str) -> Result<HistoryStream>;

    /// Collect all records of an execution in sequence order
    async fn history(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        self.list(execution_id).await?.try_collect().await
    }

    /// Remove an execution and its history (archival is external)
    async fn delete_execution(&self, execution_id: &str) -> Result<()> {
        Err(HistoryError::Storage(format!(
            "delete not supported by this backend (execution {})",
            execution_id
        )))
    }
}

/// Wait tokens for callback waits
#[async_trait]
pub trait CallbackStore: Send + Sync {
    /// Register a token.
    ///
    /// Re-registering the same callback id for the same execution returns the
    /// existing entry unchanged. A callback id owned by another execution
    /// fails with [`HistoryError::Conflict`].
    async fn register(&self, token: WaitToken) -> Result<CallbackEntry>;

    /// Current entry for a callback id
    async fn get(&self, callback_id: &str) -> Result<Option<CallbackEntry>>;

    /// Deliver a signal at time `now`.
    ///
    /// Accepted only while the token is pending and not past its deadline.
    /// A signal arriving after the deadline expires the token.
    async fn signal(&self, callback_id: &str, payload: Value, now: DateTime<Utc>)
        -> Result<SignalOutcome>;

    /// Expire a pending token whose deadline has passed at `now`.
    ///
    /// Returns the entry after the call; if a signal won the race the entry
    /// is `Received` and expiry did not happen.
    async fn expire(&self, callback_id: &str, now: DateTime<Utc>) -> Result<CallbackEntry>;

    /// Expire a pending token regardless of its deadline.
    ///
    /// Used when the wait that owns the token can no longer complete; later
    /// signals are rejected. A resolved entry is returned unchanged.
    async fn cancel(&self, callback_id: &str, now: DateTime<Utc>) -> Result<CallbackEntry>;
}
