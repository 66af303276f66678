//! # durable-checkpoint - Step History for Durable Executions
//!
//! **Record types, store traits and in-memory backends** for persisting the
//! outcome of every step a durable workflow performs. The execution engine in
//! `durable-core` replays a workflow from the top on every invocation and uses
//! this history to skip work that has already been done.
//!
//! ## Overview
//!
//! - **[`StepRecord`]** - immutable outcome of one named step (value or error)
//! - **[`ExecutionRecord`]** - status, input and final outcome of one run
//! - **[`WaitToken`]** / **[`CallbackState`]** - correlation for external signals
//! - **[`HistoryStore`]** / **[`CallbackStore`]** - backend traits
//! - **[`InMemoryHistoryStore`]** / **[`InMemoryCallbackStore`]** - reference backends
//!
//! ## Record Keys
//!
//! Every step record is keyed by `(execution_id, namespace, name)`. The root
//! workflow uses [`Namespace::root`]; child contexts and fan-out branches derive
//! nested namespaces with [`Namespace::child`]. At most one record may exist
//! per key, and stores reject a second append with [`HistoryError::Conflict`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use durable_checkpoint::{
//!     ExecutionRecord, HistoryStore, InMemoryHistoryStore, Namespace, RecordKey, StepRecord,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryHistoryStore::new();
//!     let now = chrono::Utc::now();
//!
//!     store.create_execution(ExecutionRecord::new("order-42", json!({"id": 42}), now)).await?;
//!
//!     let key = RecordKey::new("order-42", Namespace::root(), "validate");
//!     store.append(StepRecord::succeeded(key.clone(), json!(true), now)).await?;
//!
//!     let stored = store.get(&key).await?.expect("committed");
//!     assert_eq!(stored.result, Some(json!(true)));
//!
//!     for record in store.history("order-42").await? {
//!         println!("[{}] {}/{} {:?}", record.sequence, record.namespace, record.name, record.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Backends
//!
//! Implement [`HistoryStore`] and [`CallbackStore`] for your database. The only
//! hard requirements are atomic rejection of duplicate keys, monotonic sequence
//! numbers per execution and durability before `append` returns.
//!
//! ## See Also
//!
//! - `durable-core` - the execution engine that consumes these traits

pub mod error;
pub mod memory;
pub mod record;
pub mod traits;

pub use error::{HistoryError, Result};
pub use memory::{InMemoryCallbackStore, InMemoryHistoryStore};
pub use record::{
    CallbackEntry, CallbackState, ErrorObject, ExecutionRecord, ExecutionStatus, Namespace,
    RecordKey, SignalOutcome, SignalRejection, StepRecord, StepStatus, WaitToken,
    NAMESPACE_SEPARATOR,
};
pub use traits::{CallbackStore, HistoryStore, HistoryStream};
