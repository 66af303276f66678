//! In-memory history and callback storage for development and testing
//!
//! This module provides **[`InMemoryHistoryStore`]** and **[`InMemoryCallbackStore`]** -
//! reference implementations of [`HistoryStore`] and [`CallbackStore`] backed by
//! `Arc<RwLock<HashMap>>`. Clones share the same underlying data, so a store can be
//! handed to a driver and inspected by a test at the same time.
//!
//! # When to Use
//!
//! - ✅ Unit and integration tests
//! - ✅ Local runs of short workflows
//! - ❌ Anything that must survive a process restart
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  InMemoryHistoryStore                                        │
//! │  Arc<RwLock<HashMap<execution_id, ExecutionEntry>>>          │
//! │    ExecutionEntry                                            │
//! │      • record: ExecutionRecord                               │
//! │      • history: Vec<StepRecord>    (index == sequence)       │
//! │      • index: HashMap<(namespace, name), position>           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Simulating Outages
//!
//! [`InMemoryHistoryStore::set_available`] makes every call fail with
//! [`HistoryError::Unavailable`], which the engine surfaces as a fatal error.

use crate::{
    error::{HistoryError, Result},
    record::{
        CallbackEntry, CallbackState, ExecutionRecord, Namespace, RecordKey, SignalOutcome,
        SignalRejection, StepRecord, WaitToken,
    },
    traits::{CallbackStore, HistoryStore, HistoryStream},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Storage entry for one execution
#[derive(Debug, Clone)]
struct ExecutionEntry {
    record: ExecutionRecord,
    history: Vec<StepRecord>,
    index: HashMap<(Namespace, String), usize>,
}

/// Thread-safe in-memory history storage
type HistoryStorage = Arc<RwLock<HashMap<String, ExecutionEntry>>>;

/// In-memory [`HistoryStore`] implementation
///
/// # Example
///
/// ```rust
/// use durable_checkpoint::{ExecutionRecord, HistoryStore, InMemoryHistoryStore};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryHistoryStore::new();
///     let record = ExecutionRecord::new("exec-1", json!({}), chrono::Utc::now());
///     store.create_execution(record).await?;
///
///     assert_eq!(store.execution_count().await, 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryHistoryStore {
    storage: HistoryStorage,
    available: Arc<AtomicBool>,
}

impl InMemoryHistoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Number of executions tracked
    pub async fn execution_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of step records across all executions
    pub async fn record_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|entry| entry.history.len())
            .sum()
    }

    /// Clear all data (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    /// Toggle availability; when unavailable every call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HistoryError::Unavailable("in-memory store disabled".to_string()))
        }
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<ExecutionRecord> {
        self.ensure_available()?;
        let mut storage = self.storage.write().await;
        if storage.contains_key(&record.execution_id) {
            return Err(HistoryError::AlreadyExists(record.execution_id));
        }

        storage.insert(
            record.execution_id.clone(),
            ExecutionEntry {
                record: record.clone(),
                history: Vec::new(),
                index: HashMap::new(),
            },
        );
        Ok(record)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        self.ensure_available()?;
        let storage = self.storage.read().await;
        Ok(storage.get(execution_id).map(|entry| entry.record.clone()))
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.ensure_available()?;
        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&record.execution_id)
            .ok_or_else(|| HistoryError::NotFound(record.execution_id.clone()))?;

        if entry.record.status.is_terminal() {
            return Err(HistoryError::Invalid(format!(
                "execution {} is already {}",
                record.execution_id, entry.record.status
            )));
        }

        entry.record = record.clone();
        Ok(())
    }

    async fn append(&self, mut record: StepRecord) -> Result<StepRecord> {
        self.ensure_available()?;
        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&record.execution_id)
            .ok_or_else(|| HistoryError::NotFound(record.execution_id.clone()))?;

        let slot = (record.namespace.clone(), record.name.clone());
        if entry.index.contains_key(&slot) {
            return Err(HistoryError::Conflict(record.key().to_string()));
        }

        record.sequence = entry.history.len() as u64;
        entry.index.insert(slot, entry.history.len());
        entry.history.push(record.clone());

        debug!(
            execution_id = %record.execution_id,
            namespace = %record.namespace,
            name = %record.name,
            sequence = record.sequence,
            "step record committed"
        );
        Ok(record)
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<StepRecord>> {
        self.ensure_available()?;
        let storage = self.storage.read().await;
        Ok(storage.get(&key.execution_id).and_then(|entry| {
            entry
                .index
                .get(&(key.namespace.clone(), key.name.clone()))
                .map(|&position| entry.history[position].clone())
        }))
    }

    async fn list(&self, execution_id: &str) -> Result<HistoryStream> {
        self.ensure_available()?;
        let storage = self.storage.read().await;
        let records = storage
            .get(execution_id)
            .map(|entry| entry.history.clone())
            .ok_or_else(|| HistoryError::NotFound(execution_id.to_string()))?;

        Ok(Box::pin(stream::iter(records.into_iter().map(Ok))))
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<()> {
        self.ensure_available()?;
        self.storage.write().await.remove(execution_id);
        Ok(())
    }
}

/// Thread-safe in-memory callback storage
type CallbackStorage = Arc<RwLock<HashMap<String, CallbackEntry>>>;

/// In-memory [`CallbackStore`] implementation
#[derive(Debug, Clone, Default)]
pub struct InMemoryCallbackStore {
    storage: CallbackStorage,
}

impl InMemoryCallbackStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens still pending
    pub async fn pending_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .filter(|entry| !entry.state.is_resolved())
            .count()
    }
}

#[async_trait]
impl CallbackStore for InMemoryCallbackStore {
    async fn register(&self, token: WaitToken) -> Result<CallbackEntry> {
        let mut storage = self.storage.write().await;
        if let Some(existing) = storage.get(&token.callback_id) {
            if existing.token.execution_id != token.execution_id {
                return Err(HistoryError::Conflict(format!(
                    "callback id {} is owned by execution {}",
                    token.callback_id, existing.token.execution_id
                )));
            }
            return Ok(existing.clone());
        }

        let entry = CallbackEntry {
            token: token.clone(),
            state: CallbackState::Pending,
        };
        storage.insert(token.callback_id.clone(), entry.clone());
        Ok(entry)
    }

    async fn get(&self, callback_id: &str) -> Result<Option<CallbackEntry>> {
        Ok(self.storage.read().await.get(callback_id).cloned())
    }

    async fn signal(
        &self,
        callback_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<SignalOutcome> {
        let mut storage = self.storage.write().await;
        let Some(entry) = storage.get_mut(callback_id) else {
            warn!(callback_id, "signal for unknown callback dropped");
            return Ok(SignalOutcome::Rejected {
                reason: SignalRejection::UnknownCallback,
            });
        };

        if entry.state.is_resolved() {
            warn!(callback_id, "signal for already resolved callback dropped");
            return Ok(SignalOutcome::Rejected {
                reason: SignalRejection::AlreadyResolved,
            });
        }

        if entry.token.is_expired_at(now) {
            warn!(callback_id, "late signal after callback deadline dropped");
            entry.state = CallbackState::Expired { expired_at: now };
            return Ok(SignalOutcome::Rejected {
                reason: SignalRejection::Expired,
            });
        }

        entry.state = CallbackState::Received {
            payload,
            received_at: now,
        };
        Ok(SignalOutcome::Accepted {
            execution_id: entry.token.execution_id.clone(),
        })
    }

    async fn expire(&self, callback_id: &str, now: DateTime<Utc>) -> Result<CallbackEntry> {
        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(callback_id)
            .ok_or_else(|| HistoryError::NotFound(format!("callback {}", callback_id)))?;

        if !entry.state.is_resolved() && entry.token.is_expired_at(now) {
            entry.state = CallbackState::Expired { expired_at: now };
        }
        Ok(entry.clone())
    }

    async fn cancel(&self, callback_id: &str, now: DateTime<Utc>) -> Result<CallbackEntry> {
        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(callback_id)
            .ok_or_else(|| HistoryError::NotFound(format!("callback {}", callback_id)))?;

        if !entry.state.is_resolved() {
            debug!(callback_id, "pending callback cancelled");
            entry.state = CallbackState::Expired { expired_at: now };
        }
        Ok(entry.clone())
    }
}
