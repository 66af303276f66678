//! Core history data structures for durable executions
//!
//! This module defines the records an execution leaves behind: **[`ExecutionRecord`]**
//! (one per run), **[`StepRecord`]** (one per committed step outcome) and the
//! callback correlation types **[`WaitToken`]** / **[`CallbackState`]**.
//!
//! # Overview
//!
//! - **Append-only** - A [`StepRecord`] is immutable once committed; replay relies on it
//! - **Namespaced** - Records are keyed by `(execution_id, namespace, name)` so nested
//!   child runs can reuse step names without colliding
//! - **Serializable** - Every type round-trips through serde (camelCase on the wire)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ExecutionRecord  (execution_id = "order-42")                │
//! │  • status: Waiting                                           │
//! │  • input: {...}                                              │
//! │                                                               │
//! │  history (by sequence)                                       │
//! │    [0] ns=""            name="validate"      Succeeded       │
//! │    [1] ns="images"      name="images-0"      Succeeded       │
//! │    [2] ns="images"      name="images-1"      Failed          │
//! │    [3] ns=""            name="images"        Failed          │
//! │    [4] ns=""            name="callback:appr" Succeeded       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wire format
//!
//! ```json
//! {
//!   "executionId": "order-42",
//!   "namespace": "",
//!   "name": "validate",
//!   "sequence": 0,
//!   "status": "succeeded",
//!   "result": true,
//!   "committedAt": "2024-01-01T12:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Separator between namespace segments
pub const NAMESPACE_SEPARATOR: char = '/';

/// Encoded form of an empty child label
const EMPTY_SEGMENT: &str = "%";

/// A prefix scoping step names within one execution.
///
/// The root workflow uses the empty namespace. A child namespace is derived
/// from its parent and a label, so replay regenerates exactly the same value.
///
/// ```rust
/// use durable_checkpoint::Namespace;
///
/// let root = Namespace::root();
/// let child = root.child("images");
/// let grandchild = child.child("images-0");
///
/// assert!(root.is_root());
/// assert_eq!(child.as_str(), "images");
/// assert_eq!(grandchild.as_str(), "images/images-0");
/// assert_eq!(grandchild.depth(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// The root namespace (empty string)
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Derive a nested namespace for `label`.
    ///
    /// Separator characters inside the label are escaped so `"a/b"` under the
    /// root can never equal `"b"` under `"a"`. An empty label becomes the
    /// segment `%`, which no escaped label can produce, so a child never
    /// shares its parent's namespace.
    pub fn child(&self, label: &str) -> Self {
        let segment = if label.is_empty() {
            EMPTY_SEGMENT.to_string()
        } else {
            label.replace('%', "%25").replace(NAMESPACE_SEPARATOR, "%2F")
        };
        if self.0.is_empty() {
            Self(segment)
        } else {
            Self(format!("{}{}{}", self.0, NAMESPACE_SEPARATOR, segment))
        }
    }

    /// Whether this is the root namespace
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Nesting depth (0 for root)
    pub fn depth(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split(NAMESPACE_SEPARATOR).count()
        }
    }

    /// Raw string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of a step record: `(execution_id, namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    /// Owning execution
    pub execution_id: String,
    /// Namespace the step ran in
    pub namespace: Namespace,
    /// Step name, unique within the namespace
    pub name: String,
}

impl RecordKey {
    /// Create a new key
    pub fn new(
        execution_id: impl Into<String>,
        namespace: Namespace,
        name: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            namespace,
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.execution_id, self.namespace, self.name)
    }
}

/// Terminal outcome of a committed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Operation returned a value
    Succeeded,
    /// Operation failed (after any retries)
    Failed,
}

/// Serializable error (kind + message) stored in failed records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error kind used for retry/catch matching (e.g. `"OperationError"`, `"TimeoutError"`)
    pub kind: String,
    /// Human readable message
    pub message: String,
    /// Optional structured details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorObject {
    /// Create an error object without details
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One committed step outcome.
///
/// `sequence` is assigned by the store on append and is monotonic per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Owning execution
    pub execution_id: String,
    /// Namespace the step ran in
    pub namespace: Namespace,
    /// Step name
    pub name: String,
    /// Position in the execution's history
    pub sequence: u64,
    /// Outcome
    pub status: StepStatus,
    /// Serialized result (succeeded records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (failed records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// When the record was committed
    pub committed_at: DateTime<Utc>,
}

impl StepRecord {
    /// Build a succeeded record; the store assigns `sequence`
    pub fn succeeded(key: RecordKey, result: Value, committed_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: key.execution_id,
            namespace: key.namespace,
            name: key.name,
            sequence: 0,
            status: StepStatus::Succeeded,
            result: Some(result),
            error: None,
            committed_at,
        }
    }

    /// Build a failed record; the store assigns `sequence`
    pub fn failed(key: RecordKey, error: ErrorObject, committed_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: key.execution_id,
            namespace: key.namespace,
            name: key.name,
            sequence: 0,
            status: StepStatus::Failed,
            result: None,
            error: Some(error),
            committed_at,
        }
    }

    /// Key this record is stored under
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.execution_id.clone(), self.namespace.clone(), self.name.clone())
    }

    /// Recorded outcome as a `Result`
    pub fn outcome(&self) -> std::result::Result<Value, ErrorObject> {
        match self.status {
            StepStatus::Succeeded => Ok(self.result.clone().unwrap_or(Value::Null)),
            StepStatus::Failed => Err(self
                .error
                .clone()
                .unwrap_or_else(|| ErrorObject::new("OperationError", "failed without error detail"))),
        }
    }

    /// Whether two records describe the same outcome (ignores sequence and timestamp)
    pub fn same_outcome(&self, other: &StepRecord) -> bool {
        self.status == other.status && self.result == other.result && self.error == other.error
    }
}

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Workflow function is (or was last) running
    Running,
    /// Suspended on a wait
    Waiting,
    /// Returned normally
    Completed,
    /// An error escaped the workflow function
    Failed,
}

impl ExecutionStatus {
    /// Completed and failed executions are never replayed
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One logical run of a durable workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Stable identifier for the run
    pub execution_id: String,
    /// Current status
    pub status: ExecutionStatus,
    /// Input supplied on first invocation; reused on every replay
    pub input: Value,
    /// Final result once completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Final error once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Number of times the workflow function has been invoked
    pub attempts: u32,
    /// First invocation time
    pub started_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a running execution
    pub fn new(execution_id: impl Into<String>, input: Value, now: DateTime<Utc>) -> Self {
        Self {
            execution_id: execution_id.into(),
            status: ExecutionStatus::Running,
            input,
            result: None,
            error: None,
            attempts: 0,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Correlates a suspended execution with a future external signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitToken {
    /// Unique token value
    pub token: String,
    /// Identifier exposed to the external system
    pub callback_id: String,
    /// Execution waiting on this token
    pub execution_id: String,
    /// Deadline; `None` waits indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Allocation time
    pub created_at: DateTime<Utc>,
}

impl WaitToken {
    /// Whether the token is past its deadline at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|deadline| now >= deadline).unwrap_or(false)
    }
}

/// Resolution state of a wait token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum CallbackState {
    /// Waiting for a signal
    Pending,
    /// A signal arrived before the deadline
    Received {
        /// Signal payload
        payload: Value,
        /// Arrival time
        received_at: DateTime<Utc>,
    },
    /// The deadline passed without a signal
    Expired {
        /// Expiry time
        expired_at: DateTime<Utc>,
    },
}

impl CallbackState {
    /// Whether the token has been consumed
    pub fn is_resolved(&self) -> bool {
        !matches!(self, CallbackState::Pending)
    }
}

/// A registered wait token together with its resolution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEntry {
    /// The token
    pub token: WaitToken,
    /// Current state
    pub state: CallbackState,
}

/// Why a signal was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalRejection {
    /// No token with that callback id
    UnknownCallback,
    /// Token already consumed by an earlier signal or by expiry
    AlreadyResolved,
    /// Signal arrived after the deadline
    Expired,
}

/// Result of delivering a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SignalOutcome {
    /// Payload stored; the execution can resume
    #[serde(rename_all = "camelCase")]
    Accepted {
        /// Execution the token belongs to
        execution_id: String,
    },
    /// Signal dropped
    Rejected {
        /// Reason for rejection
        reason: SignalRejection,
    },
}

impl SignalOutcome {
    /// `{accepted: bool}` view of the outcome
    pub fn accepted(&self) -> bool {
        matches!(self, SignalOutcome::Accepted { .. })
    }

    /// Execution that accepted the signal
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            SignalOutcome::Accepted { execution_id } => Some(execution_id),
            SignalOutcome::Rejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_child_derivation() {
        let root = Namespace::root();
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);

        let child = root.child("resize");
        assert_eq!(child.as_str(), "resize");
        assert_eq!(child.child("x").as_str(), "resize/x");
        assert_eq!(child.child("x").depth(), 2);
    }

    #[test]
    fn test_namespace_escapes_separator() {
        let flat = Namespace::root().child("a/b");
        let nested = Namespace::root().child("a").child("b");
        assert_ne!(flat, nested);
        assert_eq!(flat.depth(), 1);
    }

    #[test]
    fn test_empty_label_gets_own_namespace() {
        let root = Namespace::root();
        let empty = root.child("");
        assert_ne!(empty, root);
        assert!(!empty.is_root());
        assert_eq!(empty.depth(), 1);
        assert_ne!(empty, root.child("%"));

        let parent = root.child("a");
        assert_ne!(parent.child(""), parent);
        assert_eq!(parent.child("").depth(), 2);
    }

    #[test]
    fn test_step_record_wire_format() {
        let key = RecordKey::new("exec-1", Namespace::root(), "validate");
        let record = StepRecord::succeeded(key, json!(true), Utc::now());
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["executionId"], "exec-1");
        assert_eq!(value["namespace"], "");
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["result"], true);
        assert!(value.get("error").is_none());
        assert!(value.get("committedAt").is_some());
    }

    #[test]
    fn test_failed_record_outcome() {
        let key = RecordKey::new("exec-1", Namespace::root(), "charge");
        let record = StepRecord::failed(key, ErrorObject::new("PaymentDeclined", "card expired"), Utc::now());

        let err = record.outcome().unwrap_err();
        assert_eq!(err.kind, "PaymentDeclined");
        assert_eq!(err.to_string(), "PaymentDeclined: card expired");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
    }

    #[test]
    fn test_wait_token_expiry() {
        let now = Utc::now();
        let token = WaitToken {
            token: "t".into(),
            callback_id: "cb".into(),
            execution_id: "exec".into(),
            expires_at: Some(now + chrono::Duration::seconds(10)),
            created_at: now,
        };
        assert!(!token.is_expired_at(now));
        assert!(token.is_expired_at(now + chrono::Duration::seconds(10)));

        let open = WaitToken { expires_at: None, ..token };
        assert!(!open.is_expired_at(now + chrono::Duration::days(365)));
    }

    #[test]
    fn test_signal_outcome_accessors() {
        let accepted = SignalOutcome::Accepted { execution_id: "e".into() };
        assert!(accepted.accepted());
        assert_eq!(accepted.execution_id(), Some("e"));

        let rejected = SignalOutcome::Rejected { reason: SignalRejection::Expired };
        assert!(!rejected.accepted());
        assert_eq!(rejected.execution_id(), None);
    }
}
