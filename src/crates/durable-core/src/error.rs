//! Error types for durable workflow execution
//!
//! Every primitive on [`DurableContext`](crate::DurableContext) returns
//! [`Result<T>`](Result), an alias for `std::result::Result<T, DurableError>`.
//!
//! # Error Hierarchy
//!
//! ```text
//! DurableError
//! ├── Operation             - A step body failed (kind + message)
//! ├── Timeout               - A callback or condition wait exceeded its bound
//! ├── DuplicateStepName     - The same name was used twice in one namespace
//! ├── IterationCapExceeded  - A condition wait polled too many times
//! ├── FanOut                - One or more map/parallel branches failed
//! ├── Suspended             - Control flow: the execution must wait
//! ├── Fatal / History       - The history store is unavailable or corrupt
//! ├── Serialization / Yaml / Toml / Io
//! ├── Configuration         - Invalid engine configuration
//! ├── Validation            - Invalid argument or state machine definition
//! └── NotFound              - Unknown execution id
//! ```
//!
//! # Recorded vs. Propagated
//!
//! When a step fails, the error is written to history as an
//! [`ErrorObject`] and rebuilt from it on every replay, so the workflow sees
//! the same error both times. Two classes are never recorded:
//!
//! - [`DurableError::Suspended`] must travel untouched to the driver. Workflow
//!   code that catches errors has to re-raise it (see [`DurableError::is_suspended`]).
//! - Fatal errors ([`DurableError::is_fatal`]) mean history itself cannot be
//!   trusted, so nothing can be recorded.
//!
//! # Example
//!
//! ```rust
//! use durable_core::error::DurableError;
//!
//! let err = DurableError::operation("PaymentDeclined", "card expired");
//! assert_eq!(err.kind(), "PaymentDeclined");
//!
//! let object = err.to_error_object();
//! let replayed = DurableError::from_error_object(object);
//! assert_eq!(replayed.kind(), "PaymentDeclined");
//! ```

use chrono::{DateTime, Utc};
use durable_checkpoint::{ErrorObject, HistoryError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Result type for durable operations
pub type Result<T> = std::result::Result<T, DurableError>;

/// Well-known error kinds written to history
pub mod kinds {
    /// Default kind for failures raised by step bodies
    pub const OPERATION: &str = "OperationError";
    /// Callback or condition wait exceeded its bound
    pub const TIMEOUT: &str = "TimeoutError";
    /// A step name was reused inside one namespace
    pub const DUPLICATE_STEP_NAME: &str = "DuplicateStepNameError";
    /// A condition wait exceeded its iteration cap
    pub const ITERATION_CAP_EXCEEDED: &str = "IterationCapExceededError";
    /// History store unavailable or corrupt
    pub const FATAL: &str = "FatalEngineError";
    /// Aggregate failure of map/parallel branches
    pub const FAN_OUT: &str = "FanOutError";
    /// Value could not be serialized or deserialized
    pub const SERIALIZATION: &str = "SerializationError";
    /// A branch task panicked
    pub const PANIC: &str = "PanicError";
    /// Invoke target is not registered
    pub const FUNCTION_NOT_FOUND: &str = "FunctionNotFoundError";
    /// Configuration problem
    pub const CONFIGURATION: &str = "ConfigurationError";
    /// Invalid argument or definition
    pub const VALIDATION: &str = "ValidationError";
    /// A store rejected a write that clashes with existing data
    pub const CONFLICT: &str = "ConflictError";
    /// Wildcard matching every recordable kind in retry and catch rules
    pub const ALL: &str = "States.ALL";
}

/// Why and until when an execution is waiting.
///
/// Suspensions from concurrent branches are merged: the earliest wake time
/// wins and callback ids and wait names are unioned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suspension {
    /// Earliest time a resume can make progress (`None` = only a signal can)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    /// Callback ids still waiting for a signal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<String>,
    /// Fully qualified names of the open waits
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waits: Vec<String>,
}

impl Suspension {
    /// Suspension on a timer
    pub fn timer(wait: impl Into<String>, wake_at: DateTime<Utc>) -> Self {
        Self {
            wake_at: Some(wake_at),
            callbacks: Vec::new(),
            waits: vec![wait.into()],
        }
    }

    /// Suspension on an external callback, optionally bounded by a deadline
    pub fn callback(
        wait: impl Into<String>,
        callback_id: impl Into<String>,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            wake_at: deadline,
            callbacks: vec![callback_id.into()],
            waits: vec![wait.into()],
        }
    }

    /// Combine two suspensions
    pub fn merge(mut self, other: Suspension) -> Self {
        self.wake_at = match (self.wake_at, other.wake_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        for callback in other.callbacks {
            if !self.callbacks.contains(&callback) {
                self.callbacks.push(callback);
            }
        }
        for wait in other.waits {
            if !self.waits.contains(&wait) {
                self.waits.push(wait);
            }
        }
        self
    }
}

/// One failed branch of a map or parallel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFailure {
    /// Input position of the branch
    pub index: usize,
    /// Recorded error of the branch
    pub error: ErrorObject,
}

/// Errors raised by durable primitives and the execution driver
#[derive(Error, Debug)]
pub enum DurableError {
    /// A step body failed.
    ///
    /// The [`ErrorObject::kind`] is matched by retry policies and catch rules.
    #[error("{0}")]
    Operation(ErrorObject),

    /// A callback or condition wait exceeded its bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A step name was used twice in the same namespace during one attempt.
    ///
    /// Step names must be unique per namespace; two call sites sharing a name
    /// would otherwise replay each other's results.
    #[error("Duplicate step name '{name}' in namespace '{namespace}'")]
    DuplicateStepName {
        /// Namespace of the collision
        namespace: String,
        /// Colliding name
        name: String,
    },

    /// A condition wait reached its iteration cap without finishing
    #[error("Condition wait '{name}' exceeded {max_attempts} iterations")]
    IterationCapExceeded {
        /// Name of the condition wait
        name: String,
        /// Configured cap
        max_attempts: u32,
    },

    /// One or more fan-out branches failed.
    ///
    /// Raised only after every branch reached a terminal state.
    #[error("Fan-out '{label}' failed: {} branch(es) failed", failures.len())]
    FanOut {
        /// Label of the map/parallel call
        label: String,
        /// Every failed branch in input order
        failures: Vec<BranchFailure>,
    },

    /// Execution must wait before it can continue.
    ///
    /// This is **not an error** but a control signal. It is produced by waits
    /// and propagated with `?` up to the driver, which marks the execution
    /// `waiting`. Never recorded in history.
    #[error("Execution suspended")]
    Suspended(Suspension),

    /// Engine failure that makes further progress unsafe
    #[error("Fatal engine error: {0}")]
    Fatal(String),

    /// History or callback store failure
    #[error("History store error: {0}")]
    History(#[from] HistoryError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid argument or state machine definition
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown execution
    #[error("Execution not found: {0}")]
    NotFound(String),
}

impl DurableError {
    /// Create an operation error with an explicit kind
    pub fn operation(kind: impl Into<String>, message: impl Into<String>) -> Self {
        DurableError::Operation(ErrorObject::new(kind, message))
    }

    /// Create an operation error of the default `OperationError` kind
    pub fn failed(message: impl Into<String>) -> Self {
        Self::operation(kinds::OPERATION, message)
    }

    /// Kind used for retry/catch matching and for the recorded error
    pub fn kind(&self) -> &str {
        match self {
            DurableError::Operation(object) => &object.kind,
            DurableError::Timeout(_) => kinds::TIMEOUT,
            DurableError::DuplicateStepName { .. } => kinds::DUPLICATE_STEP_NAME,
            DurableError::IterationCapExceeded { .. } => kinds::ITERATION_CAP_EXCEEDED,
            DurableError::FanOut { .. } => kinds::FAN_OUT,
            DurableError::Suspended(_) => "Suspended",
            DurableError::History(HistoryError::Conflict(_) | HistoryError::AlreadyExists(_)) => {
                kinds::CONFLICT
            }
            DurableError::History(HistoryError::NotFound(_)) => kinds::VALIDATION,
            DurableError::Fatal(_) | DurableError::History(_) => kinds::FATAL,
            DurableError::Serialization(_) | DurableError::Yaml(_) | DurableError::Toml(_) => {
                kinds::SERIALIZATION
            }
            DurableError::Io(_) => kinds::OPERATION,
            DurableError::Configuration(_) => kinds::CONFIGURATION,
            DurableError::Validation(_) | DurableError::NotFound(_) => kinds::VALIDATION,
        }
    }

    /// Whether this is a suspension signal
    pub fn is_suspended(&self) -> bool {
        matches!(self, DurableError::Suspended(_))
    }

    /// Whether this error means the engine itself failed.
    ///
    /// Store errors are fatal only when the store is unreachable or corrupt;
    /// conflicts and missing keys are recorded like any other failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            DurableError::Fatal(_) => true,
            DurableError::History(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Whether a step failing with this error gets a failed record
    pub fn is_recordable(&self) -> bool {
        !self.is_suspended() && !self.is_fatal()
    }

    /// Serializable form written to history
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            DurableError::Operation(object) => object.clone(),
            DurableError::Timeout(message) => ErrorObject::new(kinds::TIMEOUT, message.clone()),
            DurableError::DuplicateStepName { namespace, name } => {
                ErrorObject::new(kinds::DUPLICATE_STEP_NAME, self.to_string())
                    .with_details(json!({ "namespace": namespace, "name": name }))
            }
            DurableError::IterationCapExceeded { name, max_attempts } => {
                ErrorObject::new(kinds::ITERATION_CAP_EXCEEDED, self.to_string())
                    .with_details(json!({ "name": name, "maxAttempts": max_attempts }))
            }
            DurableError::FanOut { label, failures } => {
                ErrorObject::new(kinds::FAN_OUT, self.to_string())
                    .with_details(json!({ "label": label, "failures": failures }))
            }
            other => ErrorObject::new(other.kind(), other.to_string()),
        }
    }

    /// Rebuild an error from its recorded form
    pub fn from_error_object(object: ErrorObject) -> Self {
        let details = object.details.clone().unwrap_or(Value::Null);
        match object.kind.as_str() {
            kinds::TIMEOUT => DurableError::Timeout(object.message),
            kinds::DUPLICATE_STEP_NAME => match (details["namespace"].as_str(), details["name"].as_str()) {
                (Some(namespace), Some(name)) => DurableError::DuplicateStepName {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                },
                _ => DurableError::Operation(object),
            },
            kinds::ITERATION_CAP_EXCEEDED => {
                match (details["name"].as_str(), details["maxAttempts"].as_u64()) {
                    (Some(name), Some(max_attempts)) => DurableError::IterationCapExceeded {
                        name: name.to_string(),
                        max_attempts: max_attempts as u32,
                    },
                    _ => DurableError::Operation(object),
                }
            }
            kinds::FAN_OUT => {
                let failures = serde_json::from_value::<Vec<BranchFailure>>(details["failures"].clone());
                match (details["label"].as_str(), failures) {
                    (Some(label), Ok(failures)) => DurableError::FanOut {
                        label: label.to_string(),
                        failures,
                    },
                    _ => DurableError::Operation(object),
                }
            }
            _ => DurableError::Operation(object),
        }
    }
}
