//! Callback submission collaborator
//!
//! When a callback wait starts, the engine hands the callback id to a
//! [`CallbackSubmitter`] exactly once (inside the registration step). The
//! submitter tells the outside world how to resume the execution, e.g. by
//! sending an approval email containing the id, or by enqueueing a job that
//! will later call [`ExecutionDriver::signal`](crate::ExecutionDriver::signal).
//!
//! The id is scoped to the execution (see [`callback_id`](crate::callback_id)),
//! so two executions of one workflow waiting on the same name never share a
//! token. The workflow-level name travels alongside it in [`CallbackRequest::name`].

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durable_checkpoint::WaitToken;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// What an external system needs to resolve a callback wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    /// Execution waiting on the callback
    pub execution_id: String,
    /// Name the workflow gave the wait
    pub name: String,
    /// Execution-scoped id to pass back in the signal
    pub callback_id: String,
    /// Unique token value
    pub token: String,
    /// Deadline after which a signal is dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CallbackRequest {
    /// Request for the wait `name` correlated by `token`
    pub fn new(name: impl Into<String>, token: &WaitToken) -> Self {
        Self {
            execution_id: token.execution_id.clone(),
            name: name.into(),
            callback_id: token.callback_id.clone(),
            token: token.token.clone(),
            expires_at: token.expires_at,
        }
    }
}

/// Delivers callback ids to the system that will later signal them
#[async_trait]
pub trait CallbackSubmitter: Send + Sync {
    /// Hand off a new callback; an error fails the callback wait
    async fn submit(&self, request: &CallbackRequest) -> Result<()>;
}

/// Submitter that only logs the callback id
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSubmitter;

#[async_trait]
impl CallbackSubmitter for LoggingSubmitter {
    async fn submit(&self, request: &CallbackRequest) -> Result<()> {
        info!(
            execution_id = %request.execution_id,
            name = %request.name,
            callback_id = %request.callback_id,
            expires_at = ?request.expires_at,
            "callback awaiting external signal"
        );
        Ok(())
    }
}

/// Submitter that keeps every request in memory (useful for testing)
#[derive(Debug, Clone, Default)]
pub struct RecordingSubmitter {
    requests: Arc<Mutex<Vec<CallbackRequest>>>,
}

impl RecordingSubmitter {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests submitted so far, in order
    pub fn requests(&self) -> Vec<CallbackRequest> {
        self.requests.lock().clone()
    }

    /// Most recent request for a wait named `name`, from any execution
    pub fn find(&self, name: &str) -> Option<CallbackRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|request| request.name == name)
            .cloned()
    }

    /// Most recent request for the wait `name` of `execution_id`
    pub fn find_for(&self, execution_id: &str, name: &str) -> Option<CallbackRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|request| request.execution_id == execution_id && request.name == name)
            .cloned()
    }
}

#[async_trait]
impl CallbackSubmitter for RecordingSubmitter {
    async fn submit(&self, request: &CallbackRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_submitter_keeps_order() {
        let submitter = RecordingSubmitter::new();
        for (execution, name) in [("e1", "a"), ("e1", "b"), ("e2", "a")] {
            submitter
                .submit(&CallbackRequest {
                    execution_id: execution.into(),
                    name: name.into(),
                    callback_id: format!("{}#{}", execution, name),
                    token: format!("tok-{}", submitter.requests().len()),
                    expires_at: None,
                })
                .await
                .unwrap();
        }

        assert_eq!(submitter.requests().len(), 3);
        assert_eq!(submitter.find("a").unwrap().token, "tok-2");
        assert_eq!(submitter.find_for("e1", "a").unwrap().callback_id, "e1#a");
        assert!(submitter.find("zzz").is_none());
        assert!(submitter.find_for("e2", "b").is_none());
    }

    #[test]
    fn test_request_from_token() {
        let now = Utc::now();
        let token = WaitToken {
            token: "t".into(),
            callback_id: "e#cb".into(),
            execution_id: "e".into(),
            expires_at: Some(now),
            created_at: now,
        };
        let request = CallbackRequest::new("cb", &token);
        assert_eq!(request.name, "cb");
        assert_eq!(request.callback_id, "e#cb");
        assert_eq!(request.expires_at, Some(now));
    }
}
