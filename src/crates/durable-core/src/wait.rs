//! Wait Coordinator - timed, callback and condition waits
//!
//! All three modes are built from checkpointed steps, so they replay exactly
//! like any other step. A wait that cannot complete yet returns
//! [`DurableError::Suspended`], which the workflow propagates with `?`.
//!
//! # Timed wait
//!
//! ```text
//! wait_named("cooldown", 1h)
//!   step "cooldown"          → {resumeAt}        (recorded on first pass)
//!   now < resumeAt           → Suspended(wake_at = resumeAt)
//!   now ≥ resumeAt           → step "cooldown:resumed" → {resumedAt}
//! ```
//!
//! # Callback wait
//!
//! ```text
//! wait_for_callback("approval", 1h)
//!   callback id                      = "<execution>#<namespace>/approval"
//!   step "callback:approval"         → register WaitToken, submit callback id once
//!   token Received                   → step "callback:approval:result" = Received(payload)
//!   token Pending and past deadline  → expire token, result = TimedOut
//!   token Pending                    → Suspended(callbacks = ["approval"], wake_at = deadline)
//! ```
//!
//! Derived names (`<name>:resumed`, `callback:<name>:result`,
//! `<name>:update-<i>`, ...) are claimed alongside the wait's own name, so a
//! step reusing one fails with [`DurableError::DuplicateStepName`].
//!
//! # Condition wait
//!
//! ```text
//! wait_for_condition("ready", config, update, check)
//!   [step "ready:start"]                  (only with a timeout: anchors the deadline)
//!   i = 1, 2, ...
//!     step "ready:update-i" = update(state, i)
//!     check(state, i) == Done             → return state
//!     i == cap                            → IterationCapExceeded
//!     timed wait "ready:delay-i"          → Timeout if it would end past the deadline
//! ```

use crate::context::DurableContext;
use crate::error::{DurableError, Result, Suspension};
use crate::submitter::CallbackRequest;
use chrono::{DateTime, Utc};
use durable_checkpoint::{CallbackState, Namespace, WaitToken};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduledWait {
    resume_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumedWait {
    resumed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionStart {
    started_at: DateTime<Utc>,
}

/// Result of a callback wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "payload", rename_all = "camelCase")]
pub enum CallbackOutcome<T> {
    /// A signal arrived before the deadline
    Received(T),
    /// The deadline passed without a signal
    TimedOut,
}

impl<T> CallbackOutcome<T> {
    /// Whether the wait timed out
    pub fn is_timed_out(&self) -> bool {
        matches!(self, CallbackOutcome::TimedOut)
    }

    /// Payload, if one arrived
    pub fn received(self) -> Option<T> {
        match self {
            CallbackOutcome::Received(payload) => Some(payload),
            CallbackOutcome::TimedOut => None,
        }
    }

    /// Payload, or `fallback` after a timeout
    pub fn unwrap_or(self, fallback: T) -> T {
        self.received().unwrap_or(fallback)
    }
}

/// Options for a condition wait.
///
/// `initial_state` is the first PollState handed to `update`.
#[derive(Debug, Clone)]
pub struct ConditionConfig<S> {
    /// Initial poll state
    pub initial_state: S,
    /// Iteration cap; the engine's `condition_max_attempts` when absent
    pub max_attempts: Option<u32>,
    /// Overall bound measured from the first poll
    pub timeout: Option<Duration>,
    /// Delay used when the check does not supply one
    pub default_delay: Option<Duration>,
}

impl<S> ConditionConfig<S> {
    /// Start polling from `initial_state`
    pub fn new(initial_state: S) -> Self {
        Self {
            initial_state,
            max_attempts: None,
            timeout: None,
            default_delay: None,
        }
    }

    /// Cap the number of update calls
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Bound the whole wait
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay between polls when the check does not choose one
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }
}

/// What a condition check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// Poll again after `delay` (or the configured default)
    Continue {
        /// Delay before the next poll
        delay: Option<Duration>,
    },
    /// Stop polling and return the current state
    Done,
}

impl WaitDecision {
    /// Poll again after `delay`
    pub fn continue_after(delay: Duration) -> Self {
        WaitDecision::Continue { delay: Some(delay) }
    }

    /// Poll again after the default delay
    pub fn continue_polling() -> Self {
        WaitDecision::Continue { delay: None }
    }
}

fn deadline_after(start: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .ok_or_else(|| DurableError::Validation(format!("duration {:?} is out of range", duration)))
}

/// Execution-scoped id of the callback wait `name` in `namespace`.
///
/// This is the id handed to the [`CallbackSubmitter`](crate::CallbackSubmitter)
/// and expected by [`ExecutionDriver::signal`](crate::ExecutionDriver::signal).
///
/// ```rust
/// use durable_core::{callback_id, Namespace};
///
/// assert_eq!(callback_id("order-1", &Namespace::root(), "approve"), "order-1#approve");
/// assert_eq!(
///     callback_id("order-1", &Namespace::root().child("review"), "approve"),
///     "order-1#review/approve"
/// );
/// ```
pub fn callback_id(execution_id: &str, namespace: &Namespace, name: &str) -> String {
    format!("{}#{}", execution_id, namespace.child(name).as_str())
}

fn decode_outcome<T: DeserializeOwned>(outcome: CallbackOutcome<Value>) -> Result<CallbackOutcome<T>> {
    Ok(match outcome {
        CallbackOutcome::Received(payload) => CallbackOutcome::Received(serde_json::from_value(payload)?),
        CallbackOutcome::TimedOut => CallbackOutcome::TimedOut,
    })
}

fn resumed_name(name: &str) -> String {
    format!("{}:resumed", name)
}

impl DurableContext {
    /// Suspend for `duration` under an auto-generated name (`wait-<n>`)
    pub async fn wait(&self, duration: Duration) -> Result<()> {
        let name = self.next_wait_name();
        self.wait_named(&name, duration).await
    }

    /// Suspend for `duration` under an explicit name
    pub async fn wait_named(&self, name: &str, duration: Duration) -> Result<()> {
        self.claim(name)?;
        self.claim(&resumed_name(name))?;
        let resume_at = self.schedule_wait(name, duration).await?;
        self.await_wake(name, resume_at).await
    }

    /// Record (or replay) the resume time of a timed wait
    async fn schedule_wait(&self, name: &str, duration: Duration) -> Result<DateTime<Utc>> {
        let resume_at = deadline_after(self.runtime.clock.now(), duration)?;
        let scheduled: ScheduledWait = self
            .run_once(name, || async move { Ok(ScheduledWait { resume_at }) })
            .await?;
        Ok(scheduled.resume_at)
    }

    /// Suspend until `resume_at`, then record the actual resume time
    async fn await_wake(&self, name: &str, resume_at: DateTime<Utc>) -> Result<()> {
        let resumed = resumed_name(name);
        if let Some(recorded) = self.lookup::<ResumedWait>(&resumed).await? {
            return recorded.map(|_| ());
        }

        let now = self.runtime.clock.now();
        if now < resume_at {
            debug!(
                execution_id = %self.execution_id(),
                wait = %self.qualified(name),
                resume_at = %resume_at,
                "timed wait pending"
            );
            return Err(DurableError::Suspended(Suspension::timer(
                self.qualified(name),
                resume_at,
            )));
        }

        self.commit(&resumed, Ok(ResumedWait { resumed_at: now }))
            .await
            .map(|_| ())
    }

    /// Suspend until an external signal for the callback wait `name` arrives
    /// or `timeout` elapses.
    ///
    /// The execution-scoped id from [`callback_id`] is handed to the configured
    /// [`CallbackSubmitter`](crate::CallbackSubmitter) exactly once. Without a
    /// timeout (and no engine default) the wait lasts until a signal arrives.
    pub async fn wait_for_callback<T>(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<CallbackOutcome<T>>
    where
        T: DeserializeOwned,
    {
        let step_name = format!("callback:{}", name);
        let result_name = format!("{}:result", step_name);
        self.claim(&step_name)?;
        self.claim(&result_name)?;

        if let Some(recorded) = self.lookup::<CallbackOutcome<Value>>(&result_name).await? {
            return decode_outcome(recorded?);
        }

        let timeout = timeout.or_else(|| self.runtime.config.execution.default_callback_timeout());
        let token: WaitToken = self
            .run_once(&step_name, || self.register_callback(name, timeout))
            .await?;
        let callback_id = token.callback_id.as_str();

        let now = self.runtime.clock.now();
        let entry = self
            .runtime
            .callbacks
            .get(callback_id)
            .await?
            .ok_or_else(|| DurableError::Fatal(format!("wait token for callback {} is missing", callback_id)))?;

        let state = match entry.state {
            CallbackState::Pending if token.is_expired_at(now) => {
                self.runtime.callbacks.expire(callback_id, now).await?.state
            }
            state => state,
        };

        let outcome = match state {
            CallbackState::Received { payload, .. } => CallbackOutcome::Received(payload),
            CallbackState::Expired { .. } => {
                warn!(
                    execution_id = %self.execution_id(),
                    callback_id,
                    "callback wait timed out"
                );
                CallbackOutcome::TimedOut
            }
            CallbackState::Pending => {
                debug!(
                    execution_id = %self.execution_id(),
                    callback_id,
                    "callback wait pending"
                );
                return Err(DurableError::Suspended(Suspension::callback(
                    self.qualified(&step_name),
                    callback_id,
                    token.expires_at,
                )));
            }
        };

        let outcome = self.commit(&result_name, Ok(outcome)).await?;
        decode_outcome(outcome)
    }

    /// Allocate the wait token and hand the callback id to the outside world.
    ///
    /// A token whose submission fails is cancelled, so no signal can resolve it.
    async fn register_callback(&self, name: &str, timeout: Option<Duration>) -> Result<WaitToken> {
        let now = self.runtime.clock.now();
        let expires_at = match timeout {
            Some(timeout) => Some(deadline_after(now, timeout)?),
            None => None,
        };

        let entry = self
            .runtime
            .callbacks
            .register(WaitToken {
                token: uuid::Uuid::new_v4().to_string(),
                callback_id: callback_id(self.execution_id(), self.namespace(), name),
                execution_id: self.execution_id().to_string(),
                expires_at,
                created_at: now,
            })
            .await?;
        let callback_id = entry.token.callback_id.as_str();

        let request = CallbackRequest::new(name, &entry.token);
        if let Err(err) = self.runtime.submitter.submit(&request).await {
            warn!(
                execution_id = %self.execution_id(),
                callback_id,
                error = %err,
                "callback submission failed, cancelling token"
            );
            self.runtime.callbacks.cancel(callback_id, now).await?;
            return Err(err);
        }

        info!(
            execution_id = %self.execution_id(),
            callback_id,
            expires_at = ?entry.token.expires_at,
            "callback registered"
        );
        Ok(entry.token)
    }

    /// Poll with `update` until `check` says done.
    ///
    /// The poll state is threaded explicitly: each `update` call receives the
    /// previous state and the 1-based iteration number and is checkpointed as
    /// its own step, so a probe is never repeated once recorded.
    pub async fn wait_for_condition<S, U, UFut, C>(
        &self,
        name: &str,
        config: ConditionConfig<S>,
        mut update: U,
        mut check: C,
    ) -> Result<S>
    where
        S: Serialize + DeserializeOwned,
        U: FnMut(S, u32) -> UFut,
        UFut: Future<Output = Result<S>>,
        C: FnMut(&S, u32) -> WaitDecision,
    {
        self.claim(name)?;
        let start_name = format!("{}:start", name);
        self.claim(&start_name)?;
        let cap = config
            .max_attempts
            .unwrap_or(self.runtime.config.execution.condition_max_attempts);

        let deadline = match config.timeout {
            Some(timeout) => {
                let now = self.runtime.clock.now();
                let start: ConditionStart = self
                    .run_once(&start_name, || async move {
                        Ok(ConditionStart { started_at: now })
                    })
                    .await?;
                Some(deadline_after(start.started_at, timeout)?)
            }
            None => None,
        };

        let mut state = config.initial_state;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let update_name = format!("{}:update-{}", name, attempt);
            self.claim(&update_name)?;
            state = match self.lookup::<S>(&update_name).await? {
                Some(recorded) => recorded?,
                None => {
                    let outcome = update(state, attempt).await;
                    self.commit(&update_name, outcome).await?
                }
            };

            let delay = match check(&state, attempt) {
                WaitDecision::Done => {
                    debug!(
                        execution_id = %self.execution_id(),
                        condition = name,
                        attempts = attempt,
                        "condition satisfied"
                    );
                    return Ok(state);
                }
                WaitDecision::Continue { delay } => delay
                    .or(config.default_delay)
                    .unwrap_or_else(|| self.runtime.config.execution.default_poll_delay()),
            };

            if attempt >= cap {
                warn!(
                    execution_id = %self.execution_id(),
                    condition = name,
                    max_attempts = cap,
                    "condition wait exceeded iteration cap"
                );
                return Err(DurableError::IterationCapExceeded {
                    name: name.to_string(),
                    max_attempts: cap,
                });
            }

            let delay_name = format!("{}:delay-{}", name, attempt);
            self.claim(&delay_name)?;
            self.claim(&resumed_name(&delay_name))?;
            let resume_at = self.schedule_wait(&delay_name, delay).await?;
            if let Some(deadline) = deadline {
                if resume_at > deadline {
                    return Err(DurableError::Timeout(format!(
                        "condition wait '{}' not satisfied before {}",
                        name, deadline
                    )));
                }
            }
            self.await_wake(&delay_name, resume_at).await?;
        }
    }
}
