//! Execution Driver - lifecycle of durable executions
//!
//! The driver owns the collaborators (history store, callback store, clock,
//! invoker, callback submitter) and runs the workflow function once per
//! attempt. Every attempt replays the function from the start against the
//! recorded history.
//!
//! # Lifecycle
//!
//! ```text
//!             start
//!               │
//!               ▼
//!          ┌─────────┐  suspension   ┌─────────┐
//!          │ running │──────────────→│ waiting │
//!          │         │←──────────────│         │
//!          └─────────┘    resume     └─────────┘
//!           │       │
//!   returns │       │ error escapes
//!           ▼       ▼
//!   ┌───────────┐ ┌────────┐
//!   │ completed │ │ failed │   terminal: resume returns the stored outcome
//!   └───────────┘ └────────┘
//! ```
//!
//! A fatal error (history store down) leaves the execution `running` and is
//! returned as `Err`; the next resume replays it again.
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = ExecutionDriver::new(workflow_fn("order", order_workflow))
//!     .with_history_store(Arc::new(store))
//!     .with_config(EngineConfig::load(None)?);
//!
//! match driver.start("order-42", json!({"sku": "A1"})).await? {
//!     ExecutionOutcome::Completed(value) => println!("done: {}", value),
//!     ExecutionOutcome::Suspended(s) => println!("waiting until {:?}", s.wake_at),
//!     ExecutionOutcome::Failed { error, .. } => eprintln!("failed: {}", error),
//! }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::{DurableContext, Runtime};
use crate::error::{kinds, DurableError, Result, Suspension};
use crate::invoke::{Invoker, LocalInvoker};
use crate::submitter::{CallbackSubmitter, LoggingSubmitter};
use crate::workflow::Workflow;
use durable_checkpoint::{
    CallbackStore, ErrorObject, ExecutionRecord, ExecutionStatus, HistoryStore, HistoryStream,
    InMemoryCallbackStore, InMemoryHistoryStore, SignalOutcome, StepRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Result of driving an execution once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecutionOutcome {
    /// The workflow returned
    Completed(Value),
    /// An error escaped the workflow
    Failed {
        /// Final error
        error: ErrorObject,
        /// Full history at the time of failure
        history: Vec<StepRecord>,
    },
    /// The workflow is waiting
    Suspended(Suspension),
}

impl ExecutionOutcome {
    /// Whether the execution completed
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed(_))
    }

    /// Whether the execution is waiting
    pub fn is_suspended(&self) -> bool {
        matches!(self, ExecutionOutcome::Suspended(_))
    }

    /// Completed value, if any
    pub fn completed(&self) -> Option<&Value> {
        match self {
            ExecutionOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Starts, resumes and signals durable executions of one workflow
pub struct ExecutionDriver {
    workflow: Arc<dyn Workflow>,
    history: Arc<dyn HistoryStore>,
    callbacks: Arc<dyn CallbackStore>,
    clock: Arc<dyn Clock>,
    invoker: Arc<dyn Invoker>,
    submitter: Arc<dyn CallbackSubmitter>,
    config: EngineConfig,
    signals: watch::Sender<u64>,
}

impl ExecutionDriver {
    /// Driver with in-memory stores, the system clock and default config
    pub fn new<W: Workflow + 'static>(workflow: W) -> Self {
        let (signals, _) = watch::channel(0);
        Self {
            workflow: Arc::new(workflow),
            history: Arc::new(InMemoryHistoryStore::new()),
            callbacks: Arc::new(InMemoryCallbackStore::new()),
            clock: Arc::new(SystemClock),
            invoker: Arc::new(LocalInvoker::new()),
            submitter: Arc::new(LoggingSubmitter),
            config: EngineConfig::default(),
            signals,
        }
    }

    /// Use `history` for step records and execution records
    pub fn with_history_store(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    /// Use `callbacks` for wait tokens
    pub fn with_callback_store(mut self, callbacks: Arc<dyn CallbackStore>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Use `clock` for timers and timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `invoker` for `ctx.invoke`
    pub fn with_invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = invoker;
        self
    }

    /// Use `submitter` to publish new callback ids
    pub fn with_submitter(mut self, submitter: Arc<dyn CallbackSubmitter>) -> Self {
        self.submitter = submitter;
        self
    }

    /// Replace the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Engine configuration in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start `execution_id` with `input`.
    ///
    /// Starting an id that already exists behaves like [`resume`](Self::resume)
    /// and keeps the original input.
    #[instrument(skip(self, input), fields(workflow = self.workflow.name()))]
    pub async fn start(&self, execution_id: &str, input: Value) -> Result<ExecutionOutcome> {
        if let Some(existing) = self.history.get_execution(execution_id).await? {
            if existing.input != input {
                warn!(execution_id, "execution exists, ignoring new input");
            }
            return self.drive(existing).await;
        }

        let record = ExecutionRecord::new(execution_id, input, self.clock.now());
        let record = self.history.create_execution(record).await?;
        info!(execution_id, "execution created");
        self.drive(record).await
    }

    /// Replay a non-terminal execution, or return the stored terminal outcome
    #[instrument(skip(self), fields(workflow = self.workflow.name()))]
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionOutcome> {
        let record = self
            .history
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| DurableError::NotFound(execution_id.to_string()))?;
        self.drive(record).await
    }

    /// Deliver `payload` to the callback wait registered under `callback_id`.
    ///
    /// `callback_id` is the execution-scoped id handed to the
    /// [`CallbackSubmitter`] (see [`callback_id`](crate::callback_id)), not the
    /// bare name the workflow passed to `wait_for_callback`.
    #[instrument(skip(self, payload))]
    pub async fn signal(&self, callback_id: &str, payload: Value) -> Result<SignalOutcome> {
        let outcome = self
            .callbacks
            .signal(callback_id, payload, self.clock.now())
            .await?;
        if let Some(execution_id) = outcome.execution_id() {
            info!(execution_id, callback_id, "callback signal accepted");
            self.signals.send_modify(|generation| *generation += 1);
        }
        Ok(outcome)
    }

    /// Start (or resume) and keep resuming until the execution is terminal.
    ///
    /// Between attempts the driver sleeps on the clock until the earliest
    /// wake time, or until an accepted [`signal`](Self::signal) arrives.
    /// Signals must come from another task holding the driver (e.g. an `Arc`).
    pub async fn run_to_completion(&self, execution_id: &str, input: Value) -> Result<ExecutionOutcome> {
        let mut signals = self.signals.subscribe();
        let mut outcome = self.start(execution_id, input).await?;

        loop {
            let suspension = match outcome {
                ExecutionOutcome::Suspended(suspension) => suspension,
                done => return Ok(done),
            };

            debug!(
                execution_id,
                wake_at = ?suspension.wake_at,
                callbacks = ?suspension.callbacks,
                "waiting before next attempt"
            );
            match suspension.wake_at {
                Some(wake_at) => {
                    tokio::select! {
                        _ = self.clock.sleep_until(wake_at) => {}
                        changed = signals.changed() => changed.map_err(|_| closed_channel())?,
                    }
                }
                None => signals.changed().await.map_err(|_| closed_channel())?,
            }
            outcome = self.resume(execution_id).await?;
        }
    }

    /// Execution record, if it exists
    pub async fn execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.history.get_execution(execution_id).await?)
    }

    /// Full history ordered by sequence
    pub async fn history(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        Ok(self.history.history(execution_id).await?)
    }

    /// History as an async stream ordered by sequence
    pub async fn history_stream(&self, execution_id: &str) -> Result<HistoryStream> {
        Ok(self.history.list(execution_id).await?)
    }

    async fn drive(&self, record: ExecutionRecord) -> Result<ExecutionOutcome> {
        if record.status.is_terminal() {
            debug!(
                execution_id = %record.execution_id,
                status = %record.status,
                "execution is terminal, returning stored outcome"
            );
            return self.stored_outcome(record).await;
        }
        self.run_attempt(record).await
    }

    async fn run_attempt(&self, mut record: ExecutionRecord) -> Result<ExecutionOutcome> {
        record.attempts += 1;
        record.status = ExecutionStatus::Running;
        record.updated_at = self.clock.now();
        self.history.update_execution(&record).await?;
        info!(
            execution_id = %record.execution_id,
            attempt = record.attempts,
            "running workflow"
        );

        let ctx = DurableContext::root(Arc::new(Runtime {
            execution_id: record.execution_id.clone(),
            history: Arc::clone(&self.history),
            callbacks: Arc::clone(&self.callbacks),
            clock: Arc::clone(&self.clock),
            invoker: Arc::clone(&self.invoker),
            submitter: Arc::clone(&self.submitter),
            config: self.config.clone(),
        }));

        let result = self.workflow.run(ctx, record.input.clone()).await;
        record.updated_at = self.clock.now();

        match result {
            Ok(value) => {
                record.status = ExecutionStatus::Completed;
                record.result = Some(value.clone());
                self.history.update_execution(&record).await?;
                info!(execution_id = %record.execution_id, attempts = record.attempts, "execution completed");
                Ok(ExecutionOutcome::Completed(value))
            }
            Err(DurableError::Suspended(suspension)) => {
                record.status = ExecutionStatus::Waiting;
                self.history.update_execution(&record).await?;
                info!(
                    execution_id = %record.execution_id,
                    wake_at = ?suspension.wake_at,
                    callbacks = ?suspension.callbacks,
                    "execution waiting"
                );
                Ok(ExecutionOutcome::Suspended(suspension))
            }
            Err(err) if err.is_fatal() => {
                error!(execution_id = %record.execution_id, error = %err, "fatal engine error");
                Err(err)
            }
            Err(err) => {
                let error = err.to_error_object();
                record.status = ExecutionStatus::Failed;
                record.error = Some(error.clone());
                self.history.update_execution(&record).await?;
                warn!(execution_id = %record.execution_id, error = %error, "execution failed");
                let history = self.history.history(&record.execution_id).await?;
                Ok(ExecutionOutcome::Failed { error, history })
            }
        }
    }

    async fn stored_outcome(&self, record: ExecutionRecord) -> Result<ExecutionOutcome> {
        match record.status {
            ExecutionStatus::Completed => Ok(ExecutionOutcome::Completed(
                record.result.unwrap_or(Value::Null),
            )),
            _ => {
                let history = self.history.history(&record.execution_id).await?;
                let error = record
                    .error
                    .unwrap_or_else(|| ErrorObject::new(kinds::OPERATION, "execution failed"));
                Ok(ExecutionOutcome::Failed { error, history })
            }
        }
    }
}

fn closed_channel() -> DurableError {
    DurableError::Fatal("signal channel closed".to_string())
}

impl fmt::Debug for ExecutionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionDriver")
            .field("workflow", &self.workflow.name())
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}
