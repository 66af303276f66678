//! # durable-core - Checkpointed Durable Workflows
//!
//! **Write long-running workflows as ordinary async Rust.** Every side effect
//! goes through a [`DurableContext`] primitive whose outcome is checkpointed in
//! a history store. When the process restarts, or a wait elapses, the
//! [`ExecutionDriver`] replays the workflow from the top: completed steps
//! return their recorded result instantly and execution continues where it
//! left off.
//!
//! ## Overview
//!
//! - **Steps** - [`DurableContext::step`] runs an operation at most once per
//!   execution, with optional [`RetryPolicy`]
//! - **Waits** - [`wait`](DurableContext::wait) on a timer,
//!   [`wait_for_callback`](DurableContext::wait_for_callback) on an external
//!   signal, [`wait_for_condition`](DurableContext::wait_for_condition) to poll
//! - **Fan-out** - [`map`](DurableContext::map) and
//!   [`parallel`](DurableContext::parallel) with bounded concurrency
//! - **Child contexts** - [`run_in_child_context`](DurableContext::run_in_child_context)
//!   for isolated sub-workflows
//! - **Invoke** - [`invoke`](DurableContext::invoke) other functions as one step
//! - **Declarative** - lower the same primitives into a
//!   [`StateMachineDefinition`](definition::StateMachineDefinition)
//!
//! ## Replay Model
//!
//! ```text
//! attempt 1:  step a ─→ run, record      wait 1h ─→ record resumeAt, SUSPEND
//! attempt 2:  step a ─→ replay            wait 1h ─→ elapsed, record resumed
//!             step b ─→ run, record       return  ─→ completed
//! ```
//!
//! Workflow code must be deterministic between primitives and must call them
//! in the same order with the same names on every attempt. Step names are
//! unique per namespace.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use durable_core::{workflow_fn, ExecutionDriver, ExecutionOutcome};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> durable_core::Result<()> {
//!     let driver = ExecutionDriver::new(workflow_fn("greeting", |ctx, input| async move {
//!         let name: String = ctx
//!             .step("lookup", || async { Ok("world".to_string()) })
//!             .await?;
//!         ctx.wait(Duration::from_secs(1)).await?;
//!         Ok(json!({ "greeting": format!("hello {}", name), "input": input }))
//!     }));
//!
//!     match driver.run_to_completion("greeting-1", json!({})).await? {
//!         ExecutionOutcome::Completed(value) => println!("{}", value),
//!         other => println!("{:?}", other),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig`] is read from TOML with `${VAR:default}` expansion; see
//! [`config`] for the sections and defaults, and [`init_tracing`] for log setup.

pub mod child;
pub mod clock;
pub mod config;
pub mod context;
pub mod definition;
pub mod driver;
pub mod error;
pub mod fanout;
pub mod invoke;
pub mod retry;
pub mod step;
pub mod submitter;
pub mod wait;
pub mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    expand_env_vars, init_tracing, EngineConfig, ExecutionConfig, LogFormat, LoggingConfig,
    RetryConfig,
};
pub use context::DurableContext;
pub use driver::{ExecutionDriver, ExecutionOutcome};
pub use error::{kinds, BranchFailure, DurableError, Result, Suspension};
pub use fanout::{branch, Branch, BranchOutcome, MapConfig};
pub use invoke::{FunctionRef, Invoker, LocalInvoker};
pub use retry::{RetryPolicy, RetryState, MAX_RETRY_DELAY_SECONDS};
pub use step::StepConfig;
pub use submitter::{CallbackRequest, CallbackSubmitter, LoggingSubmitter, RecordingSubmitter};
pub use wait::{callback_id, CallbackOutcome, ConditionConfig, WaitDecision};
pub use workflow::{workflow_fn, FnWorkflow, Workflow};

pub use durable_checkpoint::{
    ErrorObject, ExecutionRecord, ExecutionStatus, Namespace, SignalOutcome, StepRecord,
    StepStatus,
};
