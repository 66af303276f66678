//! Declarative state machine definitions
//!
//! The same primitives that workflow code calls on [`DurableContext`](crate::DurableContext)
//! can be lowered into a static, Amazon-States-Language style document. The
//! document shares the retry and catch contracts with the driver (error kinds,
//! `States.ALL`, exponential backoff) but is otherwise independent of it.
//!
//! ```text
//! primitive                       state
//! ─────────────────────────────   ──────────────────────────────────────
//! step(name)                      Task     Resource = <resource>
//! invoke(label, target)           Task     Resource = function:<target>
//! wait(duration)                  Wait     Seconds
//! wait_for_callback(id, timeout)  Task     Resource = <resource>.waitForTaskToken
//! map(label, items, f)            Map      ItemsPath, MaxConcurrency, Iterator
//! parallel(label, branches)       Parallel Branches
//! ```
//!
//! # Example
//!
//! ```rust
//! use durable_core::definition::{CatchRule, DefinitionBuilder, RetryRule};
//! use std::time::Duration;
//!
//! let definition = DefinitionBuilder::new()
//!     .comment("image pipeline")
//!     .step("Validate", "function:validate")
//!     .with_retry(RetryRule::new(["States.ALL"]).with_max_attempts(2))
//!     .with_catch(CatchRule::new(["States.ALL"], "Rejected"))
//!     .wait("Cooldown", Duration::from_secs(30))
//!     .wait_for_callback("Approval", "queue:approvals", Some(Duration::from_secs(3600)))
//!     .fail_detached("Rejected", "ValidationFailed", "image rejected")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(definition.start_at, "Validate");
//! assert_eq!(definition.catch_target("Validate", "Anything"), Some("Rejected"));
//! ```

use crate::error::{kinds, DurableError, Result};
use crate::invoke::FunctionRef;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Suffix marking a Task that waits for an external callback
pub const WAIT_FOR_TASK_TOKEN: &str = ".waitForTaskToken";

fn default_interval() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A complete state machine (also used for Parallel branches and Map iterators)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachineDefinition {
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Name of the first state
    pub start_at: String,
    /// States by name
    pub states: BTreeMap<String, State>,
    /// Overall execution timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// One state, tagged by `Type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum State {
    /// Checkpointed step, invoke or callback wait
    Task(TaskState),
    /// Timed wait
    Wait(WaitState),
    /// Fixed set of concurrent branches
    Parallel(ParallelState),
    /// One iterator run per input item
    Map(MapState),
    /// Successful end
    Succeed(SucceedState),
    /// Failed end
    Fail(FailState),
}

/// Task state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    /// What to run
    pub resource: String,
    /// Static input merged into the task payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Bound for callback tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Retry rules, tried in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<RetryRule>,
    /// Catch rules, tried in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,
    /// Next state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Whether this state ends the machine
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

impl TaskState {
    /// Whether the task suspends on an external callback
    pub fn waits_for_callback(&self) -> bool {
        self.resource.ends_with(WAIT_FOR_TASK_TOKEN)
    }
}

/// Wait state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitState {
    /// Relative wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    /// Absolute wait (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Next state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Whether this state ends the machine
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Parallel state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelState {
    /// Branch machines
    pub branches: Vec<StateMachineDefinition>,
    /// Retry rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<RetryRule>,
    /// Catch rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,
    /// Next state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Whether this state ends the machine
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Map state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapState {
    /// Path of the input array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_path: Option<String>,
    /// Concurrency bound; absent means the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Machine run for every item
    pub iterator: Box<StateMachineDefinition>,
    /// Retry rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<RetryRule>,
    /// Catch rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,
    /// Next state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Whether this state ends the machine
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Succeed state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SucceedState {
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Fail state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    /// Error kind reported by the execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human readable cause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// `Retry` entry of a Task, Parallel or Map state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryRule {
    /// Error kinds this rule applies to (`States.ALL` matches any)
    pub error_equals: Vec<String>,
    /// Delay before the first retry
    #[serde(default = "default_interval")]
    pub interval_seconds: f64,
    /// Retries after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay multiplier per retry
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    /// Upper bound on a single delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<f64>,
}

impl RetryRule {
    /// Rule for `kinds` with the standard defaults
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            error_equals: kinds.into_iter().map(Into::into).collect(),
            interval_seconds: default_interval(),
            max_attempts: default_max_attempts(),
            backoff_rate: default_backoff_rate(),
            max_delay_seconds: None,
        }
    }

    /// Set the retry count
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first delay
    pub fn with_interval(mut self, seconds: f64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_rate(mut self, rate: f64) -> Self {
        self.backoff_rate = rate;
        self
    }

    /// Equivalent runtime policy
    pub fn to_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_attempts)
            .with_error_kinds(self.error_equals.iter().cloned())
            .with_interval(self.interval_seconds)
            .with_backoff_rate(self.backoff_rate);
        match self.max_delay_seconds {
            Some(max) => policy.with_max_interval(max),
            None => policy,
        }
    }
}

/// `Catch` entry: route matching errors to another state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatchRule {
    /// Error kinds this rule applies to (`States.ALL` matches any)
    pub error_equals: Vec<String>,
    /// State to continue with
    pub next: String,
    /// Where the error object is placed in the state input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

impl CatchRule {
    /// Route `kinds` to `next`
    pub fn new<I, S>(kinds: I, next: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            error_equals: kinds.into_iter().map(Into::into).collect(),
            next: next.into(),
            result_path: None,
        }
    }

    /// Whether this rule catches `kind`
    pub fn matches(&self, kind: &str) -> bool {
        self.error_equals
            .iter()
            .any(|k| k == kind || k == kinds::ALL)
    }
}

/// A problem found by [`StateMachineDefinition::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Path of the offending state (`Parallel[0].Inner`), if any
    pub state: Option<String>,
    /// What is wrong
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => write!(f, "{}: {}", state, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl State {
    /// Type name as written in the document
    pub fn type_name(&self) -> &'static str {
        match self {
            State::Task(_) => "Task",
            State::Wait(_) => "Wait",
            State::Parallel(_) => "Parallel",
            State::Map(_) => "Map",
            State::Succeed(_) => "Succeed",
            State::Fail(_) => "Fail",
        }
    }

    /// `Next` target
    pub fn next(&self) -> Option<&str> {
        match self {
            State::Task(s) => s.next.as_deref(),
            State::Wait(s) => s.next.as_deref(),
            State::Parallel(s) => s.next.as_deref(),
            State::Map(s) => s.next.as_deref(),
            State::Succeed(_) | State::Fail(_) => None,
        }
    }

    /// Whether execution stops after this state
    pub fn is_terminal(&self) -> bool {
        match self {
            State::Task(s) => s.end,
            State::Wait(s) => s.end,
            State::Parallel(s) => s.end,
            State::Map(s) => s.end,
            State::Succeed(_) | State::Fail(_) => true,
        }
    }

    /// Retry rules (empty for states that cannot retry)
    pub fn retry(&self) -> &[RetryRule] {
        match self {
            State::Task(s) => &s.retry,
            State::Parallel(s) => &s.retry,
            State::Map(s) => &s.retry,
            _ => &[],
        }
    }

    /// Catch rules (empty for states that cannot catch)
    pub fn catch(&self) -> &[CatchRule] {
        match self {
            State::Task(s) => &s.catch,
            State::Parallel(s) => &s.catch,
            State::Map(s) => &s.catch,
            _ => &[],
        }
    }

    fn retry_mut(&mut self) -> Option<&mut Vec<RetryRule>> {
        match self {
            State::Task(s) => Some(&mut s.retry),
            State::Parallel(s) => Some(&mut s.retry),
            State::Map(s) => Some(&mut s.retry),
            _ => None,
        }
    }

    fn catch_mut(&mut self) -> Option<&mut Vec<CatchRule>> {
        match self {
            State::Task(s) => Some(&mut s.catch),
            State::Parallel(s) => Some(&mut s.catch),
            State::Map(s) => Some(&mut s.catch),
            _ => None,
        }
    }

    /// Point this state at `next`; terminal states are left alone
    fn link(&mut self, next: Option<String>) {
        let end = next.is_none();
        let (slot, flag) = match self {
            State::Task(s) => (&mut s.next, &mut s.end),
            State::Wait(s) => (&mut s.next, &mut s.end),
            State::Parallel(s) => (&mut s.next, &mut s.end),
            State::Map(s) => (&mut s.next, &mut s.end),
            State::Succeed(_) | State::Fail(_) => return,
        };
        *slot = next;
        *flag = end;
    }
}

impl StateMachineDefinition {
    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Pretty JSON document
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// YAML document
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// State by name
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    /// Where an error of `kind` raised in `state` is routed, if any catch rule matches
    pub fn catch_target(&self, state: &str, kind: &str) -> Option<&str> {
        self.states
            .get(state)?
            .catch()
            .iter()
            .find(|rule| rule.matches(kind))
            .map(|rule| rule.next.as_str())
    }

    /// Runtime retry policy for an error of `kind` raised in `state`
    pub fn retry_policy(&self, state: &str, kind: &str) -> Option<RetryPolicy> {
        self.states
            .get(state)?
            .retry()
            .iter()
            .map(RetryRule::to_policy)
            .find(|policy| policy.matches(kind))
    }

    /// Every structural problem in this machine and its nested machines
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.collect_issues("", &mut issues);
        issues
    }

    /// Fail with [`DurableError::Validation`] if [`validate`](Self::validate) finds anything
    pub fn ensure_valid(&self) -> Result<()> {
        let issues = self.validate();
        if issues.is_empty() {
            return Ok(());
        }
        let messages: Vec<String> = issues.iter().map(ToString::to_string).collect();
        Err(DurableError::Validation(messages.join("; ")))
    }

    fn collect_issues(&self, prefix: &str, issues: &mut Vec<ValidationIssue>) {
        let path = |name: &str| format!("{}{}", prefix, name);
        let mut issue = |state: Option<String>, message: String| {
            issues.push(ValidationIssue { state, message });
        };

        if self.states.is_empty() {
            issue(
                (!prefix.is_empty()).then(|| prefix.trim_end_matches('.').to_string()),
                "state machine has no states".to_string(),
            );
            return;
        }
        if !self.states.contains_key(&self.start_at) {
            issue(None, format!("StartAt '{}' is not a state", self.start_at));
        }

        let mut nested = Vec::new();
        for (name, state) in &self.states {
            let here = Some(path(name));
            match state.next() {
                Some(next) if !self.states.contains_key(next) => {
                    issue(here.clone(), format!("Next '{}' is not a state", next));
                }
                Some(_) if state.is_terminal() => {
                    issue(here.clone(), "state has both Next and End".to_string());
                }
                None if !state.is_terminal() => {
                    issue(here.clone(), "state has neither Next nor End".to_string());
                }
                _ => {}
            }

            for rule in state.catch() {
                if !self.states.contains_key(&rule.next) {
                    issue(here.clone(), format!("Catch target '{}' is not a state", rule.next));
                }
                if rule.error_equals.is_empty() {
                    issue(here.clone(), "Catch rule has empty ErrorEquals".to_string());
                }
            }
            for rule in state.retry() {
                if rule.error_equals.is_empty() {
                    issue(here.clone(), "Retry rule has empty ErrorEquals".to_string());
                }
                if rule.backoff_rate < 1.0 {
                    issue(here.clone(), format!("BackoffRate {} is below 1.0", rule.backoff_rate));
                }
                if rule.interval_seconds < 0.0 {
                    issue(here.clone(), "IntervalSeconds is negative".to_string());
                }
            }

            match state {
                State::Wait(wait) if wait.seconds.is_none() == wait.timestamp.is_none() => {
                    issue(here.clone(), "Wait needs exactly one of Seconds or Timestamp".to_string());
                }
                State::Task(task) if task.resource.is_empty() => {
                    issue(here.clone(), "Task has an empty Resource".to_string());
                }
                State::Parallel(parallel) => {
                    if parallel.branches.is_empty() {
                        issue(here.clone(), "Parallel has no branches".to_string());
                    }
                    for (i, branch) in parallel.branches.iter().enumerate() {
                        nested.push((format!("{}[{}].", path(name), i), branch));
                    }
                }
                State::Map(map) => {
                    if map.max_concurrency == Some(0) {
                        issue(here.clone(), "MaxConcurrency must be at least 1".to_string());
                    }
                    nested.push((format!("{}.", path(name)), map.iterator.as_ref()));
                }
                _ => {}
            }
        }

        if !self.states.values().any(State::is_terminal) {
            issue(None, "no state ends the machine".to_string());
        }
        for name in self.unreachable_states() {
            issue(Some(path(&name)), "state is unreachable".to_string());
        }

        for (prefix, machine) in nested {
            machine.collect_issues(&prefix, issues);
        }
    }

    fn unreachable_states(&self) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        if self.states.contains_key(&self.start_at) {
            queue.push_back(&self.start_at);
        }
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            let Some(state) = self.states.get(name) else {
                continue;
            };
            queue.extend(state.next());
            queue.extend(state.catch().iter().map(|rule| rule.next.as_str()));
        }
        self.states
            .keys()
            .filter(|name| !seen.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Builds a [`StateMachineDefinition`] from a sequence of primitives.
///
/// Chained states are linked in call order with `Next`; the last one gets
/// `End`. Detached states (catch targets) are added without linking.
#[derive(Debug, Clone, Default)]
pub struct DefinitionBuilder {
    comment: Option<String>,
    timeout_seconds: Option<u64>,
    chain: Vec<(String, State)>,
    detached: Vec<(String, State)>,
}

impl DefinitionBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the document comment
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set the overall execution timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs());
        self
    }

    fn push(mut self, name: impl Into<String>, state: State) -> Self {
        self.chain.push((name.into(), state));
        self
    }

    fn task(resource: String, timeout_seconds: Option<u64>) -> State {
        State::Task(TaskState {
            resource,
            parameters: None,
            timeout_seconds,
            retry: Vec::new(),
            catch: Vec::new(),
            next: None,
            end: false,
        })
    }

    /// Checkpointed step running `resource`
    pub fn step(self, name: impl Into<String>, resource: impl Into<String>) -> Self {
        self.push(name, Self::task(resource.into(), None))
    }

    /// Invoke of another function
    pub fn invoke(self, label: impl Into<String>, target: &FunctionRef) -> Self {
        self.push(label, Self::task(format!("function:{}", target), None))
    }

    /// Timed wait
    pub fn wait(self, name: impl Into<String>, duration: Duration) -> Self {
        self.push(
            name,
            State::Wait(WaitState {
                seconds: Some(duration.as_secs()),
                timestamp: None,
                next: None,
                end: false,
            }),
        )
    }

    /// Callback wait on `resource`, optionally bounded
    pub fn wait_for_callback(
        self,
        name: impl Into<String>,
        resource: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        let resource = format!("{}{}", resource.into(), WAIT_FOR_TASK_TOKEN);
        self.push(name, Self::task(resource, timeout.map(|t| t.as_secs())))
    }

    /// Map over `items_path` with `iterator`
    pub fn map(
        self,
        label: impl Into<String>,
        items_path: impl Into<String>,
        max_concurrency: Option<usize>,
        iterator: StateMachineDefinition,
    ) -> Self {
        self.push(
            label,
            State::Map(MapState {
                items_path: Some(items_path.into()),
                max_concurrency,
                iterator: Box::new(iterator),
                retry: Vec::new(),
                catch: Vec::new(),
                next: None,
                end: false,
            }),
        )
    }

    /// Run `branches` concurrently
    pub fn parallel(self, label: impl Into<String>, branches: Vec<StateMachineDefinition>) -> Self {
        self.push(
            label,
            State::Parallel(ParallelState {
                branches,
                retry: Vec::new(),
                catch: Vec::new(),
                next: None,
                end: false,
            }),
        )
    }

    /// Successful end of the chain
    pub fn succeed(self, name: impl Into<String>) -> Self {
        self.push(name, State::Succeed(SucceedState::default()))
    }

    /// Add a state outside the chain (e.g. a catch target)
    pub fn detached(mut self, name: impl Into<String>, state: State) -> Self {
        self.detached.push((name.into(), state));
        self
    }

    /// Add a detached Fail state
    pub fn fail_detached(
        self,
        name: impl Into<String>,
        error: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        self.detached(
            name,
            State::Fail(FailState {
                error: Some(error.into()),
                cause: Some(cause.into()),
            }),
        )
    }

    /// Attach a retry rule to the most recent chained state
    pub fn with_retry(mut self, rule: RetryRule) -> Self {
        if let Some(rules) = self.chain.last_mut().and_then(|(_, s)| s.retry_mut()) {
            rules.push(rule);
        }
        self
    }

    /// Attach a catch rule to the most recent chained state
    pub fn with_catch(mut self, rule: CatchRule) -> Self {
        if let Some(rules) = self.chain.last_mut().and_then(|(_, s)| s.catch_mut()) {
            rules.push(rule);
        }
        self
    }

    /// Link the chain and validate the result
    pub fn build(self) -> Result<StateMachineDefinition> {
        let Some((start_at, _)) = self.chain.first() else {
            return Err(DurableError::Validation("definition has no states".to_string()));
        };
        let start_at = start_at.clone();

        let names: Vec<String> = self.chain.iter().map(|(name, _)| name.clone()).collect();
        let mut states = BTreeMap::new();
        for (i, (name, mut state)) in self.chain.into_iter().enumerate() {
            state.link(names.get(i + 1).cloned());
            if states.insert(name.clone(), state).is_some() {
                return Err(DurableError::Validation(format!("state '{}' defined twice", name)));
            }
        }
        for (name, state) in self.detached {
            if states.insert(name.clone(), state).is_some() {
                return Err(DurableError::Validation(format!("state '{}' defined twice", name)));
            }
        }

        let definition = StateMachineDefinition {
            comment: self.comment,
            start_at,
            states,
            timeout_seconds: self.timeout_seconds,
        };
        definition.ensure_valid()?;
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_step(name: &str) -> StateMachineDefinition {
        DefinitionBuilder::new()
            .step(name, format!("function:{}", name.to_lowercase()))
            .build()
            .unwrap()
    }

    fn pipeline() -> StateMachineDefinition {
        DefinitionBuilder::new()
            .comment("images")
            .step("Validate", "function:validate")
            .with_retry(RetryRule::new(["Throttled"]).with_interval(2.0).with_max_attempts(4))
            .with_catch(CatchRule::new(["ValidationError"], "Rejected"))
            .map("Resize", "$.images", Some(2), single_step("Scale"))
            .parallel("Checks", vec![single_step("Nsfw"), single_step("Faces")])
            .invoke("Recognize", &FunctionRef::new("recognize").with_qualifier("live"))
            .wait("Cooldown", Duration::from_secs(30))
            .wait_for_callback("Approval", "queue:approvals", Some(Duration::from_secs(600)))
            .succeed("Done")
            .fail_detached("Rejected", "Rejected", "validation failed")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_links_chain() {
        let definition = pipeline();
        assert_eq!(definition.start_at, "Validate");
        assert_eq!(definition.state("Validate").unwrap().next(), Some("Resize"));
        assert_eq!(definition.state("Approval").unwrap().next(), Some("Done"));
        assert!(definition.state("Done").unwrap().is_terminal());

        match definition.state("Approval").unwrap() {
            State::Task(task) => {
                assert!(task.waits_for_callback());
                assert_eq!(task.timeout_seconds, Some(600));
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        match definition.state("Recognize").unwrap() {
            State::Task(task) => assert_eq!(task.resource, "function:recognize:live"),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_json_uses_pascal_case() {
        let json = pipeline().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["StartAt"], "Validate");
        assert_eq!(value["States"]["Validate"]["Type"], "Task");
        assert_eq!(value["States"]["Validate"]["Retry"][0]["ErrorEquals"][0], "Throttled");
        assert_eq!(value["States"]["Validate"]["Catch"][0]["Next"], "Rejected");
        assert_eq!(value["States"]["Resize"]["MaxConcurrency"], 2);
        assert_eq!(value["States"]["Done"]["Type"], "Succeed");
    }

    #[test]
    fn test_json_and_yaml_round_trip() {
        let definition = pipeline();
        let from_json = StateMachineDefinition::from_json(&definition.to_json().unwrap()).unwrap();
        assert_eq!(from_json, definition);
        let from_yaml = StateMachineDefinition::from_yaml(&definition.to_yaml().unwrap()).unwrap();
        assert_eq!(from_yaml, definition);
    }

    #[test]
    fn test_parse_handwritten_document() {
        let definition = StateMachineDefinition::from_json(
            r#"{
                "StartAt": "Charge",
                "States": {
                    "Charge": {
                        "Type": "Task",
                        "Resource": "function:charge",
                        "Retry": [{"ErrorEquals": ["States.ALL"], "MaxAttempts": 2}],
                        "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Refund"}],
                        "End": true
                    },
                    "Refund": {"Type": "Task", "Resource": "function:refund", "End": true}
                }
            }"#,
        )
        .unwrap();

        assert!(definition.validate().is_empty());
        assert_eq!(definition.catch_target("Charge", "Declined"), Some("Refund"));
        assert_eq!(definition.catch_target("Refund", "Declined"), None);

        let policy = definition.retry_policy("Charge", "Declined").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.interval_seconds, 1.0);
        assert_eq!(policy.backoff_rate, 2.0);
    }

    #[test]
    fn test_validation_reports_structural_problems() {
        let mut states = BTreeMap::new();
        states.insert(
            "A".to_string(),
            State::Task(TaskState {
                resource: "function:a".into(),
                parameters: None,
                timeout_seconds: None,
                retry: vec![RetryRule::new(["X"]).with_backoff_rate(0.5)],
                catch: vec![CatchRule::new(["X"], "Missing")],
                next: Some("Nowhere".into()),
                end: false,
            }),
        );
        states.insert(
            "P".to_string(),
            State::Parallel(ParallelState {
                branches: Vec::new(),
                retry: Vec::new(),
                catch: Vec::new(),
                next: None,
                end: false,
            }),
        );
        let definition = StateMachineDefinition {
            comment: None,
            start_at: "Start".into(),
            states,
            timeout_seconds: None,
        };

        let messages: Vec<String> = definition.validate().iter().map(ToString::to_string).collect();
        let has = |needle: &str| messages.iter().any(|m| m.contains(needle));
        assert!(has("StartAt 'Start' is not a state"));
        assert!(has("A: Next 'Nowhere' is not a state"));
        assert!(has("Catch target 'Missing'"));
        assert!(has("BackoffRate 0.5"));
        assert!(has("P: Parallel has no branches"));
        assert!(has("P: state has neither Next nor End"));
        assert!(has("no state ends the machine"));
        assert!(definition.ensure_valid().is_err());
    }

    #[test]
    fn test_nested_machine_issues_are_prefixed() {
        let mut broken = single_step("Scale");
        broken.start_at = "Missing".into();

        let err = DefinitionBuilder::new()
            .map("Resize", "$.images", Some(0), broken)
            .build()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Resize: MaxConcurrency must be at least 1"));
        assert!(message.contains("StartAt 'Missing' is not a state"));
    }

    #[test]
    fn test_unreachable_state_is_reported() {
        let err = DefinitionBuilder::new()
            .step("A", "function:a")
            .detached("Orphan", State::Succeed(SucceedState::default()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Orphan: state is unreachable"));
    }

    #[test]
    fn test_builder_rejects_empty_and_duplicates() {
        assert!(DefinitionBuilder::new().build().is_err());
        let err = DefinitionBuilder::new()
            .step("A", "function:a")
            .step("A", "function:b")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_retry_rule_to_policy() {
        let mut rule = RetryRule::new(["Throttled"]).with_interval(2.0).with_backoff_rate(3.0);
        rule.max_delay_seconds = Some(10.0);
        let policy = rule.to_policy();
        assert!(policy.matches("Throttled"));
        assert!(!policy.matches("Other"));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(6));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(10));
    }
}
