//! Tool execution coordinator
//!
//! Runs model-requested tool calls as tasks: permission-checked, ordered by
//! priority and declared dependencies, retried with capped exponential
//! backoff, and bounded by a strict concurrency limit.
//!
//! Validation and the permission decision happen before a task takes a
//! worker slot, so a denied call never enters `Running`. Calls that need
//! approval wait outside the worker pool and are put to the approver one at
//! a time.
//!
//! Tasks can be submitted while [`ToolExecutionCoordinator::run`] is already
//! driving dispatch (streaming mode). `run` returns once [`close`] has been
//! called and every task has settled.
//!
//! [`close`]: ToolExecutionCoordinator::close

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tern_ai::{ContentBlock, ToolCallRequest};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::events::{EngineEvent, EventSink};
use crate::permission::{
    ArgumentSignature, PermissionBehavior, PermissionRuleValue, PermissionStore, PermissionUpdate, RuleSource,
    validate_rule,
};
use crate::retry::RetryConfig;
use crate::tool::{BoxedTool, ProgressSender, ToolContext, ToolError, ToolRegistry};

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, waiting on dependencies
    Pending,
    /// Eligible, waiting for a worker slot
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_concurrency: usize,
    /// Backoff for tool calls that throw
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryConfig::for_tools(),
        }
    }
}

/// A call waiting on a human (or policy) decision
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    /// Why approval is needed
    pub reason: String,
    /// The rule that "always allow" would add
    pub suggested_rule: PermissionRuleValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    /// Allow and remember for the rest of the session
    AllowAlways,
    Deny { reason: String },
}

/// External approval collaborator for `ask` decisions
#[async_trait]
pub trait Approver: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Final result of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub tool_use_id: String,
    pub name: String,
    pub state: TaskState,
    pub attempts: u32,
    /// Always a `ContentBlock::ToolResult`
    pub result: ContentBlock,
}

impl TaskOutcome {
    fn new(request: &ToolCallRequest, state: TaskState, attempts: u32, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_use_id: request.id.clone(),
            name: request.name.clone(),
            state,
            attempts,
            result: ContentBlock::tool_result(request.id.clone(), content, is_error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.is_error_result()
    }
}

/// Read access to a submitted task
#[derive(Clone)]
pub struct TaskHandle {
    id: String,
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        self.shared
            .inner
            .lock()
            .records
            .get(&self.id)
            .map(|r| r.state)
            .unwrap_or(TaskState::Failed)
    }

    pub fn attempts(&self) -> u32 {
        self.shared.inner.lock().records.get(&self.id).map(|r| r.attempts).unwrap_or(0)
    }
}

struct TaskRecord {
    name: String,
    state: TaskState,
    attempts: u32,
}

/// Admission progress of an eligible task
enum Gate {
    /// Not validated or permission-checked yet
    Unchecked,
    /// Needs approval; waiting its turn with the approver
    Asking { tool: BoxedTool, reason: String },
    /// The approver is deciding
    Approving(BoxedTool),
    /// May take a worker slot
    Cleared(BoxedTool),
}

struct QueuedTask {
    request: ToolCallRequest,
    priority: i32,
    depends_on: Vec<String>,
    seq: u64,
    gate: Gate,
}

/// Approval verdict for one task
type Verdict = (String, Result<(), String>);

#[derive(Default)]
struct Inner {
    /// Not yet dispatched
    waiting: Vec<QueuedTask>,
    records: HashMap<String, TaskRecord>,
    /// Submission order
    order: Vec<String>,
    outcomes: HashMap<String, TaskOutcome>,
    closed: bool,
    next_seq: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    events: EventSink,
}

impl Shared {
    fn set_state(&self, id: &str, state: TaskState) {
        let update = {
            let mut inner = self.inner.lock();
            inner.records.get_mut(id).map(|record| {
                record.state = state;
                (record.name.clone(), record.attempts)
            })
        };
        if let Some((tool_name, attempts)) = update {
            tracing::debug!(tool_use_id = id, tool = %tool_name, ?state, attempts, "Task state changed");
            self.events.emit(EngineEvent::TaskStateChanged {
                tool_use_id: id.to_string(),
                tool_name,
                state,
                attempts,
            });
        }
    }

    fn set_attempts(&self, id: &str, attempts: u32) {
        if let Some(record) = self.inner.lock().records.get_mut(id) {
            record.attempts = attempts;
        }
    }

    fn finish(&self, outcome: TaskOutcome) {
        self.set_attempts(&outcome.tool_use_id, outcome.attempts);
        self.set_state(&outcome.tool_use_id, outcome.state);
        if let ContentBlock::ToolResult { content, is_error, .. } = &outcome.result {
            self.events.emit(EngineEvent::ToolCompleted {
                tool_use_id: outcome.tool_use_id.clone(),
                tool_name: outcome.name.clone(),
                content: content.clone(),
                is_error: *is_error,
            });
        }
        self.inner.lock().outcomes.insert(outcome.tool_use_id.clone(), outcome);
    }
}

/// Everything a worker needs, owned so it can be spawned
#[derive(Clone)]
struct Worker {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionStore>,
    approver: Option<Arc<dyn Approver>>,
    retry: RetryConfig,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

/// Dependency-aware, permission-gated scheduler for tool calls
pub struct ToolExecutionCoordinator {
    config: CoordinatorConfig,
    worker: Worker,
}

impl ToolExecutionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionStore>,
        events: EventSink,
    ) -> Self {
        Self {
            worker: Worker {
                registry,
                permissions,
                approver: None,
                retry: config.retry.clone(),
                cancel: CancellationToken::new(),
                shared: Arc::new(Shared {
                    inner: Mutex::new(Inner::default()),
                    wake: Notify::new(),
                    events,
                }),
            },
            config,
        }
    }

    pub fn with_approver(mut self, approver: Option<Arc<dyn Approver>>) -> Self {
        self.worker.approver = approver;
        self
    }

    /// Use an external cancellation token (e.g. a child of the turn's token)
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.worker.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.worker.cancel.clone()
    }

    /// Cancel every queued and running task
    pub fn cancel_all(&self) {
        self.worker.cancel.cancel();
    }

    /// Submit with default priority and no dependencies
    pub fn submit(&self, request: ToolCallRequest) -> TaskHandle {
        self.submit_with(request, 0, Vec::new())
    }

    /// Submit with an explicit priority (higher runs first) and dependencies
    pub fn submit_with(&self, request: ToolCallRequest, priority: i32, depends_on: Vec<String>) -> TaskHandle {
        let shared = &self.worker.shared;
        let id = request.id.clone();
        let accepted = {
            let mut inner = shared.inner.lock();
            if inner.records.contains_key(&id) {
                false
            } else {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.records.insert(
                    id.clone(),
                    TaskRecord {
                        name: request.name.clone(),
                        state: TaskState::Pending,
                        attempts: 0,
                    },
                );
                inner.order.push(id.clone());
                inner.waiting.push(QueuedTask {
                    request,
                    priority,
                    depends_on,
                    seq,
                    gate: Gate::Unchecked,
                });
                true
            }
        };

        if accepted {
            shared.set_state(&id, TaskState::Pending);
            shared.wake.notify_one();
        } else {
            tracing::warn!(tool_use_id = %id, "Ignoring duplicate task submission");
        }

        TaskHandle {
            id,
            shared: Arc::clone(shared),
        }
    }

    /// No more submissions; `run` returns once everything settles
    pub fn close(&self) {
        self.worker.shared.inner.lock().closed = true;
        self.worker.shared.wake.notify_one();
    }

    /// Batch mode: close, then run to completion
    pub async fn schedule(&self) -> Vec<TaskOutcome> {
        self.close();
        self.run().await
    }

    /// Drive dispatch until closed and settled. Outcomes are in submission order.
    pub async fn run(&self) -> Vec<TaskOutcome> {
        let shared = Arc::clone(&self.worker.shared);
        let max_concurrency = self.config.max_concurrency.max(1);
        let mut workers: JoinSet<TaskOutcome> = JoinSet::new();
        let mut approvals: JoinSet<Verdict> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, ToolCallRequest> = HashMap::new();

        loop {
            if self.worker.cancel.is_cancelled() {
                self.cancel_waiting();
                approvals.shutdown().await;
                while let Some(joined) = workers.join_next_with_id().await {
                    self.record_joined(joined, &mut running);
                }
                break;
            }

            let mut progressed = self.resolve_dependencies();
            progressed |= self.admit();
            if approvals.is_empty() {
                self.start_approval(&mut approvals);
            }

            while workers.len() < max_concurrency {
                let Some((request, tool)) = self.pop_ready() else {
                    break;
                };
                shared.set_state(&request.id, TaskState::Running);
                let worker = self.worker.clone();
                let dispatched = request.clone();
                let handle = workers.spawn(async move { worker.execute(dispatched, tool).await });
                running.insert(handle.id(), request);
            }

            if workers.is_empty() && approvals.is_empty() {
                let (closed, waiting) = {
                    let inner = shared.inner.lock();
                    (inner.closed, inner.waiting.len())
                };
                if closed {
                    if waiting == 0 {
                        break;
                    }
                    if !progressed {
                        self.fail_unreachable();
                    }
                    continue;
                }
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = self.worker.cancel.cancelled() => {}
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = self.worker.cancel.cancelled() => {}
                Some(joined) = workers.join_next_with_id() => {
                    self.record_joined(joined, &mut running);
                }
                Some(verdict) = approvals.join_next() => {
                    self.record_verdict(verdict);
                }
                _ = shared.wake.notified() => {}
            }
        }

        let mut inner = shared.inner.lock();
        let order = inner.order.clone();
        order
            .iter()
            .filter_map(|id| inner.outcomes.remove(id))
            .collect()
    }

    /// Validate and permission-check tasks that just became eligible.
    /// Returns whether any task was rejected.
    fn admit(&self) -> bool {
        let shared = &self.worker.shared;
        let eligible: Vec<ToolCallRequest> = {
            let inner = shared.inner.lock();
            inner
                .waiting
                .iter()
                .filter(|t| matches!(t.gate, Gate::Unchecked))
                .filter(|t| inner.records.get(&t.request.id).map(|r| r.state) == Some(TaskState::Queued))
                .map(|t| t.request.clone())
                .collect()
        };

        let mut rejected = false;
        for request in eligible {
            match self.worker.gate(&request) {
                Ok(gate) => {
                    let mut inner = shared.inner.lock();
                    if let Some(task) = inner.waiting.iter_mut().find(|t| t.request.id == request.id) {
                        task.gate = gate;
                    }
                }
                Err(outcome) => {
                    self.take_waiting(&request.id);
                    shared.finish(outcome);
                    rejected = true;
                }
            }
        }
        rejected
    }

    /// Put the earliest task that needs approval to the approver
    fn start_approval(&self, approvals: &mut JoinSet<Verdict>) {
        let next = {
            let mut inner = self.worker.shared.inner.lock();
            inner
                .waiting
                .iter_mut()
                .filter(|t| matches!(t.gate, Gate::Asking { .. }))
                .min_by_key(|t| t.seq)
                .and_then(|task| match std::mem::replace(&mut task.gate, Gate::Unchecked) {
                    Gate::Asking { tool, reason } => {
                        task.gate = Gate::Approving(tool);
                        Some((task.request.clone(), reason))
                    }
                    other => {
                        task.gate = other;
                        None
                    }
                })
        };
        if let Some((request, reason)) = next {
            let worker = self.worker.clone();
            approvals.spawn(async move {
                let verdict = worker.await_approval(&request, reason).await;
                (request.id, verdict)
            });
        }
    }

    fn record_verdict(&self, joined: Result<Verdict, tokio::task::JoinError>) {
        let shared = &self.worker.shared;
        let (id, verdict) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                // only one approval is ever in flight
                let id = shared
                    .inner
                    .lock()
                    .waiting
                    .iter()
                    .find(|t| matches!(t.gate, Gate::Approving(_)))
                    .map(|t| t.request.id.clone());
                let Some(id) = id else {
                    return;
                };
                tracing::warn!(tool_use_id = %id, "Approval task panicked: {e}");
                (id, Err(format!("approval failed: {e}")))
            }
        };

        match verdict {
            Ok(()) => {
                let mut inner = shared.inner.lock();
                if let Some(task) = inner.waiting.iter_mut().find(|t| t.request.id == id) {
                    task.gate = match std::mem::replace(&mut task.gate, Gate::Unchecked) {
                        Gate::Approving(tool) => Gate::Cleared(tool),
                        other => other,
                    };
                }
            }
            Err(reason) => {
                if let Some(task) = self.take_waiting(&id) {
                    shared.finish(permission_denied(&task.request, reason));
                }
            }
        }
    }

    fn take_waiting(&self, id: &str) -> Option<QueuedTask> {
        let mut inner = self.worker.shared.inner.lock();
        let index = inner.waiting.iter().position(|t| t.request.id == id)?;
        Some(inner.waiting.remove(index))
    }

    fn record_joined(
        &self,
        joined: Result<(tokio::task::Id, TaskOutcome), tokio::task::JoinError>,
        running: &mut HashMap<tokio::task::Id, ToolCallRequest>,
    ) {
        match joined {
            Ok((task_id, outcome)) => {
                running.remove(&task_id);
                self.worker.shared.finish(outcome);
            }
            Err(e) => {
                if let Some(request) = running.remove(&e.id()) {
                    tracing::warn!(tool = %request.name, "Tool task panicked: {e}");
                    self.worker.shared.finish(TaskOutcome::new(
                        &request,
                        TaskState::Failed,
                        self.attempts_of(&request.id),
                        format!("Tool '{}' crashed: {e}", request.name),
                        true,
                    ));
                }
            }
        }
    }

    fn attempts_of(&self, id: &str) -> u32 {
        self.worker.shared.inner.lock().records.get(id).map(|r| r.attempts).unwrap_or(0)
    }

    /// Promote tasks whose dependencies completed; fail tasks whose dependencies cannot complete.
    /// Returns whether any task changed state.
    fn resolve_dependencies(&self) -> bool {
        let shared = &self.worker.shared;
        let mut promoted = Vec::new();
        let mut failed = Vec::new();
        {
            let mut inner = shared.inner.lock();
            let mut i = 0;
            while i < inner.waiting.len() {
                let task = &inner.waiting[i];
                let current = inner.records.get(&task.request.id).map(|r| r.state);
                let mut blocked_by = None;
                let mut all_done = true;
                for dep in &task.depends_on {
                    match inner.records.get(dep).map(|r| r.state) {
                        Some(TaskState::Completed) => {}
                        Some(state @ (TaskState::Failed | TaskState::Cancelled)) => {
                            blocked_by = Some(format!("dependency {dep} {}", state_word(state)));
                            break;
                        }
                        None => {
                            blocked_by = Some(format!("unknown dependency {dep}"));
                            break;
                        }
                        Some(_) => all_done = false,
                    }
                }

                if let Some(reason) = blocked_by {
                    let task = inner.waiting.remove(i);
                    failed.push((task.request, reason));
                    continue;
                }
                if all_done && current == Some(TaskState::Pending) {
                    promoted.push(task.request.id.clone());
                }
                i += 1;
            }
        }

        let progressed = !promoted.is_empty() || !failed.is_empty();
        for id in promoted {
            shared.set_state(&id, TaskState::Queued);
        }
        for (request, reason) in failed {
            tracing::debug!(tool_use_id = %request.id, %reason, "Task will not run");
            shared.finish(TaskOutcome::new(
                &request,
                TaskState::Failed,
                0,
                format!("Tool '{}' was not run: {reason}", request.name),
                true,
            ));
        }
        progressed
    }

    /// Highest priority cleared task; earliest submission wins ties
    fn pop_ready(&self) -> Option<(ToolCallRequest, BoxedTool)> {
        let mut inner = self.worker.shared.inner.lock();
        let best = inner
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t.gate, Gate::Cleared(_)))
            .filter(|(_, t)| inner.records.get(&t.request.id).map(|r| r.state) == Some(TaskState::Queued))
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(i, _)| i)?;
        let task = inner.waiting.remove(best);
        match task.gate {
            Gate::Cleared(tool) => Some((task.request, tool)),
            _ => None,
        }
    }

    fn fail_unreachable(&self) {
        let stuck: Vec<QueuedTask> = std::mem::take(&mut self.worker.shared.inner.lock().waiting);
        for task in stuck {
            self.worker.shared.finish(TaskOutcome::new(
                &task.request,
                TaskState::Failed,
                0,
                format!("Tool '{}' was not run: dependencies can never complete", task.request.name),
                true,
            ));
        }
    }

    fn cancel_waiting(&self) {
        let waiting: Vec<QueuedTask> = std::mem::take(&mut self.worker.shared.inner.lock().waiting);
        for task in waiting {
            self.worker
                .shared
                .finish(TaskOutcome::new(&task.request, TaskState::Cancelled, 0, CANCELLED_MESSAGE, true));
        }
    }
}

/// Result text for a call that was cancelled
pub const CANCELLED_MESSAGE: &str = "Tool execution cancelled";

fn permission_denied(request: &ToolCallRequest, reason: String) -> TaskOutcome {
    TaskOutcome::new(request, TaskState::Failed, 0, format!("Permission denied: {reason}"), true)
}

fn state_word(state: TaskState) -> &'static str {
    match state {
        TaskState::Failed => "failed",
        TaskState::Cancelled => "was cancelled",
        _ => "is unfinished",
    }
}

impl Worker {
    async fn execute(self, request: ToolCallRequest, tool: BoxedTool) -> TaskOutcome {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.shared.set_attempts(&request.id, attempt);
            if self.cancel.is_cancelled() {
                return TaskOutcome::new(&request, TaskState::Cancelled, attempt - 1, CANCELLED_MESSAGE, true);
            }

            let ctx = ToolContext {
                tool_use_id: request.id.clone(),
                attempt,
                cancel: self.cancel.child_token(),
                progress: ProgressSender::new(self.shared.events.clone(), request.id.clone(), request.name.clone()),
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ToolError::Cancelled),
                result = tool.execute(request.input.clone(), ctx) => result,
            };

            match result {
                Ok(output) => {
                    return TaskOutcome::new(&request, TaskState::Completed, attempt, output.content, output.is_error);
                }
                Err(ToolError::Cancelled) => {
                    return TaskOutcome::new(&request, TaskState::Cancelled, attempt, CANCELLED_MESSAGE, true);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    tracing::warn!(
                        tool = %request.name,
                        "Tool failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(tool = %request.name, attempts = attempt, "Tool failed: {e}");
                    return TaskOutcome::new(
                        &request,
                        TaskState::Failed,
                        attempt,
                        format!("Tool '{}' failed after {attempt} attempt(s): {e}", request.name),
                        true,
                    );
                }
            }
        }
    }

    /// Admission decision for an eligible call; `Err` carries the failed outcome
    fn gate(&self, request: &ToolCallRequest) -> Result<Gate, TaskOutcome> {
        let tool = self.registry.validate_call(&request.name, &request.input).map_err(|message| {
            tracing::debug!(tool = %request.name, "Rejected before dispatch: {message}");
            TaskOutcome::new(request, TaskState::Failed, 0, format!("Validation error: {message}"), true)
        })?;

        let decision = self.permissions.evaluate(&request.name, &request.input);
        self.shared.events.emit(EngineEvent::PermissionDecided {
            tool_use_id: request.id.clone(),
            tool_name: request.name.clone(),
            behavior: decision.behavior,
            reason: decision.reason.clone(),
        });

        match decision.behavior {
            PermissionBehavior::Allow => Ok(Gate::Cleared(tool)),
            PermissionBehavior::Deny => Err(permission_denied(request, decision.reason)),
            PermissionBehavior::Ask if self.approver.is_none() => Err(permission_denied(
                request,
                format!("{}; approval required but no approver is configured", decision.reason),
            )),
            PermissionBehavior::Ask => Ok(Gate::Asking {
                tool,
                reason: decision.reason,
            }),
        }
    }

    /// `Err(reason)` when the approver refuses the call
    async fn await_approval(&self, request: &ToolCallRequest, reason: String) -> Result<(), String> {
        let Some(approver) = &self.approver else {
            return Err(format!("{reason}; approval required but no approver is configured"));
        };
        let approval = ApprovalRequest {
            tool_use_id: request.id.clone(),
            tool_name: request.name.clone(),
            input: request.input.clone(),
            reason,
            suggested_rule: ArgumentSignature::for_call(&request.name, &request.input).as_rule(&request.name),
        };
        let answer = tokio::select! {
            _ = self.cancel.cancelled() => return Err("cancelled while awaiting approval".to_string()),
            answer = approver.decide(&approval) => answer,
        };
        match answer {
            ApprovalDecision::Allow => Ok(()),
            ApprovalDecision::AllowAlways => {
                self.remember(approval.suggested_rule);
                Ok(())
            }
            ApprovalDecision::Deny { reason } => Err(reason),
        }
    }

    /// Session-scoped "always allow": apply locally and ask the settings store to persist it.
    fn remember(&self, rule: PermissionRuleValue) {
        if let Err(e) = validate_rule(&rule.to_string()) {
            tracing::warn!(rule = %rule, "Not remembering approval: {e}");
            return;
        }
        let update = PermissionUpdate::AddRules {
            destination: RuleSource::Session,
            behavior: PermissionBehavior::Allow,
            rules: vec![rule],
        };
        if let Err(e) = self.permissions.apply(&update) {
            tracing::warn!("Could not apply session rule: {e}");
            return;
        }
        self.shared.events.emit(EngineEvent::PermissionUpdateRequested { update });
    }
}
