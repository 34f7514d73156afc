//! The conversation engine: one sequential turn loop per prompt
//!
//! Each turn compacts the history if needed, opens a model stream, feeds the
//! decoded events through a [`ContentAssembler`], and hands finished tool
//! calls to a [`ToolExecutionCoordinator`] while the stream is still running.
//! The model is resumed only after every tool call of the turn has a result.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tern_ai::{
    AssemblerOutput, ContentAssembler, ContentBlock, Message, ProtocolEventStream, Role, StopReason, TokenUsage,
    ToolCallRequest, validate_pairing,
};
use tokio::sync::mpsc;
use tracing::Instrument;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::compaction::{CompactionReason, CompactionReport, ContextCompactor};
use crate::config::EngineConfig;
use crate::conversation::{Conversation, ConversationState};
use crate::coordinator::{Approver, TaskOutcome, ToolExecutionCoordinator};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventSink};
use crate::handle::EngineHandle;
use crate::permission::PermissionStore;
use crate::tool::{BoxedTool, ToolRegistry};
use crate::transport::{Transport, TurnRequest};

/// Text recorded when the user aborts a prompt
pub const INTERRUPT_MARKER: &str = "[Request interrupted by user]";

/// How a single model turn ended
enum TurnEnd {
    /// Final answer; the prompt is done
    Done,
    /// Tool results were appended; the model must be asked again
    ToolsRan,
}

/// The main engine that orchestrates a conversation
pub struct ConversationEngine {
    session_id: Uuid,
    config: EngineConfig,
    conversation: Conversation,
    tools: Arc<ToolRegistry>,
    transport: Arc<dyn Transport>,
    permissions: Arc<PermissionStore>,
    approver: Option<Arc<dyn Approver>>,
    compactor: ContextCompactor,
    events: EventSink,
    event_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    handle: EngineHandle,
}

impl ConversationEngine {
    /// Create an engine. Fails if the configured permission rules are invalid.
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let permissions = Arc::new(PermissionStore::new(config.permission_context()?));
        let (events, event_rx) = EventSink::channel();
        Ok(Self {
            session_id: Uuid::new_v4(),
            compactor: ContextCompactor::new(config.compaction.clone()),
            config,
            conversation: Conversation::default(),
            tools: Arc::new(ToolRegistry::new()),
            transport,
            permissions,
            approver: None,
            events,
            event_rx: Some(event_rx),
            handle: EngineHandle::new(),
        })
    }

    /// Add a tool
    pub fn register_tool(&mut self, tool: BoxedTool) {
        Arc::make_mut(&mut self.tools).register(tool);
    }

    /// Set the collaborator consulted for `ask` decisions
    pub fn set_approver(&mut self, approver: Arc<dyn Approver>) {
        self.approver = Some(approver);
    }

    /// Shared permission snapshot holder
    pub fn permissions(&self) -> Arc<PermissionStore> {
        Arc::clone(&self.permissions)
    }

    /// The single ordered event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.event_rx.take()
    }

    /// Get a cloneable handle for aborting from other tasks.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Identifier attached to this engine's log records
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    /// Total usage across all turns
    pub fn usage(&self) -> TokenUsage {
        self.conversation.total_usage
    }

    pub fn state(&self) -> ConversationState {
        self.conversation.state
    }

    /// Last error surfaced by a prompt
    pub fn last_error(&self) -> Option<&str> {
        self.conversation.error.as_deref()
    }

    /// Leave the `Error` state after the error has been surfaced
    pub fn recover(&mut self) -> Result<()> {
        if self.conversation.state == ConversationState::Error {
            self.set_state(ConversationState::Idle)?;
            self.conversation.error = None;
        }
        Ok(())
    }

    /// Stop for good; later prompts fail with [`Error::Terminated`]
    pub fn terminate(&mut self) -> Result<()> {
        self.handle.abort();
        self.set_state(ConversationState::Terminated)
    }

    /// Compact the history now
    pub fn run_compaction(&mut self) -> Result<CompactionReport> {
        if self.conversation.state == ConversationState::Terminated {
            return Err(Error::Terminated);
        }
        self.compact_history(CompactionReason::Manual)
    }

    /// Send a user prompt and run turns until the model stops asking for tools
    pub async fn prompt(&mut self, text: impl Into<String>) -> Result<()> {
        match self.conversation.state {
            ConversationState::Terminated => return Err(Error::Terminated),
            ConversationState::Error => {
                return Err(Error::Other(
                    "engine is in the error state; call recover() first".to_string(),
                ));
            }
            _ => {}
        }

        let cancel = self.handle.begin();
        if let Err(e) = self.set_state(ConversationState::Processing) {
            self.handle.finish();
            return Err(e);
        }
        self.conversation.error = None;
        self.conversation.push(Message::user(text));

        let span = tracing::info_span!("prompt", session = %self.session_id);
        let result = self.run_turns(&cancel).instrument(span).await;

        match &result {
            Ok(()) | Err(Error::Cancelled) => {
                self.settle(ConversationState::Idle);
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Prompt failed: {message}");
                self.conversation.error = Some(message.clone());
                self.events.emit(EngineEvent::Error { message });
                let next = if e.is_protocol_failure() {
                    ConversationState::Error
                } else {
                    ConversationState::Idle
                };
                self.settle(next);
            }
        }

        debug_assert!(validate_pairing(&self.conversation.messages).is_ok());
        self.handle.finish();
        result
    }

    async fn run_turns(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut turn = 0u32;
        let mut overflow_retried = false;

        loop {
            if cancel.is_cancelled() {
                self.record_interrupt(Message::new(Role::Assistant, Vec::new()));
                return Err(Error::Cancelled);
            }
            if self.conversation.state != ConversationState::Processing {
                self.set_state(ConversationState::Processing)?;
            }

            turn += 1;
            if turn > self.config.max_turns {
                return Err(Error::Other(format!(
                    "exceeded max_turns ({}) without a final answer",
                    self.config.max_turns
                )));
            }

            if self.compactor.needs_compaction(&self.conversation.messages) {
                // Non-fatal: a skipped compaction was already logged and emitted
                let _ = self.compact_history(CompactionReason::Threshold);
            }

            self.events.emit(EngineEvent::TurnStarted { turn });
            let request = TurnRequest {
                model: self.config.model.clone(),
                system_prompt: self.config.system_prompt.clone(),
                messages: self.conversation.messages.clone(),
                tools: self.tools.definitions(),
            };

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                opened = self.transport.open_turn(&request, cancel.clone()) => opened,
            };
            let stream = match opened {
                Ok(stream) => stream,
                Err(Error::Cancelled) => {
                    self.record_interrupt(Message::new(Role::Assistant, Vec::new()));
                    return Err(Error::Cancelled);
                }
                Err(e) if e.is_context_overflow() && !overflow_retried && self.compactor.config().enabled => {
                    overflow_retried = true;
                    tracing::warn!("Context overflow, compacting and retrying: {e}");
                    self.compact_history(CompactionReason::Overflow).map_err(|_| e)?;
                    turn -= 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.set_state(ConversationState::Streaming)?;
            match self.stream_turn(stream, cancel, turn).await? {
                TurnEnd::Done => return Ok(()),
                TurnEnd::ToolsRan => {}
            }
        }
    }

    /// Drive one model stream to completion, running tools as they arrive.
    async fn stream_turn(
        &mut self,
        mut stream: ProtocolEventStream,
        cancel: &CancellationToken,
        turn: u32,
    ) -> Result<TurnEnd> {
        let mut assembler = ContentAssembler::new(self.conversation.messages.len());
        let coordinator = ToolExecutionCoordinator::new(
            self.config.coordinator_config(),
            Arc::clone(&self.tools),
            Arc::clone(&self.permissions),
            self.events.clone(),
        )
        .with_approver(self.approver.clone())
        .with_cancel_token(cancel.child_token());

        let mut dependencies = DependencyTracker::default();
        let mut completed: Option<Message> = None;
        let mut failure: Option<Error> = None;
        let mut early_outcomes: Option<Vec<TaskOutcome>> = None;
        let mut turn_usage = TokenUsage::default();

        let run = coordinator.run();
        tokio::pin!(run);

        while completed.is_none() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    failure = Some(Error::Cancelled);
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        for output in assembler.process(event) {
                            match output {
                                AssemblerOutput::TextDelta(text) => self.events.emit(EngineEvent::TextDelta { text }),
                                AssemblerOutput::ThinkingDelta(text) => {
                                    self.events.emit(EngineEvent::ThinkingDelta { text })
                                }
                                AssemblerOutput::ToolCall(request) => {
                                    let depends_on = dependencies.next(&request, &self.tools);
                                    self.events.emit(EngineEvent::ToolCallRequested { request: request.clone() });
                                    coordinator.submit_with(request, 0, depends_on);
                                }
                                AssemblerOutput::Usage(usage) => turn_usage = usage,
                                AssemblerOutput::Completed(message) => completed = Some(message),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        failure = Some(Error::Protocol(e.to_string()));
                        break;
                    }
                    None => {
                        failure = Some(Error::Protocol("stream ended before message_stop".to_string()));
                        break;
                    }
                },
                outcomes = &mut run, if early_outcomes.is_none() => {
                    early_outcomes = Some(outcomes);
                }
            }
        }
        drop(stream);

        self.record_usage(&turn_usage);

        if let Some(error) = failure {
            coordinator.cancel_all();
            let outcomes = match early_outcomes {
                Some(outcomes) => outcomes,
                None => run.await,
            };
            let mut partial = assembler.partial_message();
            let mut recorded = HashSet::new();
            if matches!(error, Error::Cancelled) {
                recorded.extend(partial.tool_uses().into_iter().map(|(id, _, _)| id.to_string()));
                self.record_interrupt(partial);
            } else if has_meaningful_content(&partial) {
                partial.content.retain(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()));
                recorded.extend(partial.tool_uses().into_iter().map(|(id, _, _)| id.to_string()));
                self.append_assistant(partial);
            }
            // a result without its tool use in the history would break pairing
            let (paired, dropped): (Vec<_>, Vec<_>) = outcomes
                .into_iter()
                .partition(|outcome| recorded.contains(&outcome.tool_use_id));
            if !dropped.is_empty() {
                tracing::debug!(count = dropped.len(), "Dropping results of tool uses not kept in history");
            }
            self.append_results(paired);
            return Err(error);
        }

        let Some(message) = completed else {
            return Err(Error::Protocol("stream ended before message_stop".to_string()));
        };
        let stop_reason = assembler.stop_reason();
        let has_calls = message.has_tool_use();

        coordinator.close();
        let outcomes = if has_calls {
            self.set_state(ConversationState::AwaitingTools)?;
            match early_outcomes {
                Some(outcomes) => outcomes,
                None => run.await,
            }
        } else {
            Vec::new()
        };

        if cancel.is_cancelled() {
            self.record_interrupt(message);
            self.append_results(outcomes);
            return Err(Error::Cancelled);
        }

        self.append_assistant(message);
        self.events.emit(EngineEvent::TurnCompleted { turn, stop_reason });
        if !has_calls {
            if stop_reason == Some(StopReason::MaxTokens) {
                tracing::warn!(turn, "Model stopped at max_tokens");
            }
            return Ok(TurnEnd::Done);
        }
        self.append_results(outcomes);
        Ok(TurnEnd::ToolsRan)
    }

    fn record_usage(&mut self, usage: &TokenUsage) {
        self.conversation.total_usage.accumulate(usage);
        self.events.emit(EngineEvent::Usage {
            turn: *usage,
            total: self.conversation.total_usage,
        });
    }

    fn append_assistant(&mut self, message: Message) {
        self.events.emit(EngineEvent::MessageCompleted { message: message.clone() });
        self.conversation.push(message);
    }

    /// Keep whatever the model produced, marked as interrupted
    fn record_interrupt(&mut self, mut message: Message) {
        message
            .content
            .retain(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()));
        message.content.push(ContentBlock::text(INTERRUPT_MARKER));
        self.append_assistant(message);
    }

    /// One user message with every result, in tool-use emission order
    fn append_results(&mut self, outcomes: Vec<TaskOutcome>) {
        if outcomes.is_empty() {
            return;
        }
        let results = outcomes.into_iter().map(|o| o.result).collect();
        self.conversation.push(Message::user_tool_results(results));
    }

    fn compact_history(&mut self, reason: CompactionReason) -> Result<CompactionReport> {
        self.events.emit(EngineEvent::CompactionStarted { reason });
        match self.compactor.compact(&self.conversation.messages) {
            Ok((messages, report)) => {
                self.conversation.messages = messages;
                self.conversation.compactions += 1;
                self.events.emit(EngineEvent::CompactionCompleted { report: report.clone() });
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(?reason, "Skipping compaction: {e}");
                self.events.emit(EngineEvent::CompactionSkipped { reason: e.to_string() });
                Err(e)
            }
        }
    }

    fn set_state(&mut self, next: ConversationState) -> Result<()> {
        let from = self.conversation.transition(next)?;
        if from != next {
            tracing::debug!(?from, to = ?next, "State changed");
            self.events.emit(EngineEvent::StateChanged { from, to: next });
        }
        Ok(())
    }

    /// Final transition of a prompt; never fails the prompt itself
    fn settle(&mut self, next: ConversationState) {
        if let Err(e) = self.set_state(next) {
            tracing::warn!("Could not settle into {next:?}: {e}");
        }
    }
}

/// Ordering between calls of one turn: a read-only call waits for the latest
/// earlier mutating call; a mutating call waits for every earlier call.
#[derive(Default)]
struct DependencyTracker {
    seen: Vec<String>,
    last_mutating: Option<String>,
}

impl DependencyTracker {
    fn next(&mut self, request: &ToolCallRequest, tools: &ToolRegistry) -> Vec<String> {
        let read_only = tools.is_read_only(&request.name);
        let depends_on = if read_only {
            self.last_mutating.iter().cloned().collect()
        } else {
            self.seen.clone()
        };
        if !read_only {
            self.last_mutating = Some(request.id.clone());
        }
        self.seen.push(request.id.clone());
        depends_on
    }
}

/// Check if a message has content worth preserving.
fn has_meaningful_content(message: &Message) -> bool {
    message.content.iter().any(|block| match block {
        ContentBlock::Text { text } | ContentBlock::Thinking { text } => !text.trim().is_empty(),
        ContentBlock::ToolUse { name, .. } => !name.is_empty(),
        ContentBlock::ToolResult { .. } => true,
    })
}
