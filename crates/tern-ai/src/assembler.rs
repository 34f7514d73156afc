//! Assembles protocol events into one assistant message per turn

use serde_json::Value;

use crate::decoder::{BlockDelta, BlockStart, ProtocolEvent};
use crate::types::{ContentBlock, Message, Role, StopReason, TokenUsage, ToolCallRequest};

/// Something the caller should act on immediately
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerOutput {
    /// Visible text, for incremental display
    TextDelta(String),
    /// Reasoning text, for incremental display
    ThinkingDelta(String),
    /// A tool call whose input is complete
    ToolCall(ToolCallRequest),
    /// Updated usage for this turn
    Usage(TokenUsage),
    /// The turn is over
    Completed(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    None,
    InText,
    InThinking,
    InToolUse,
}

#[derive(Debug)]
struct ToolAccumulator {
    id: String,
    name: String,
    partial_json: String,
}

/// Per-turn assembler state machine
#[derive(Debug)]
pub struct ContentAssembler {
    origin_message_index: usize,
    state: BlockState,
    content: Vec<ContentBlock>,
    text_open: bool,
    thinking: String,
    tool: Option<ToolAccumulator>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
    completed: bool,
}

impl ContentAssembler {
    /// `origin_message_index` is where the assembled message will land in the history.
    pub fn new(origin_message_index: usize) -> Self {
        Self {
            origin_message_index,
            state: BlockState::None,
            content: Vec::new(),
            text_open: false,
            thinking: String::new(),
            tool: None,
            usage: TokenUsage::default(),
            stop_reason: None,
            completed: false,
        }
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Snapshot of the message so far. An unfinished tool call is left out.
    pub fn partial_message(&self) -> Message {
        let mut content = self.content.clone();
        if self.state == BlockState::InThinking && !self.thinking.is_empty() {
            content.push(ContentBlock::thinking(self.thinking.clone()));
        }
        Message::new(Role::Assistant, content)
    }

    /// Advance the state machine by one event.
    pub fn process(&mut self, event: ProtocolEvent) -> Vec<AssemblerOutput> {
        if self.completed {
            tracing::debug!(?event, "Ignoring event after message_stop");
            return Vec::new();
        }

        let mut out = Vec::new();
        match event {
            ProtocolEvent::MessageStart { usage } => {
                if let Some(usage) = usage {
                    self.usage.merge_max(&usage);
                    out.push(AssemblerOutput::Usage(self.usage));
                }
            }
            ProtocolEvent::ContentBlockStart { block, .. } => {
                if self.state != BlockState::None {
                    // Previous block was never stopped
                    self.close_block(&mut out);
                }
                match block {
                    BlockStart::Text => {
                        self.state = BlockState::InText;
                        self.content.push(ContentBlock::text(""));
                        self.text_open = true;
                    }
                    BlockStart::Thinking => {
                        self.state = BlockState::InThinking;
                        self.thinking.clear();
                        self.text_open = false;
                    }
                    BlockStart::ToolUse { id, name } => {
                        self.state = BlockState::InToolUse;
                        self.tool = Some(ToolAccumulator {
                            id,
                            name,
                            partial_json: String::new(),
                        });
                        self.text_open = false;
                    }
                }
            }
            ProtocolEvent::ContentBlockDelta { delta, .. } => self.apply_delta(delta, &mut out),
            ProtocolEvent::ContentBlockStop { .. } => self.close_block(&mut out),
            ProtocolEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if let Some(usage) = usage {
                    self.usage.merge_max(&usage);
                    out.push(AssemblerOutput::Usage(self.usage));
                }
            }
            ProtocolEvent::MessageStop => {
                if self.state != BlockState::None {
                    self.close_block(&mut out);
                }
                self.completed = true;
                self.content.retain(|block| !matches!(block, ContentBlock::Text { text } if text.is_empty()));
                out.push(AssemblerOutput::Completed(Message::new(
                    Role::Assistant,
                    std::mem::take(&mut self.content),
                )));
            }
        }
        out
    }

    fn apply_delta(&mut self, delta: BlockDelta, out: &mut Vec<AssemblerOutput>) {
        match self.state {
            BlockState::InThinking => {
                let (BlockDelta::Text(chunk) | BlockDelta::Thinking(chunk) | BlockDelta::PartialJson(chunk)) = delta;
                self.thinking.push_str(&chunk);
                out.push(AssemblerOutput::ThinkingDelta(chunk));
            }
            BlockState::InToolUse => {
                let (BlockDelta::Text(chunk) | BlockDelta::Thinking(chunk) | BlockDelta::PartialJson(chunk)) = delta;
                if let Some(tool) = self.tool.as_mut() {
                    tool.partial_json.push_str(&chunk);
                }
            }
            BlockState::None | BlockState::InText => match delta {
                BlockDelta::Text(chunk) | BlockDelta::Thinking(chunk) => {
                    self.append_text(&chunk);
                    out.push(AssemblerOutput::TextDelta(chunk));
                }
                BlockDelta::PartialJson(chunk) => {
                    tracing::warn!(len = chunk.len(), "Dropping tool input fragment outside a tool_use block");
                }
            },
        }
    }

    fn append_text(&mut self, chunk: &str) {
        if self.text_open {
            if let Some(ContentBlock::Text { text }) = self.content.last_mut() {
                text.push_str(chunk);
                return;
            }
        }
        self.content.push(ContentBlock::text(chunk));
        self.text_open = true;
    }

    fn close_block(&mut self, out: &mut Vec<AssemblerOutput>) {
        match self.state {
            BlockState::None => {}
            BlockState::InText => self.text_open = false,
            BlockState::InThinking => {
                let thinking = std::mem::take(&mut self.thinking);
                if !thinking.is_empty() {
                    self.content.push(ContentBlock::thinking(thinking));
                }
            }
            BlockState::InToolUse => {
                if let Some(tool) = self.tool.take() {
                    let input = parse_tool_input(&tool.name, &tool.partial_json);
                    let block = ContentBlock::tool_use(tool.id, tool.name, input);
                    if let Some(request) = ToolCallRequest::from_block(&block, self.origin_message_index) {
                        out.push(AssemblerOutput::ToolCall(request));
                    }
                    self.content.push(block);
                }
            }
        }
        self.state = BlockState::None;
    }
}

fn parse_tool_input(tool_name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(tool = tool_name, error = %e, "Tool input is not valid JSON, keeping raw string");
            Value::String(raw.to_string())
        }
    }
}
