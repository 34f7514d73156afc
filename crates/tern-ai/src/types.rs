//! Core conversation types: messages, content blocks, usage

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One typed unit of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Visible text
    Text { text: String },
    /// Model reasoning, kept apart from visible text
    Thinking { text: String },
    /// A request from the model to invoke a tool
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The outcome of a tool invocation
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Create a text block
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a thinking block
    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    /// Create a tool use block
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// Create a tool result block
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    /// Get text if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }

    /// True for a tool result flagged as an error
    pub fn is_error_result(&self) -> bool {
        matches!(self, Self::ToolResult { is_error: true, .. })
    }
}

/// A single conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with the given role and content
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            created_at: Utc::now(),
        }
    }

    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    /// Create an assistant message with text content
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    /// Create a system message with text content
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    /// Create the user message that carries a turn's tool results
    pub fn user_tool_results(results: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, results)
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Combined visible text
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool use blocks as `(id, name, input)`
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }

    /// Tool result blocks as `(tool_use_id, content, is_error)`
    pub fn tool_results(&self) -> Vec<(&str, &str, bool)> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some((tool_use_id.as_str(), content.as_str(), *is_error)),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_use)
    }

    pub fn has_tool_result(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_result)
    }

    pub fn has_error_result(&self) -> bool {
        self.content.iter().any(ContentBlock::is_error_result)
    }
}

/// A tool invocation derived 1:1 from a `ToolUse` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    /// Index the assistant message holding the `ToolUse` has (or will have) in the history
    pub origin_message_index: usize,
}

impl ToolCallRequest {
    /// Derive a request from a `ToolUse` block; `None` for any other block
    pub fn from_block(block: &ContentBlock, origin_message_index: usize) -> Option<Self> {
        match block {
            ContentBlock::ToolUse { id, name, input } => Some(Self {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
                origin_message_index,
            }),
            _ => None,
        }
    }
}

/// Token usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    #[serde(default)]
    pub cache_read: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64, cache_creation: u64, cache_read: u64) -> Self {
        let mut usage = Self {
            input,
            output,
            cache_creation,
            cache_read,
            total: 0,
        };
        usage.recompute_total();
        usage
    }

    /// Add another usage record. Counters only ever grow.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.cache_creation = self.cache_creation.saturating_add(other.cache_creation);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.recompute_total();
    }

    /// Merge a cumulative report from the same turn, keeping the larger of each counter.
    pub fn merge_max(&mut self, other: &TokenUsage) {
        self.input = self.input.max(other.input);
        self.output = self.output.max(other.output);
        self.cache_creation = self.cache_creation.max(other.cache_creation);
        self.cache_read = self.cache_read.max(other.cache_read);
        self.recompute_total();
    }

    fn recompute_total(&mut self) {
        self.total = self
            .input
            .saturating_add(self.output)
            .saturating_add(self.cache_creation)
            .saturating_add(self.cache_read);
    }
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of response
    EndTurn,
    /// Maximum tokens reached
    MaxTokens,
    /// Tool use requested
    ToolUse,
    /// A stop sequence matched
    StopSequence,
}

impl StopReason {
    pub fn parse(reason: &str) -> Option<Self> {
        match reason {
            "end_turn" => Some(Self::EndTurn),
            "max_tokens" => Some(Self::MaxTokens),
            "tool_use" => Some(Self::ToolUse),
            "stop_sequence" => Some(Self::StopSequence),
            _ => None,
        }
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (used in API calls)
    pub name: String,
    /// Description for the model
    pub description: String,
    /// JSON Schema for the input
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Model {
    /// Model identifier
    pub id: String,
    /// Base URL for API calls
    pub base_url: String,
    /// Maximum output tokens per response
    pub max_tokens: u32,
    /// Context window size in tokens
    pub context_window: u32,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            id: "claude-sonnet-4-5-20250929".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 8192,
            context_window: 200_000,
        }
    }
}

/// Everything needed to request one model turn
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Available tools
    pub tools: Vec<ToolDefinition>,
}

/// Violation of the tool-use/tool-result pairing rules
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("tool result at message {message_index} references unknown tool use '{tool_use_id}'")]
    UnknownToolUse {
        message_index: usize,
        tool_use_id: String,
    },
    #[error("tool use '{tool_use_id}' has more than one result (second at message {message_index})")]
    DuplicateResult {
        message_index: usize,
        tool_use_id: String,
    },
}

/// Check that every tool result follows its tool use and no tool use is answered twice.
pub fn validate_pairing(messages: &[Message]) -> Result<(), PairingError> {
    let mut seen_uses: HashSet<&str> = HashSet::new();
    let mut answered: HashSet<&str> = HashSet::new();

    for (message_index, message) in messages.iter().enumerate() {
        for block in &message.content {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    seen_uses.insert(id.as_str());
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    if !seen_uses.contains(tool_use_id.as_str()) {
                        return Err(PairingError::UnknownToolUse {
                            message_index,
                            tool_use_id: tool_use_id.clone(),
                        });
                    }
                    if !answered.insert(tool_use_id.as_str()) {
                        return Err(PairingError::DuplicateResult {
                            message_index,
                            tool_use_id: tool_use_id.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}
