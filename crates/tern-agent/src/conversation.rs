//! Conversation state: messages, usage and the engine state machine.

use serde::{Deserialize, Serialize};
use tern_ai::{Message, TokenUsage};

use crate::error::{Error, Result};

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    Processing,
    Streaming,
    AwaitingTools,
    Error,
    Terminated,
}

impl ConversationState {
    pub fn can_transition_to(self, next: ConversationState) -> bool {
        use ConversationState as S;
        match (self, next) {
            (S::Terminated, _) => false,
            (_, S::Terminated) => true,
            (S::Idle, S::Processing) => true,
            (S::Processing, S::Streaming | S::Idle | S::Error) => true,
            (S::Streaming, S::AwaitingTools | S::Idle | S::Error) => true,
            (S::AwaitingTools, S::Processing | S::Idle | S::Error) => true,
            (S::Error, S::Idle) => true,
            _ => false,
        }
    }

    /// States in which a prompt is being processed
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ConversationState::Processing | ConversationState::Streaming | ConversationState::AwaitingTools
        )
    }
}

/// Conversation state owned by the engine
#[derive(Debug, Default)]
pub struct Conversation {
    /// History; append-only except for a compaction rewrite
    pub messages: Vec<Message>,
    pub state: ConversationState,
    /// Total usage across all turns
    pub total_usage: TokenUsage,
    /// Last surfaced error
    pub error: Option<String>,
    /// Number of compactions performed
    pub compactions: u32,
}

impl Conversation {
    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: ConversationState) -> Result<ConversationState> {
        let from = self.state;
        if from == ConversationState::Terminated {
            return Err(Error::Terminated);
        }
        if !from.can_transition_to(next) {
            return Err(Error::Other(format!("invalid state transition {from:?} -> {next:?}")));
        }
        self.state = next;
        Ok(from)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}
