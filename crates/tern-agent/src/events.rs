//! Engine event types and the single ordered event queue

use serde::{Deserialize, Serialize};
use tern_ai::{Message, StopReason, TokenUsage, ToolCallRequest};
use tokio::sync::mpsc;

use crate::compaction::{CompactionReason, CompactionReport};
use crate::conversation::ConversationState;
use crate::coordinator::TaskState;
use crate::permission::{PermissionBehavior, PermissionUpdate};

/// Events emitted while the engine runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Conversation state transition
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },

    /// A model turn is being requested
    TurnStarted { turn: u32 },

    /// Visible text streamed from the model
    TextDelta { text: String },

    /// Reasoning text streamed from the model
    ThinkingDelta { text: String },

    /// The model finished a tool call's input
    ToolCallRequested { request: ToolCallRequest },

    /// Outcome of the permission check for a call
    PermissionDecided {
        tool_use_id: String,
        tool_name: String,
        behavior: PermissionBehavior,
        reason: String,
    },

    /// A permission change the external settings store should persist
    PermissionUpdateRequested { update: PermissionUpdate },

    /// Task lifecycle transition
    TaskStateChanged {
        tool_use_id: String,
        tool_name: String,
        state: TaskState,
        attempts: u32,
    },

    /// Progress reported by a running tool
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        content: String,
    },

    /// A task produced its result
    ToolCompleted {
        tool_use_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },

    /// Usage after a turn
    Usage { turn: TokenUsage, total: TokenUsage },

    /// An assistant message was appended to the history
    MessageCompleted { message: Message },

    /// A model turn finished
    TurnCompleted {
        turn: u32,
        stop_reason: Option<StopReason>,
    },

    CompactionStarted { reason: CompactionReason },

    CompactionCompleted { report: CompactionReport },

    /// Compaction was attempted but not performed
    CompactionSkipped { reason: String },

    /// Error surfaced to the caller
    Error { message: String },
}

impl EngineEvent {
    /// Check if this event ends a prompt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Error { .. }
                | EngineEvent::StateChanged {
                    to: ConversationState::Idle | ConversationState::Terminated,
                    ..
                }
        )
    }
}

/// Sending side of the engine's event queue. Cloning is cheap.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. A dropped receiver is not an error.
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(EngineEvent::TurnStarted { turn: 1 });
        sink.emit(EngineEvent::TextDelta { text: "a".into() });
        sink.emit(EngineEvent::TextDelta { text: "b".into() });

        assert!(matches!(rx.recv().await, Some(EngineEvent::TurnStarted { turn: 1 })));
        assert!(matches!(rx.recv().await, Some(EngineEvent::TextDelta { text }) if text == "a"));
        assert!(matches!(rx.recv().await, Some(EngineEvent::TextDelta { text }) if text == "b"));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(EngineEvent::Error { message: "ignored".into() });
    }

    #[test]
    fn test_terminal_events() {
        assert!(EngineEvent::Error { message: "x".into() }.is_terminal());
        assert!(
            EngineEvent::StateChanged {
                from: ConversationState::Processing,
                to: ConversationState::Idle
            }
            .is_terminal()
        );
        assert!(!EngineEvent::TurnStarted { turn: 2 }.is_terminal());
    }

    #[test]
    fn test_event_serialization_tag() {
        let value = serde_json::to_value(EngineEvent::TurnStarted { turn: 3 }).unwrap();
        assert_eq!(value["type"], "turn_started");
        assert_eq!(value["turn"], 3);
    }
}
