//! tern-agent: conversation engine with tool execution
//!
//! This crate drives multi-turn conversations with a model backend: it
//! streams each turn, schedules tool calls under permission rules while the
//! stream is still open, keeps every tool use paired with exactly one
//! result, and compacts the history when it grows too large.

pub mod compaction;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod permission;
pub mod retry;
pub mod tokens;
pub mod tool;
pub mod transport;

pub use compaction::{CompactionConfig, CompactionReason, CompactionReport, ContextCompactor};
pub use config::EngineConfig;
pub use conversation::{Conversation, ConversationState};
pub use coordinator::{
    ApprovalDecision, ApprovalRequest, Approver, CoordinatorConfig, TaskHandle, TaskOutcome, TaskState,
    ToolExecutionCoordinator,
};
pub use engine::{ConversationEngine, INTERRUPT_MARKER};
pub use error::{Error, Result};
pub use events::{EngineEvent, EventSink};
pub use handle::EngineHandle;
pub use permission::{PermissionBehavior, PermissionMode, PermissionStore, PermissionUpdate, ToolPermissionContext};
pub use tokens::estimate_total_tokens;
pub use tool::{BoxedTool, ProgressSender, Tool, ToolContext, ToolError, ToolOutput, ToolRegistry};
pub use retry::RetryConfig;
pub use transport::{ProviderTransport, Transport, TurnRequest};
