//! tern-ai: wire-level layer of the tern engine
//!
//! Decodes the streamed event protocol of a model backend, assembles the
//! events into typed messages, and provides the HTTP provider that opens
//! those streams.

pub mod assembler;
pub mod decoder;
pub mod error;
pub mod providers;
pub mod types;

pub use assembler::{AssemblerOutput, ContentAssembler};
pub use decoder::{
    BlockDelta, BlockStart, DecodedItem, ProtocolEvent, ProtocolEventStream, StreamDecoder,
    decode_stream,
};
pub use error::{Error, Result};
pub use providers::{ModelProvider, anthropic::AnthropicProvider};
pub use types::*;
