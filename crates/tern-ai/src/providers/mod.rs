//! Model backend providers

pub mod anthropic;

use async_trait::async_trait;

use crate::{Context, Model, ProtocolEventStream, Result};

/// A backend that opens one streamed model turn
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send the request and return the decoded event stream
    async fn stream(&self, model: &Model, context: &Context) -> Result<ProtocolEventStream>;
}

