//! Model-turn transport with network retry

use std::sync::LazyLock;

use regex::Regex;

use async_trait::async_trait;
use tern_ai::{Context, Message, Model, ModelProvider, ProtocolEventStream, ToolDefinition};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

/// Fallback check for wrapped errors whose type was lost
fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    ["429", "rate limit", "timeout", "connection", "overloaded", "500", "502", "503", "504", "529"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Patterns for "the prompt no longer fits" across backends
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?(is.?)?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)context_length_exceeded",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)context.?overflow",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// HTTP 400 in error strings ("400 Bad Request", "HTTP 400", "status: 400")
static HTTP_400_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(?:status|http|error)[:\s]*400\b|\b400\s+bad\s+request").ok());

/// Check if an error message indicates a context overflow / too many tokens
pub fn is_context_overflow(error: &str) -> bool {
    if HTTP_400_PATTERN.as_ref().is_some_and(|re| re.is_match(error)) {
        let lower = error.to_lowercase();
        if lower.contains("token") || lower.contains("context") || lower.contains("length") {
            return true;
        }
    }

    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}

/// One model request
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub model: Model,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl TurnRequest {
    pub fn context(&self) -> Context {
        Context {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
        }
    }
}

/// Opens the event stream for one model turn
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_turn(&self, request: &TurnRequest, cancel: CancellationToken) -> Result<ProtocolEventStream>;
}

/// Direct provider transport with retry on transient failures
pub struct ProviderTransport<P> {
    provider: P,
    retry_config: RetryConfig,
}

impl<P: ModelProvider> ProviderTransport<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            retry_config: RetryConfig::default(),
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

#[async_trait]
impl<P: ModelProvider> Transport for ProviderTransport<P> {
    async fn open_turn(&self, request: &TurnRequest, cancel: CancellationToken) -> Result<ProtocolEventStream> {
        let context = request.context();
        let mut attempt = 0u32;

        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                opened = self.provider.stream(&request.model, &context) => opened,
            };

            let e = match opened {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };

            // Context overflow is never retryable
            if e.is_context_overflow() {
                return Err(Error::Ai(e));
            }

            let error_msg = e.to_string();
            let retryable = e.is_retryable() || is_retryable_error(&error_msg);
            if !retryable {
                return Err(Error::Ai(e));
            }
            if attempt >= self.retry_config.max_retries {
                return Err(Error::Protocol(format!(
                    "request failed after {} attempts: {error_msg}",
                    attempt + 1
                )));
            }

            let delay = self.retry_config.delay_for_attempt(attempt);
            tracing::warn!(
                "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                attempt + 1,
                self.retry_config.max_retries + 1,
                error_msg,
                delay
            );
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
