//! Streaming protocol decoder
//!
//! Turns the raw bytes of a `data: <json>` event stream into typed
//! [`ProtocolEvent`]s. Bytes are buffered until a full line is available, so
//! frames (and multi-byte characters) split across reads decode correctly.

use std::pin::Pin;

use async_stream::stream;
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{StopReason, TokenUsage};

/// Stream of decoded protocol events
pub type ProtocolEventStream = Pin<Box<dyn Stream<Item = Result<ProtocolEvent>> + Send>>;

/// Kind of content block opened by `content_block_start`
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

/// Payload of a `content_block_delta`
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    PartialJson(String),
}

/// A typed event from the model backend
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    MessageStart {
        usage: Option<TokenUsage>,
    },
    ContentBlockStart {
        index: usize,
        block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<TokenUsage>,
    },
    MessageStop,
}

/// Output of one decoding step
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedItem {
    Event(ProtocolEvent),
    /// `[DONE]` sentinel: the stream ended cleanly
    Done,
    /// An `error` record: the stream is terminated
    Error {
        error_type: Option<String>,
        message: String,
    },
}

/// Incremental line-buffered decoder
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: BytesMut,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            finished: false,
        }
    }

    /// True once `[DONE]`, an `error` record, or `finish()` has been seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed a chunk of bytes, returning every item completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedItem> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline_pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            let Ok(line) = std::str::from_utf8(&line) else {
                tracing::warn!("Dropping stream line with invalid UTF-8");
                continue;
            };

            if let Some(item) = decode_line(line) {
                let terminal = !matches!(item, DecodedItem::Event(_));
                items.push(item);
                if terminal {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        items
    }

    /// Flush a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Vec<DecodedItem> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let rest = self.buffer.split();
        match std::str::from_utf8(&rest) {
            Ok(line) => decode_line(line.trim()).into_iter().collect(),
            Err(_) => {
                tracing::warn!("Dropping trailing stream bytes with invalid UTF-8");
                Vec::new()
            }
        }
    }
}

/// Decode a byte stream into protocol events.
///
/// The stream ends after `[DONE]`, after an `error` record (yielded as
/// [`Error::Protocol`]), after a read failure (yielded as [`Error::Network`]),
/// or when the input runs out.
pub fn decode_stream<S, B, E>(byte_stream: S) -> ProtocolEventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(stream! {
        let mut byte_stream = Box::pin(byte_stream);
        let mut decoder = StreamDecoder::new();

        while !decoder.is_finished() {
            let items = match byte_stream.next().await {
                Some(Ok(chunk)) => decoder.feed(chunk.as_ref()),
                Some(Err(e)) => {
                    yield Err(Error::Network(e.to_string()));
                    break;
                }
                None => decoder.finish(),
            };

            for item in items {
                match item {
                    DecodedItem::Event(event) => yield Ok(event),
                    DecodedItem::Done => {
                        tracing::debug!("Stream finished with [DONE]");
                    }
                    DecodedItem::Error { error_type, message } => {
                        tracing::debug!(error_type = ?error_type, "Stream terminated by error record");
                        yield Err(Error::Protocol(message));
                    }
                }
            }
        }
    })
}

fn decode_line(line: &str) -> Option<DecodedItem> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    // `event:` and `id:` lines carry nothing the payload does not
    let payload = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))?
        .trim();

    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(DecodedItem::Done);
    }
    decode_payload(payload)
}

fn decode_payload(payload: &str) -> Option<DecodedItem> {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, payload = truncate(payload, 100), "Dropping malformed protocol frame");
            return None;
        }
    };

    let Some(kind) = value.get("type").and_then(|t| t.as_str()).map(str::to_owned) else {
        tracing::warn!(payload = truncate(payload, 100), "Dropping protocol frame without a type");
        return None;
    };

    let decoded = match kind.as_str() {
        "message_start" => parse::<MessageStartRecord>(value).map(|r| ProtocolEvent::MessageStart {
            usage: r.message.and_then(|m| m.usage).map(UsageRecord::into_usage),
        }),
        "content_block_start" => parse::<BlockStartRecord>(value).and_then(|r| {
            let block = match r.content_block.block_type.as_str() {
                "text" => BlockStart::Text,
                "thinking" | "redacted_thinking" => BlockStart::Thinking,
                "tool_use" | "server_tool_use" => BlockStart::ToolUse {
                    id: r.content_block.id.unwrap_or_default(),
                    name: r.content_block.name.unwrap_or_default(),
                },
                other => {
                    tracing::debug!(block_type = other, "Ignoring unknown content block kind");
                    return None;
                }
            };
            Some(ProtocolEvent::ContentBlockStart {
                index: r.index,
                block,
            })
        }),
        "content_block_delta" => parse::<BlockDeltaRecord>(value).and_then(|r| {
            let delta = if let Some(json) = r.delta.partial_json {
                BlockDelta::PartialJson(json)
            } else if let Some(thinking) = r.delta.thinking {
                BlockDelta::Thinking(thinking)
            } else if let Some(text) = r.delta.text {
                BlockDelta::Text(text)
            } else {
                tracing::debug!(delta_type = ?r.delta.delta_type, "Ignoring delta without content");
                return None;
            };
            Some(ProtocolEvent::ContentBlockDelta {
                index: r.index,
                delta,
            })
        }),
        "content_block_stop" => {
            parse::<BlockStopRecord>(value).map(|r| ProtocolEvent::ContentBlockStop { index: r.index })
        }
        "message_delta" => parse::<MessageDeltaRecord>(value).map(|r| {
            let delta = r.delta.unwrap_or_default();
            ProtocolEvent::MessageDelta {
                stop_reason: delta.stop_reason.as_deref().and_then(StopReason::parse),
                usage: delta.usage.or(r.usage).map(UsageRecord::into_usage),
            }
        }),
        "message_stop" => Some(ProtocolEvent::MessageStop),
        "error" => {
            let record = parse::<ErrorRecord>(value);
            let (error_type, message) = match record.and_then(|r| r.error) {
                Some(body) => (body.error_type, body.message),
                None => (None, payload.to_string()),
            };
            return Some(DecodedItem::Error { error_type, message });
        }
        "ping" => None,
        other => {
            tracing::debug!(event_type = other, "Ignoring unknown protocol event");
            None
        }
    };

    decoded.map(DecodedItem::Event)
}

fn parse<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping protocol frame with unexpected shape");
            None
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============================================================================
// Wire records
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartRecord {
    message: Option<MessageInfo>,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: Option<UsageRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UsageRecord {
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

impl UsageRecord {
    fn into_usage(self) -> TokenUsage {
        TokenUsage::new(
            self.input_tokens,
            self.output_tokens,
            self.cache_creation_input_tokens.unwrap_or(0),
            self.cache_read_input_tokens.unwrap_or(0),
        )
    }
}

#[derive(Debug, Deserialize)]
struct BlockStartRecord {
    #[serde(default)]
    index: usize,
    content_block: BlockInfo,
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockDeltaRecord {
    #[serde(default)]
    index: usize,
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockStopRecord {
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaRecord {
    delta: Option<MessageDeltaInfo>,
    usage: Option<UsageRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaInfo {
    stop_reason: Option<String>,
    usage: Option<UsageRecord>,
}

#[derive(Debug, Deserialize)]
struct ErrorRecord {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(items: Vec<DecodedItem>) -> Vec<ProtocolEvent> {
        items
            .into_iter()
            .filter_map(|i| match i {
                DecodedItem::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    const TOOL_USE_FRAMES: &str = concat!(
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"Read\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"file_\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"path\\\":\\\"a.\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"txt\\\"}\"}}\n\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "data: {\"type\":\"message_stop\"}\n\n",
        "data: [DONE]\n\n",
    );

    #[test]
    fn test_decodes_tool_use_sequence() {
        let mut decoder = StreamDecoder::new();
        let items = decoder.feed(TOOL_USE_FRAMES.as_bytes());
        assert_eq!(items.last(), Some(&DecodedItem::Done));

        let events = events(items);
        assert_eq!(events.len(), 6);
        assert_eq!(
            events[0],
            ProtocolEvent::ContentBlockStart {
                index: 0,
                block: BlockStart::ToolUse {
                    id: "toolu_1".into(),
                    name: "Read".into()
                }
            }
        );
        assert_eq!(
            events[1],
            ProtocolEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::PartialJson("{\"file_".into())
            }
        );
        assert_eq!(events[5], ProtocolEvent::MessageStop);
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_frames_split_at_every_offset() {
        let bytes = TOOL_USE_FRAMES.as_bytes();
        let mut whole = StreamDecoder::new();
        let expected = whole.feed(bytes);

        for split in 1..bytes.len() {
            let mut decoder = StreamDecoder::new();
            let mut items = decoder.feed(&bytes[..split]);
            items.extend(decoder.feed(&bytes[split..]));
            assert_eq!(items, expected, "split at {split}");
        }
    }

    #[test]
    fn test_multibyte_character_split_across_reads() {
        let frame = "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"h\u{e9}llo \u{1f600}\"}}\n";
        let bytes = frame.as_bytes();
        let accent = frame.find('\u{e9}').unwrap();

        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(&bytes[..accent + 1]).is_empty());
        let items = decoder.feed(&bytes[accent + 1..]);
        assert_eq!(
            events(items),
            vec![ProtocolEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Text("h\u{e9}llo \u{1f600}".into())
            }]
        );
    }

    #[test]
    fn test_malformed_json_is_dropped() {
        let mut decoder = StreamDecoder::new();
        let items = decoder.feed(b"data: {not json\n\ndata: {\"type\":\"message_stop\"}\n\n");
        assert_eq!(items, vec![DecodedItem::Event(ProtocolEvent::MessageStop)]);
        assert!(!decoder.is_finished());
    }

    #[test]
    fn test_error_record_terminates() {
        let mut decoder = StreamDecoder::new();
        let items = decoder.feed(
            b"data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        assert_eq!(
            items,
            vec![DecodedItem::Error {
                error_type: Some("overloaded_error".into()),
                message: "Overloaded".into()
            }]
        );
        assert!(decoder.is_finished());
        assert!(decoder.feed(b"data: {\"type\":\"message_stop\"}\n").is_empty());
    }

    #[test]
    fn test_ignores_comments_event_lines_ping_and_unknown() {
        let mut decoder = StreamDecoder::new();
        let items = decoder.feed(
            b": keepalive\r\nevent: ping\r\ndata: {\"type\":\"ping\"}\r\n\r\ndata:{\"type\":\"mystery\"}\r\ndata:{\"type\":\"message_stop\"}\r\n",
        );
        assert_eq!(items, vec![DecodedItem::Event(ProtocolEvent::MessageStop)]);
    }

    #[test]
    fn test_message_delta_usage_locations() {
        let mut decoder = StreamDecoder::new();
        let items = decoder.feed(concat!(
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":42}}\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":3}}}\n",
        ).as_bytes());
        assert_eq!(
            events(items),
            vec![
                ProtocolEvent::MessageDelta {
                    stop_reason: Some(StopReason::ToolUse),
                    usage: Some(TokenUsage::new(0, 42, 0, 0)),
                },
                ProtocolEvent::MessageDelta {
                    stop_reason: None,
                    usage: Some(TokenUsage::new(10, 3, 0, 0)),
                },
            ]
        );
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(b"data: {\"type\":\"message_stop\"}").is_empty());
        assert_eq!(
            decoder.finish(),
            vec![DecodedItem::Event(ProtocolEvent::MessageStop)]
        );
        assert!(decoder.finish().is_empty());
    }

    #[tokio::test]
    async fn test_decode_stream_stops_at_done() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":7,\"output_tokens\":1}}}\n".to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
            Ok(b"data: {\"type\":\"message_stop\"}\n".to_vec()),
        ];
        let stream = decode_stream(futures::stream::iter(chunks));
        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected.len(), 1);
        assert!(matches!(
            &collected[0],
            Ok(ProtocolEvent::MessageStart { usage: Some(u) }) if u.input == 7
        ));
    }

    #[tokio::test]
    async fn test_decode_stream_surfaces_errors() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"type\":\"message_stop\"}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(b"data: {\"type\":\"message_stop\"}\n".to_vec()),
        ];
        let collected: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(collected.len(), 2);
        assert!(matches!(collected[1], Err(Error::Network(_))));

        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![Ok(
            b"data: {\"type\":\"error\",\"error\":{\"message\":\"prompt is too long\"}}\n".to_vec(),
        )];
        let collected: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(collected.len(), 1);
        assert!(matches!(&collected[0], Err(e @ Error::Protocol(_)) if e.is_context_overflow()));
    }
}
