//! Token estimation for content blocks and message lists
//!
//! A chars/4 heuristic with small structural overheads. Estimates only ever
//! add, so the estimate of a history never shrinks when a message is appended.

use tern_ai::{ContentBlock, Message, Role};

/// Characters per token for plain text
const CHARS_PER_TOKEN: usize = 4;
/// Structure around a tool use (id, name, wrapper)
const TOOL_USE_OVERHEAD: u64 = 10;
/// Structure around a tool result
const TOOL_RESULT_OVERHEAD: u64 = 8;

/// Estimate tokens for a piece of text (zero for empty text, at least one otherwise)
pub fn estimate_text(text: &str) -> u64 {
    text.len().div_ceil(CHARS_PER_TOKEN) as u64
}

/// Estimate tokens for one content block
pub fn estimate_block(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } | ContentBlock::Thinking { text } => estimate_text(text),
        ContentBlock::ToolUse { name, input, .. } => {
            let input_len = serde_json::to_string(input).map(|s| s.len()).unwrap_or(0);
            TOOL_USE_OVERHEAD + estimate_text(name) + input_len.div_ceil(CHARS_PER_TOKEN) as u64
        }
        ContentBlock::ToolResult { content, .. } => TOOL_RESULT_OVERHEAD + estimate_text(content),
    }
}

/// Estimate tokens for a single message, including its role overhead
pub fn estimate_tokens(message: &Message) -> u64 {
    let role_overhead = match message.role {
        Role::System => 4,
        Role::User => 3,
        Role::Assistant => 5,
    };
    role_overhead + message.content.iter().map(estimate_block).sum::<u64>()
}

/// Estimate total tokens for a slice of messages
pub fn estimate_total_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_estimate_rounds_up() {
        assert_eq!(estimate_text(""), 0);
        assert_eq!(estimate_text("a"), 1);
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
    }

    #[test]
    fn test_block_estimates_include_overhead() {
        let tool_use = ContentBlock::tool_use("t1", "Read", json!({"file_path": "a.txt"}));
        assert!(estimate_block(&tool_use) > TOOL_USE_OVERHEAD);
        let result = ContentBlock::tool_result("t1", "", false);
        assert_eq!(estimate_block(&result), TOOL_RESULT_OVERHEAD);
    }

    #[test]
    fn test_message_estimate() {
        let msg = Message::user("x".repeat(400));
        assert_eq!(estimate_tokens(&msg), 103);
    }

    #[test]
    fn test_estimate_monotonic_under_append() {
        let mut history = Vec::new();
        let mut last = estimate_total_tokens(&history);
        let samples = [
            Message::user("hello"),
            Message::assistant(""),
            Message::new(Role::Assistant, vec![ContentBlock::tool_use("t", "LS", json!({}))]),
            Message::user_tool_results(vec![ContentBlock::tool_result("t", "a\nb", false)]),
            Message::system("summary"),
        ];
        for msg in samples {
            history.push(msg);
            let now = estimate_total_tokens(&history);
            assert!(now > last);
            last = now;
        }
    }
}
