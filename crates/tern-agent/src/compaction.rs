//! Context compaction for long conversations
//!
//! When a history grows past the token threshold, the older part is replaced
//! by a structured summary. The cut point is chosen by scoring candidate
//! indices around a target ratio; tool-use/tool-result pairs and chained
//! tool sequences are never split.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use chrono::Duration as ChronoDuration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tern_ai::{ContentBlock, Message, Role};

use crate::error::{Error, Result};
use crate::permission::split_command;
use crate::tokens::estimate_total_tokens;

/// Configuration for context compaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Whether compaction is enabled
    pub enabled: bool,
    /// Estimated tokens at which compaction triggers
    pub token_threshold: u64,
    /// Message count above which compaction triggers regardless of tokens
    pub max_messages: usize,
    /// Never compact histories shorter than this
    pub min_messages: usize,
    /// Where the boundary search is centred, as a fraction of the history
    pub target_ratio: f64,
    /// Candidates scanned on each side of the target
    pub window: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_threshold: 150_000,
            max_messages: 500,
            min_messages: 10,
            target_ratio: 0.5,
            window: 5,
        }
    }
}

/// Reason for compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    /// History crossed the token or message threshold
    Threshold,
    /// The model rejected the request as too long
    Overflow,
    /// Requested by the caller
    Manual,
}

/// Index of the first kept message, with the score that chose it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionBoundary {
    pub index: usize,
    pub score: i32,
}

/// What a compaction did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub original_count: usize,
    pub compacted_count: usize,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub token_savings: u64,
    pub boundary: CompactionBoundary,
}

// --- Scoring weights ---

const CLOSES_TOOL_TURN: i32 = 50;
const AFTER_ASSISTANT: i32 = 30;
const SPLITS_PAIR: i32 = -100;
const NATURAL_BREAK: i32 = 20;
const NEAR_ERROR: i32 = -30;
const TOPIC_CHANGE: i32 = 25;

/// Errors this close to a candidate count against it
const ERROR_PROXIMITY: usize = 2;
/// Similarity below which consecutive user requests count as a topic change
const TOPIC_OVERLAP_THRESHOLD: f64 = 0.1;
const TRANSITION_PHRASES: &[&str] = &[
    "now", "next", "new task", "switching", "moving on", "let's", "another", "unrelated",
];

/// Boundary-scoring compactor
#[derive(Debug, Clone, Default)]
pub struct ContextCompactor {
    config: CompactionConfig,
}

impl ContextCompactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// True when the history is over a threshold and long enough to compact
    pub fn needs_compaction(&self, messages: &[Message]) -> bool {
        if !self.config.enabled || messages.len() < self.config.min_messages {
            return false;
        }
        messages.len() > self.config.max_messages
            || estimate_total_tokens(messages) >= self.config.token_threshold
    }

    /// Best cut point near the target, or `None` if every candidate would split a pair or chain
    pub fn find_boundary(&self, messages: &[Message]) -> Option<CompactionBoundary> {
        let len = messages.len();
        if len < 2 {
            return None;
        }
        let pairs = ToolPairs::index(messages);
        let target = ((len as f64) * self.config.target_ratio.clamp(0.0, 1.0)).floor() as usize;
        let low = target.saturating_sub(self.config.window).max(1);
        let high = (target + self.config.window).min(len - 1);

        let mut best: Option<(CompactionBoundary, usize)> = None;
        for index in low..=high {
            let Some(score) = score_candidate(messages, &pairs, index) else {
                continue;
            };
            let distance = index.abs_diff(target);
            let better = match &best {
                None => true,
                Some((current, current_distance)) => {
                    score > current.score || (score == current.score && distance < *current_distance)
                }
            };
            if better {
                best = Some((CompactionBoundary { index, score }, distance));
            }
        }
        best.map(|(boundary, _)| boundary)
    }

    /// Rewrite the history as `[summary, preserved criticals, kept tail]`
    pub fn compact(&self, messages: &[Message]) -> Result<(Vec<Message>, CompactionReport)> {
        let boundary = self
            .find_boundary(messages)
            .ok_or_else(|| Error::Compaction("no acceptable boundary near the target".to_string()))?;

        let (older, kept) = messages.split_at(boundary.index);
        let digest = Digest::collect(older);

        let mut compacted = Vec::with_capacity(kept.len() + 2);
        compacted.push(Message::system(digest.summary(older.len())));
        if let Some(preserved) = digest.preserved_block() {
            compacted.push(Message::system(preserved));
        }
        compacted.extend_from_slice(kept);

        let tokens_before = estimate_total_tokens(messages);
        let tokens_after = estimate_total_tokens(&compacted);
        let report = CompactionReport {
            original_count: messages.len(),
            compacted_count: compacted.len(),
            tokens_before,
            tokens_after,
            token_savings: tokens_before.saturating_sub(tokens_after),
            boundary,
        };
        tracing::info!(
            original = report.original_count,
            compacted = report.compacted_count,
            tokens_before,
            tokens_after,
            boundary = boundary.index,
            score = boundary.score,
            "Compacted conversation history"
        );
        Ok((compacted, report))
    }
}

/// Where each tool use and its result live
struct ToolPairs {
    /// tool_use_id -> (use message, result message)
    spans: Vec<(usize, usize)>,
}

impl ToolPairs {
    fn index(messages: &[Message]) -> Self {
        let mut uses: HashMap<&str, usize> = HashMap::new();
        let mut spans = Vec::new();
        for (i, message) in messages.iter().enumerate() {
            for (id, _, _) in message.tool_uses() {
                uses.insert(id, i);
            }
            for (id, _, _) in message.tool_results() {
                if let Some(&use_index) = uses.get(id) {
                    spans.push((use_index, i));
                }
            }
        }
        Self { spans }
    }

    /// Would cutting before `index` separate a use from its result?
    fn splits(&self, index: usize) -> bool {
        self.spans.iter().any(|&(u, r)| u < index && r >= index)
    }
}

/// Score for cutting before `index`; `None` if the cut would split a pair or chain
fn score_candidate(messages: &[Message], pairs: &ToolPairs, index: usize) -> Option<i32> {
    let prev = &messages[index - 1];
    let next = &messages[index];

    let splits_chain = prev.has_tool_result() && next.role == Role::Assistant && next.has_tool_use();
    if pairs.splits(index) || splits_chain {
        tracing::trace!(index, score = SPLITS_PAIR, "Candidate splits a tool sequence");
        return None;
    }

    let mut score = 0;
    if prev.has_tool_result() {
        score += CLOSES_TOOL_TURN;
    }
    if prev.role == Role::Assistant {
        score += AFTER_ASSISTANT;
    }

    let topic_change = is_topic_change(messages, index);
    let user_to_user = prev.role == Role::User && next.role == Role::User;
    let long_gap = next.created_at - prev.created_at > ChronoDuration::minutes(5);
    if user_to_user || topic_change || long_gap {
        score += NATURAL_BREAK;
    }

    let near = index.saturating_sub(ERROR_PROXIMITY)..=(index + ERROR_PROXIMITY).min(messages.len() - 1);
    if messages[near].iter().any(Message::has_error_result) {
        score += NEAR_ERROR;
    }

    if topic_change {
        score += TOPIC_CHANGE;
    }
    Some(score)
}

/// User request text, ignoring tool-result carriers
fn user_request(message: &Message) -> Option<String> {
    if message.role != Role::User || message.has_tool_result() {
        return None;
    }
    let text = message.text();
    (!text.trim().is_empty()).then_some(text)
}

fn is_topic_change(messages: &[Message], index: usize) -> bool {
    let Some(current) = user_request(&messages[index]) else {
        return false;
    };
    let lowered = current.trim_start().to_lowercase();
    if TRANSITION_PHRASES.iter().any(|p| starts_with_phrase(&lowered, p)) {
        return true;
    }

    let Some(previous) = messages[..index].iter().rev().find_map(user_request) else {
        return false;
    };
    let current_words = word_set(&current);
    if current_words.is_empty() {
        return false;
    }
    let previous_words = word_set(&previous);
    let shared = current_words.intersection(&previous_words).count();
    (shared as f64) / (current_words.len() as f64) < TOPIC_OVERLAP_THRESHOLD
}

fn starts_with_phrase(text: &str, phrase: &str) -> bool {
    text.strip_prefix(phrase)
        .is_some_and(|rest| rest.is_empty() || !rest.starts_with(|c: char| c.is_alphanumeric()))
}

fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

// --- Summarization ---

/// Tools that only read files
const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS"];
/// Tools that modify files
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];
const PATH_KEYS: &[&str] = &["file_path", "path", "notebook_path"];

const RECENT_REQUESTS: usize = 3;
const REQUEST_PREVIEW_CHARS: usize = 200;
const ERROR_PREVIEW_CHARS: usize = 160;
const MAX_ERRORS_LISTED: usize = 10;
const PRESERVED_HEADER: &str = "[Preserved tool calls from compacted history]";

/// Shell commands that change the system
static MUTATING_COMMANDS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\s*(sudo\s+)?(rm|mv|cp|mkdir|rmdir|touch|chmod|chown|ln|dd|truncate)\b",
        r"^\s*git\s+(commit|push|reset|checkout|merge|rebase|revert|tag|branch\s+-[dD]|stash|clean|apply|am)\b",
        r"^\s*(npm|pnpm|yarn|pip|pip3|cargo|apt|apt-get|brew)\s+(install|uninstall|remove|add|publish)\b",
        r"(^|[^>])>{1,2}\s*[^\s&|]",
        r"\bsed\s+(-[a-zA-Z]*i|--in-place)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Checked per simple command, so `cd build && rm -rf out` counts
fn is_mutating_command(command: &str) -> bool {
    split_command(command)
        .iter()
        .any(|part| MUTATING_COMMANDS.iter().any(|re| re.is_match(part)))
}

struct CriticalCall {
    name: String,
    input: String,
    outcome: Option<(String, bool)>,
}

/// Everything the summary needs from the compacted prefix
#[derive(Default)]
struct Digest {
    user_messages: usize,
    assistant_messages: usize,
    tool_calls: usize,
    errors: usize,
    requests: Vec<String>,
    files_read: Vec<String>,
    files_modified: Vec<String>,
    tool_counts: BTreeMap<String, usize>,
    /// System text from the compacted prefix, e.g. an earlier summary
    earlier_context: Vec<String>,
    /// Preserved-call lines carried over from an earlier compaction
    carried_calls: Vec<String>,
    error_messages: Vec<String>,
    critical: Vec<CriticalCall>,
}

impl Digest {
    fn collect(messages: &[Message]) -> Self {
        let mut digest = Digest::default();
        let mut results: HashMap<&str, (&str, bool)> = HashMap::new();
        for message in messages {
            if message.role == Role::System {
                digest.carry_forward(&message.text());
                continue;
            }
            if let Some(request) = user_request(message) {
                digest.user_messages += 1;
                digest.requests.push(request);
            }
            if message.role == Role::Assistant && !message.text().trim().is_empty() {
                digest.assistant_messages += 1;
            }
            for block in &message.content {
                if let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = block
                {
                    results.insert(tool_use_id.as_str(), (content.as_str(), *is_error));
                    if *is_error {
                        digest.errors += 1;
                        if digest.error_messages.len() < MAX_ERRORS_LISTED {
                            digest.error_messages.push(truncate(content, ERROR_PREVIEW_CHARS));
                        }
                    }
                }
            }
        }

        for message in messages {
            for (id, name, input) in message.tool_uses() {
                digest.tool_calls += 1;
                *digest.tool_counts.entry(name.to_string()).or_default() += 1;
                digest.record_file_operation(name, input);

                let outcome = results.get(id).copied();
                let failed = outcome.is_some_and(|(_, is_error)| is_error);
                if is_critical(name, input) || failed {
                    digest.critical.push(CriticalCall {
                        name: name.to_string(),
                        input: serde_json::to_string(input).unwrap_or_default(),
                        outcome: outcome.map(|(content, is_error)| (truncate(content, ERROR_PREVIEW_CHARS), is_error)),
                    });
                }
            }
        }
        digest
    }

    fn carry_forward(&mut self, text: &str) {
        match text.trim().strip_prefix(PRESERVED_HEADER) {
            Some(calls) => self
                .carried_calls
                .extend(calls.lines().filter(|line| !line.trim().is_empty()).map(str::to_string)),
            None if !text.trim().is_empty() => self.earlier_context.push(text.trim().to_string()),
            None => {}
        }
    }

    fn record_file_operation(&mut self, name: &str, input: &serde_json::Value) {
        let Some(path) = PATH_KEYS
            .iter()
            .find_map(|key| input.get(*key).and_then(|v| v.as_str()))
        else {
            return;
        };
        let list = if READ_TOOLS.contains(&name) {
            &mut self.files_read
        } else if WRITE_TOOLS.contains(&name) {
            &mut self.files_modified
        } else {
            return;
        };
        if !list.iter().any(|p| p == path) {
            list.push(path.to_string());
        }
    }

    fn summary(&self, compacted: usize) -> String {
        let mut out = format!("[Conversation summary: {compacted} earlier messages were compacted]\n\n");
        out.push_str(&format!(
            "Messages: {} user, {} assistant, {} tool calls, {} errors\n",
            self.user_messages, self.assistant_messages, self.tool_calls, self.errors
        ));

        if let Some(first) = self.requests.first() {
            out.push_str(&format!("\nFirst request: {}\n", truncate(first, REQUEST_PREVIEW_CHARS)));
        }
        if self.requests.len() > 1 {
            out.push_str("Latest requests:\n");
            let skip = self.requests.len().saturating_sub(RECENT_REQUESTS).max(1);
            for request in &self.requests[skip..] {
                out.push_str(&format!("- {}\n", truncate(request, REQUEST_PREVIEW_CHARS)));
            }
        }

        out.push_str(&format!("\nFiles read: {}\n", list_or_none(&self.files_read)));
        out.push_str(&format!("Files modified: {}\n", list_or_none(&self.files_modified)));

        if !self.tool_counts.is_empty() {
            let tools: Vec<String> = self
                .tool_counts
                .iter()
                .map(|(name, count)| format!("{name} x{count}"))
                .collect();
            out.push_str(&format!("Tools used: {}\n", tools.join(", ")));
        }

        if !self.error_messages.is_empty() {
            out.push_str("Errors:\n");
            for error in &self.error_messages {
                out.push_str(&format!("- {error}\n"));
            }
        }

        if !self.earlier_context.is_empty() {
            out.push_str("\nEarlier context:\n");
            for text in &self.earlier_context {
                out.push_str(text);
                out.push('\n');
            }
        }
        out
    }

    /// Critical calls kept as a text block; their results were compacted away
    fn preserved_block(&self) -> Option<String> {
        if self.critical.is_empty() && self.carried_calls.is_empty() {
            return None;
        }
        let mut out = format!("{PRESERVED_HEADER}\n");
        for line in &self.carried_calls {
            out.push_str(line);
            out.push('\n');
        }
        for call in &self.critical {
            out.push_str(&format!("{}({})", call.name, call.input));
            match &call.outcome {
                Some((content, true)) => out.push_str(&format!(" -> error: {content}")),
                Some((content, false)) => out.push_str(&format!(" -> {content}")),
                None => out.push_str(" -> no result"),
            }
            out.push('\n');
        }
        Some(out)
    }
}

fn is_critical(name: &str, input: &serde_json::Value) -> bool {
    if WRITE_TOOLS.contains(&name) {
        return true;
    }
    name == "Bash"
        && input
            .get("command")
            .and_then(|v| v.as_str())
            .is_some_and(is_mutating_command)
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tern_ai::validate_pairing;

    fn user(text: &str) -> Message {
        Message::user(text)
    }

    fn assistant(text: &str) -> Message {
        Message::assistant(text)
    }

    fn tool_call(id: &str, name: &str, input: serde_json::Value) -> Message {
        Message::new(Role::Assistant, vec![ContentBlock::tool_use(id, name, input)])
    }

    fn tool_result(id: &str, content: &str, is_error: bool) -> Message {
        Message::user_tool_results(vec![ContentBlock::tool_result(id, content, is_error)])
    }

    /// Alternating user/assistant exchanges on one subject
    fn exchange_history(count: usize, words_per_message: usize) -> Vec<Message> {
        let filler = "refactor the parser module tokens ".repeat(words_per_message / 5);
        (0..count)
            .map(|i| {
                if i % 2 == 0 {
                    user(&format!("parser request {i} {filler}"))
                } else {
                    assistant(&format!("parser reply {i} {filler}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_needs_compaction_thresholds() {
        let compactor = ContextCompactor::default();
        assert!(!compactor.needs_compaction(&exchange_history(9, 20_000)));
        assert!(!compactor.needs_compaction(&exchange_history(20, 50)));
        assert!(compactor.needs_compaction(&exchange_history(501, 5)));

        let disabled = ContextCompactor::new(CompactionConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!disabled.needs_compaction(&exchange_history(501, 5)));
    }

    #[test]
    fn test_scenario_large_history() {
        // 200 messages of roughly 900 tokens each
        let messages = exchange_history(200, 525);
        let before = estimate_total_tokens(&messages);
        assert!((170_000..=190_000).contains(&before), "fixture has {before} tokens");

        let compactor = ContextCompactor::default();
        assert!(compactor.needs_compaction(&messages));

        let (compacted, report) = compactor.compact(&messages).unwrap();
        assert!((95..=105).contains(&report.boundary.index));
        assert_eq!(report.original_count, 200);
        assert_eq!(report.compacted_count, compacted.len());
        assert!(report.tokens_after <= 135_000);
        assert_eq!(report.token_savings, report.tokens_before - report.tokens_after);
        assert_eq!(compacted[0].role, Role::System);
        assert_eq!(compacted.last(), messages.last());
    }

    #[test]
    fn test_boundary_never_splits_pair_at_any_offset() {
        let compactor = ContextCompactor::default();
        for len in [12usize, 17, 24] {
            for offset in 0..len - 1 {
                let mut messages = exchange_history(len, 10);
                messages.insert(offset, tool_call("t1", "Read", json!({"file_path": "a.rs"})));
                messages.insert(offset + 1, tool_result("t1", "fn main() {}", false));

                if let Some(boundary) = compactor.find_boundary(&messages) {
                    let cut = boundary.index;
                    assert_ne!(cut, offset + 1, "len {len} offset {offset}: boundary splits the pair");
                    let (_, kept) = messages.split_at(cut);
                    validate_pairing(kept).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_chained_tool_sequence_is_not_split() {
        let mut messages = exchange_history(6, 10);
        messages.push(tool_call("a", "Read", json!({"file_path": "x.rs"})));
        messages.push(tool_result("a", "x", false));
        messages.push(tool_call("b", "Read", json!({"file_path": "y.rs"})));
        messages.push(tool_result("b", "y", false));
        messages.push(tool_call("c", "Read", json!({"file_path": "z.rs"})));
        messages.push(tool_result("c", "z", false));
        messages.extend(exchange_history(4, 10));

        let compactor = ContextCompactor::new(CompactionConfig {
            window: 8,
            ..Default::default()
        });
        let boundary = compactor.find_boundary(&messages).unwrap();
        assert!(!(7..=11).contains(&boundary.index), "cut at {}", boundary.index);
    }

    #[test]
    fn test_no_boundary_when_every_candidate_splits() {
        let mut messages = vec![tool_call("long", "Bash", json!({"command": "sleep 100"}))];
        messages.extend(exchange_history(10, 10));
        messages.push(tool_result("long", "done", false));

        let compactor = ContextCompactor::default();
        assert!(compactor.find_boundary(&messages).is_none());
        assert!(matches!(compactor.compact(&messages), Err(Error::Compaction(_))));
    }

    #[test]
    fn test_scoring_prefers_closed_tool_turn() {
        let mut messages = exchange_history(9, 10);
        messages.push(tool_call("r", "Read", json!({"file_path": "lib.rs"})));
        messages.push(tool_result("r", "ok", false));
        messages.extend(exchange_history(9, 10));

        let compactor = ContextCompactor::default();
        let boundary = compactor.find_boundary(&messages).unwrap();
        // After the tool result: +50 for the closed turn, +20 user-to-user
        assert_eq!(boundary.index, 11);
        assert_eq!(boundary.score, CLOSES_TOOL_TURN + NATURAL_BREAK);
    }

    #[test]
    fn test_error_nearby_lowers_score() {
        let messages = vec![
            user("parser one"),
            assistant("parser reply"),
            user("parser two"),
            tool_call("e", "Grep", json!({"pattern": "x"})),
            tool_result("e", "grep failed", true),
            assistant("parser reply"),
            user("parser three"),
            assistant("parser reply"),
            user("parser four"),
            assistant("parser reply"),
        ];
        let pairs = ToolPairs::index(&messages);
        assert_eq!(score_candidate(&messages, &pairs, 6), Some(AFTER_ASSISTANT + NEAR_ERROR));
        assert_eq!(score_candidate(&messages, &pairs, 8), Some(AFTER_ASSISTANT));
    }

    #[test]
    fn test_topic_change_and_gap() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let messages = vec![
            user("fix the tokenizer bug in lexer").with_created_at(start),
            assistant("done").with_created_at(start),
            user("Now write release notes").with_created_at(start),
            assistant("ok").with_created_at(start),
            user("write release notes for tokenizer").with_created_at(start + ChronoDuration::minutes(30)),
        ];
        let pairs = ToolPairs::index(&messages);
        assert!(is_topic_change(&messages, 2));
        assert_eq!(
            score_candidate(&messages, &pairs, 2),
            Some(AFTER_ASSISTANT + NATURAL_BREAK + TOPIC_CHANGE)
        );
        assert!(!is_topic_change(&messages, 4));
        assert_eq!(score_candidate(&messages, &pairs, 4), Some(AFTER_ASSISTANT + NATURAL_BREAK));

        // Low word overlap without a transition phrase
        let drift = vec![user("optimize database indexes"), assistant("ok"), user("translate readme into french")];
        assert!(is_topic_change(&drift, 2));
    }

    #[test]
    fn test_summary_and_preserved_criticals() {
        let mut messages = vec![
            user("please update the config loader"),
            tool_call("r1", "Read", json!({"file_path": "src/config.rs"})),
            tool_result("r1", "struct Config;", false),
            tool_call("w1", "Edit", json!({"file_path": "src/config.rs", "old_string": "a", "new_string": "b"})),
            tool_result("w1", "edited", false),
            tool_call("b1", "Bash", json!({"command": "git commit -am wip"})),
            tool_result("b1", "1 file changed", false),
            tool_call("b2", "Bash", json!({"command": "ls"})),
            tool_result("b2", "src", false),
            tool_call("g1", "Grep", json!({"pattern": "Config"})),
            tool_result("g1", "regex parse error", true),
            assistant("updated the loader"),
        ];
        messages.extend(exchange_history(10, 10));

        let compactor = ContextCompactor::new(CompactionConfig {
            target_ratio: 0.55,
            window: 0,
            ..Default::default()
        });
        let (compacted, report) = compactor.compact(&messages).unwrap();
        assert_eq!(report.boundary.index, 12);

        let summary = compacted[0].text();
        assert!(summary.contains("12 earlier messages"));
        assert!(summary.contains("First request: please update the config loader"));
        assert!(summary.contains("Files read: src/config.rs"));
        assert!(summary.contains("Files modified: src/config.rs"));
        assert!(summary.contains("Bash x2"));
        assert!(summary.contains("- regex parse error"));

        let preserved = compacted[1].text();
        assert_eq!(compacted[1].role, Role::System);
        assert!(preserved.contains("Edit("));
        assert!(preserved.contains("git commit -am wip"));
        assert!(preserved.contains("Grep(") && preserved.contains("-> error: regex parse error"));
        assert!(!preserved.contains(r#""command":"ls""#));

        assert_eq!(&compacted[2..], &messages[12..]);
        validate_pairing(&compacted).unwrap();
    }

    #[test]
    fn test_second_compaction_keeps_earlier_summary_and_criticals() {
        let mut messages = vec![
            user("set up the release branch"),
            tool_call("b1", "Bash", json!({"command": "git commit -am wip"})),
            tool_result("b1", "1 file changed", false),
            assistant("committed the work in progress"),
        ];
        messages.extend(exchange_history(4, 10));

        let first = ContextCompactor::new(CompactionConfig {
            target_ratio: 0.5,
            window: 0,
            ..Default::default()
        });
        let (mut history, report) = first.compact(&messages).unwrap();
        assert_eq!(report.boundary.index, 4);
        assert_eq!(history.len(), 6);
        let first_summary = history[0].text();

        history.extend(exchange_history(10, 10));
        let second = ContextCompactor::new(CompactionConfig {
            target_ratio: 0.375,
            window: 0,
            ..Default::default()
        });
        let (compacted, report) = second.compact(&history).unwrap();
        assert_eq!(report.boundary.index, 6);

        let summary = compacted[0].text();
        assert!(summary.contains("6 earlier messages"));
        assert!(summary.contains("Earlier context:"));
        assert!(summary.contains(first_summary.trim()));
        assert!(summary.contains("First request: set up the release branch"));

        assert_eq!(compacted[1].role, Role::System);
        let preserved = compacted[1].text();
        assert!(preserved.contains("git commit -am wip"));
        assert_eq!(preserved.matches(PRESERVED_HEADER).count(), 1);

        assert_eq!(&compacted[2..], &history[6..]);
        validate_pairing(&compacted).unwrap();
    }

    #[test]
    fn test_mutating_command_detection() {
        assert!(is_mutating_command("rm -rf target"));
        assert!(is_mutating_command("git push origin main"));
        assert!(is_mutating_command("echo hi > out.txt"));
        assert!(is_mutating_command("sed -i 's/a/b/' f"));
        assert!(!is_mutating_command("git status"));
        assert!(!is_mutating_command("ls -la"));
        assert!(!is_mutating_command("cargo test 2>&1"));

        assert!(is_mutating_command("cd build && rm -rf out"));
        assert!(is_mutating_command("cd repo && git push"));
        assert!(is_mutating_command("cargo fmt; git commit -am wip"));
        assert!(is_mutating_command("ls | sudo tee /etc/hosts > /dev/null"));
        assert!(is_mutating_command("(cd web && npm install)"));
        assert!(!is_mutating_command("cd repo && git status | grep modified"));
        assert!(!is_mutating_command("git log --grep 'rm -rf'"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 4), "héll...");
        assert_eq!(truncate("short", 10), "short");
    }
}
