//! The line-parser contract and the helpers every parser shares.
//!
//! Line-based agents print one JSON object per stdout line with no formal
//! schema. A parser turns each line into zero or one [`NormalizedEvent`], and
//! separately answers "is this line (or this exit) an error?".
//!
//! # Lifecycle
//!
//! One parser instance exists per agent *type* and is reused for sequential
//! runs. Call [`OutputParser::reset`] before each run: correlation state from
//! the previous run must never leak into the next one.
//!
//! # Rust Concept: Trait Objects
//!
//! The process runner only knows it has "some parser". `Box<dyn OutputParser>`
//! stores any type implementing the trait behind one pointer, and calls go
//! through a vtable. The `Send` bound lets the box move into the tokio task
//! that reads stdout.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::claude::ClaudeParser;
use super::codex::CodexParser;
use super::errors::{AgentErrorType, ClassifiedError, ErrorPattern, ErrorPatternProvider};
use super::event::NormalizedEvent;
use super::AgentKind;
use crate::config::AgentConfigSource;

/// Maximum characters of tool output forwarded in a single event.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 10_000;

/// Converts raw agent stdout into normalized events.
pub trait OutputParser: Send {
    fn agent(&self) -> AgentKind;

    /// Parse one stdout line. Non-JSON lines become plain `Text`; blank lines
    /// produce nothing.
    fn parse_line(&mut self, line: &str) -> Option<NormalizedEvent>;

    /// Every event one line produces. Most lines map to at most one event,
    /// but a parser may override this when a single line batches several.
    fn parse_events(&mut self, line: &str) -> Vec<NormalizedEvent> {
        self.parse_line(line).into_iter().collect()
    }

    /// Classify a line only when it carries a structured error report.
    fn detect_error_from_line(&self, line: &str) -> Option<ClassifiedError>;

    /// Classify a process exit. Always `Some` for non-zero codes.
    fn detect_error_from_exit(
        &self,
        code: i32,
        stderr: &str,
        stdout: &str,
    ) -> Option<ClassifiedError>;

    /// Clear per-run state and refresh cached configuration.
    fn reset(&mut self);
}

/// A parser shared between the runs of one agent type.
///
/// The mutex serializes access: two runs of the same agent never feed the
/// same parser at once.
pub type SharedParser = Arc<Mutex<Box<dyn OutputParser>>>;

/// Build the parser for a line-based agent.
///
/// Returns `None` for agents that are driven over ACP and need no parser.
pub fn parser_for(
    agent: AgentKind,
    patterns: Arc<dyn ErrorPatternProvider>,
    config: Arc<dyn AgentConfigSource>,
) -> Option<Box<dyn OutputParser>> {
    match agent {
        AgentKind::ClaudeCode => Some(Box::new(ClaudeParser::new(patterns, config))),
        AgentKind::Codex => Some(Box::new(CodexParser::new(patterns, config))),
        _ => None,
    }
}

/// Wrap a parser for sharing across runs.
pub fn shared(parser: Box<dyn OutputParser>) -> SharedParser {
    Arc::new(Mutex::new(parser))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Truncate tool output to [`MAX_TOOL_OUTPUT_CHARS`], appending a marker with
/// the original size.
pub fn truncate_tool_output(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_TOOL_OUTPUT_CHARS {
        return output.to_string();
    }
    let kept: String = output.chars().take(MAX_TOOL_OUTPUT_CHARS).collect();
    format!("{}\n... [output truncated, {} chars total]", kept, total)
}

/// Insert paragraph breaks before `**Section**` headings in reasoning text.
///
/// A heading is a bold span that ends its line. Inline bold is untouched and
/// only whitespace ever changes.
pub fn format_reasoning_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut rest = text;

    while let Some(start) = rest.find("**") {
        let after_open = &rest[start + 2..];
        let Some(close) = after_open.find("**") else {
            break;
        };
        let title = &after_open[..close];
        let end = start + 2 + close + 2;
        let tail = &rest[end..];
        let is_heading = !title.trim().is_empty()
            && !title.contains('\n')
            && (tail.is_empty() || tail.starts_with('\n'));

        out.push_str(&rest[..start]);
        if is_heading && !out.trim_end().is_empty() && !out.ends_with("\n\n") {
            let trimmed = out.trim_end().len();
            out.truncate(trimmed);
            out.push_str("\n\n");
        }
        out.push_str(&rest[start..end]);
        rest = tail;
    }

    out.push_str(rest);
    out
}

/// Parse a line as a JSON object, skipping blank and non-object lines.
pub fn parse_json_object(line: &str) -> Option<Value> {
    serde_json::from_str::<Value>(line.trim())
        .ok()
        .filter(Value::is_object)
}

/// Find a JSON object in `text`, either the whole text or one embedded after
/// leading prose (e.g. `API Error: 400 {"type":"error",...}`).
pub fn extract_json_object(text: &str) -> Option<Value> {
    if let Some(value) = parse_json_object(text) {
        return Some(value);
    }
    text.match_indices('{').find_map(|(i, _)| {
        serde_json::Deserializer::from_str(&text[i..])
            .into_iter::<Value>()
            .next()
            .and_then(Result::ok)
            .filter(Value::is_object)
    })
}

fn message_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| map.get("error").and_then(message_of)),
        _ => None,
    }
}

/// If `value` is a recognizable error report, return its message.
///
/// Recognized shapes:
/// - `{"type":"error", "error":{...}|"message":...}`
/// - `{"error":{"message":...}}` / `{"error":"..."}`
/// - `{"type":"turn.failed", "error":{"message":...}}`
/// - `{"msg":{"type":"error"|"stream_error","message":...}}`
/// - `{"type":"result","is_error":true,"result":...}`
pub fn structured_error_message(value: &Value) -> Option<String> {
    let ty = value.get("type").and_then(Value::as_str);

    if let Some(msg) = value.get("msg") {
        let inner = msg.get("type").and_then(Value::as_str);
        if matches!(inner, Some("error") | Some("stream_error")) {
            return Some(message_of(msg).unwrap_or_else(|| msg.to_string()));
        }
    }

    match ty {
        Some("result") => {
            if value.get("is_error").and_then(Value::as_bool) == Some(true) {
                let text = value
                    .get("result")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .or_else(|| value.get("subtype").and_then(Value::as_str).map(str::to_string));
                return Some(text.unwrap_or_else(|| "Agent reported an error".to_string()));
            }
            None
        }
        Some("error") | Some("turn.failed") => {
            Some(message_of(value).unwrap_or_else(|| value.to_string()))
        }
        _ => match value.get("error") {
            Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
            Some(e @ Value::Object(_)) => Some(message_of(e).unwrap_or_else(|| e.to_string())),
            // flags like `"error": false` are not reports
            _ => None,
        },
    }
}

/// Pattern-driven error classification for one agent.
///
/// Both parsers own one of these; it caches the agent's pattern list and
/// refreshes it on reset.
pub struct ErrorDetector {
    agent: AgentKind,
    provider: Arc<dyn ErrorPatternProvider>,
    patterns: Vec<ErrorPattern>,
}

impl ErrorDetector {
    pub fn new(agent: AgentKind, provider: Arc<dyn ErrorPatternProvider>) -> Self {
        let patterns = provider.patterns(agent);
        Self {
            agent,
            provider,
            patterns,
        }
    }

    pub fn refresh(&mut self) {
        self.patterns = self.provider.patterns(self.agent);
    }

    /// Classify free text. `None` when no pattern matches.
    pub fn classify_text(&self, text: &str) -> Option<ClassifiedError> {
        self.provider
            .match_text(&self.patterns, text)
            .map(|m| ClassifiedError::from_match(m, self.agent))
    }

    /// Classify a structured error message, falling back to `unknown`.
    fn classify_structured(&self, message: String, raw: &str) -> ClassifiedError {
        self.classify_text(&message)
            .unwrap_or_else(|| {
                ClassifiedError::new(AgentErrorType::Unknown, message, true, self.agent)
            })
            .with_raw(raw)
    }

    /// Structured-only line detection. Free text never matches, even if it
    /// happens to contain error vocabulary.
    pub fn from_line(&self, line: &str) -> Option<ClassifiedError> {
        let value = extract_json_object(line)?;
        let message = structured_error_message(&value)?;
        Some(self.classify_structured(message, line.trim()))
    }

    /// Exit classification: 0 is fine, anything else is always some error.
    pub fn from_exit(&self, code: i32, stderr: &str, stdout: &str) -> Option<ClassifiedError> {
        if code == 0 {
            return None;
        }

        if let Some(message) = extract_json_object(stderr)
            .as_ref()
            .and_then(structured_error_message)
        {
            return Some(self.classify_structured(message, stderr.trim()));
        }

        let combined = format!("{}\n{}", stderr, stdout);
        if let Some(err) = self.classify_text(&combined) {
            return Some(err.with_raw(combined.trim()));
        }

        let err = ClassifiedError::crashed(code, self.agent);
        let combined = combined.trim();
        Some(if combined.is_empty() {
            err
        } else {
            err.with_raw(combined)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
