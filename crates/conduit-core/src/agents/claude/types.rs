//! Serde views of Claude Code's `--output-format stream-json` lines.
//!
//! Every line is one JSON object with a `type` discriminator:
//!
//! ```json
//! {"type":"system","subtype":"init","session_id":"s-1","model":"claude-sonnet-4-5","slash_commands":["compact"]}
//! {"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hi"}]}}
//! {"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}
//! {"type":"result","subtype":"success","result":"Done","total_cost_usd":0.01,"modelUsage":{...}}
//! ```
//!
//! # Rust Concept: Serde Field Attributes
//!
//! - `#[serde(rename = "type")]`: `type` is a Rust keyword, so the field gets
//!   another name and serde maps the JSON key onto it.
//! - `#[serde(default)]`: a missing key becomes `Default::default()` (`None`
//!   for options) instead of failing the whole line.

use std::collections::HashMap;

use serde::Deserialize;

use crate::usage::ModelUsage;

/// One stdout line from Claude Code.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeStreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub subtype: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    /// Model name (`system/init` only).
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub slash_commands: Option<Vec<String>>,

    /// Message body for `assistant` and `user` lines.
    #[serde(default)]
    pub message: Option<Message>,

    /// Raw API stream event (`stream_event` lines, with `--include-partial-messages`).
    #[serde(default)]
    pub event: Option<StreamEvent>,

    /// Final text for `result` lines.
    #[serde(default)]
    pub result: Option<String>,

    #[serde(default)]
    pub is_error: Option<bool>,

    /// Error details for `error_*` result subtypes.
    #[serde(default)]
    pub errors: Option<Vec<String>>,

    #[serde(default)]
    pub total_cost_usd: Option<f64>,

    /// Turn-level usage (snake_case, unlike `modelUsage`).
    #[serde(default)]
    pub usage: Option<TurnUsage>,

    /// Per-model usage keyed by model name.
    #[serde(default, rename = "modelUsage")]
    pub model_usage: Option<HashMap<String, ModelUsage>>,
}

/// A chat message with its content blocks.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub content: MessageContent,
}

/// Message content is usually a block list, but user echoes may be a bare string.
///
/// # Rust Concept: Untagged Enums
///
/// `#[serde(untagged)]` tries each variant in order and keeps the first one
/// that deserializes. No discriminator field is needed.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

impl MessageContent {
    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Blocks(blocks) => blocks.as_slice(),
            MessageContent::Text(_) => &[],
        }
    }
}

/// One content block (`text`, `thinking`, `tool_use`, `tool_result`).
///
/// Fields not used by a block type stay `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub thinking: Option<String>,

    /// Tool call id (`tool_use`).
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub input: Option<serde_json::Value>,

    /// Id of the call this result answers (`tool_result`).
    #[serde(default)]
    pub tool_use_id: Option<String>,

    /// Tool output: a string or a list of text blocks (`tool_result`).
    #[serde(default)]
    pub content: Option<serde_json::Value>,

    #[serde(default)]
    pub is_error: Option<bool>,
}

impl ContentBlock {
    /// Flatten `tool_result` content into plain text.
    pub fn result_text(&self) -> String {
        match &self.content {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(other) if !other.is_null() => other.to_string(),
            _ => String::new(),
        }
    }
}

/// An Anthropic API stream event wrapped in a `stream_event` line.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub delta: Option<Delta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    /// "text_delta", "thinking_delta", "input_json_delta", ...
    #[serde(rename = "type")]
    pub delta_type: String,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub thinking: Option<String>,
}

/// Turn-level usage block on `result` lines.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl From<&TurnUsage> for ModelUsage {
    fn from(usage: &TurnUsage) -> Self {
        ModelUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
            ..Default::default()
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_event() {
        let json = r#"{"type":"system","subtype":"init","session_id":"s-1","model":"claude-sonnet-4-5","slash_commands":["compact","review"],"tools":["Bash"]}"#;
        let event: ClaudeStreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.subtype.as_deref(), Some("init"));
        assert_eq!(event.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(event.slash_commands.unwrap().len(), 2);
    }

    #[test]
    fn parse_user_string_content() {
        let json = r#"{"type":"user","message":{"role":"user","content":"hello"}}"#;
        let event: ClaudeStreamEvent = serde_json::from_str(json).unwrap();
        assert!(event.message.unwrap().content.blocks().is_empty());
    }

    #[test]
    fn tool_result_text_from_blocks() {
        let json = r#"{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#;
        let block: ContentBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.result_text(), "a\nb");
    }

    #[test]
    fn parse_result_with_model_usage() {
        let json = r#"{
            "type": "result",
            "subtype": "success",
            "result": "Done",
            "total_cost_usd": 0.12,
            "usage": {"input_tokens": 3, "output_tokens": 4},
            "modelUsage": {
                "claude-sonnet-4-5": {"inputTokens": 100, "outputTokens": 10, "costUSD": 0.1, "contextWindow": 200000}
            }
        }"#;
        let event: ClaudeStreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.usage.unwrap().output_tokens, 4);
        let models = event.model_usage.unwrap();
        assert_eq!(models["claude-sonnet-4-5"].input_tokens, 100);
    }

    #[test]
    fn parse_stream_event_delta() {
        let json = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}}"#;
        let event: ClaudeStreamEvent = serde_json::from_str(json).unwrap();
        let delta = event.event.unwrap().delta.unwrap();
        assert_eq!(delta.delta_type, "thinking_delta");
        assert_eq!(delta.thinking.as_deref(), Some("hmm"));
    }
}
