//! Claude Code line parser.
//!
//! # How This Parser Works
//!
//! Each stdout line is deserialized into a [`ClaudeStreamEvent`] and
//! dispatched on its `type`:
//!
//! | line                         | event                                   |
//! |------------------------------|-----------------------------------------|
//! | `system` / `init`            | `Init` (model cached)                   |
//! | `system` / other             | `System`                                |
//! | `assistant`                  | `Text`, else `ToolUse{running}`, else reasoning `Text` |
//! | `user` with `tool_result`    | `ToolUse{completed or error}`           |
//! | `stream_event` deltas        | partial `Text`                          |
//! | `result`                     | `Result` with usage, or `Error`         |
//! | anything else                | `System`                                |
//!
//! Tool results only carry the call id, so the parser remembers
//! `tool_use id -> tool name` from the assistant line and looks it up
//! when the result arrives.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::agents::errors::{ClassifiedError, ErrorPatternProvider};
use crate::agents::event::{NormalizedEvent, ToolState, ToolStatus};
use crate::agents::parser::{
    format_reasoning_text, parse_json_object, truncate_tool_output, ErrorDetector, OutputParser,
};
use crate::agents::AgentKind;
use crate::config::{load_or_default, AgentConfigSource, AgentSettings};
use crate::usage::{aggregate_model_usage, ModelUsage};

use super::types::{ClaudeStreamEvent, Message};

/// Parser state for Claude Code runs.
pub struct ClaudeParser {
    detector: ErrorDetector,
    config: Arc<dyn AgentConfigSource>,
    settings: AgentSettings,

    /// Model reported by the last `system/init` line.
    model: Option<String>,

    /// `tool_use` id -> tool name, for correlating results.
    tool_names: HashMap<String, String>,

    /// Name of the most recent tool call, used when a result lacks an id.
    last_tool_name: Option<String>,
}

impl ClaudeParser {
    pub fn new(patterns: Arc<dyn ErrorPatternProvider>, config: Arc<dyn AgentConfigSource>) -> Self {
        let settings = load_or_default(config.as_ref(), AgentKind::ClaudeCode);
        Self {
            detector: ErrorDetector::new(AgentKind::ClaudeCode, patterns),
            config,
            settings,
            model: None,
            tool_names: HashMap::new(),
            last_tool_name: None,
        }
    }

    /// Model in use: reported by the agent, else configured.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().or(self.settings.model.as_deref())
    }

    /// Window used when no model reports one: configured, else the static default.
    fn default_context_window(&self) -> u64 {
        self.settings
            .context_window
            .unwrap_or_else(|| AgentKind::ClaudeCode.default_context_window())
    }

    fn handle_system(&mut self, event: ClaudeStreamEvent, raw: Value) -> NormalizedEvent {
        if event.subtype.as_deref() != Some("init") {
            return NormalizedEvent::system(raw);
        }
        if event.model.is_some() {
            self.model = event.model;
        }
        NormalizedEvent::Init {
            session_id: event.session_id,
            slash_commands: event.slash_commands,
        }
    }

    /// Assistant messages may mix block types. Text wins, then the first
    /// tool call, then thinking.
    fn handle_assistant(&mut self, message: &Message) -> Option<NormalizedEvent> {
        let blocks = message.content.blocks();

        let text: String = blocks
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();
        if !text.is_empty() {
            return Some(NormalizedEvent::text(text, true));
        }

        let tools: Vec<_> = blocks.iter().filter(|b| b.block_type == "tool_use").collect();
        for tool in &tools {
            if let (Some(id), Some(name)) = (&tool.id, &tool.name) {
                self.tool_names.insert(id.clone(), name.clone());
            }
        }
        if let Some(tool) = tools.first() {
            self.last_tool_name = tool.name.clone();
            return Some(NormalizedEvent::ToolUse {
                tool_name: tool.name.clone(),
                tool_state: ToolState::new(ToolStatus::Running)
                    .with_id(tool.id.clone())
                    .with_input(tool.input.clone()),
            });
        }

        let thinking: String = blocks
            .iter()
            .filter(|b| b.block_type == "thinking")
            .filter_map(|b| b.thinking.as_deref())
            .collect();
        if !thinking.is_empty() {
            return Some(NormalizedEvent::reasoning(
                format_reasoning_text(&thinking),
                true,
            ));
        }

        None
    }

    /// User lines echo our own input or carry tool results. Only the latter
    /// produce events, one per `tool_result` block.
    fn handle_user(&mut self, message: &Message) -> Vec<NormalizedEvent> {
        message
            .content
            .blocks()
            .iter()
            .filter(|b| b.block_type == "tool_result")
            .map(|block| {
                let tool_name = match &block.tool_use_id {
                    Some(id) => self.tool_names.remove(id),
                    None => self.last_tool_name.clone(),
                };
                let status = if block.is_error == Some(true) {
                    ToolStatus::Error
                } else {
                    ToolStatus::Completed
                };
                NormalizedEvent::ToolUse {
                    tool_name,
                    tool_state: ToolState::new(status)
                        .with_id(block.tool_use_id.clone())
                        .with_output(Some(Value::String(truncate_tool_output(
                            &block.result_text(),
                        )))),
                }
            })
            .collect()
    }

    fn handle_stream_event(&self, event: &ClaudeStreamEvent) -> Option<NormalizedEvent> {
        let stream = event.event.as_ref()?;
        if stream.event_type != "content_block_delta" {
            return None;
        }
        let delta = stream.delta.as_ref()?;
        match delta.delta_type.as_str() {
            "text_delta" => delta
                .text
                .as_ref()
                .map(|t| NormalizedEvent::text(t.clone(), true)),
            "thinking_delta" => delta
                .thinking
                .as_ref()
                .map(|t| NormalizedEvent::reasoning(format_reasoning_text(t), true)),
            _ => None,
        }
    }

    fn handle_result(&self, event: ClaudeStreamEvent) -> NormalizedEvent {
        let failed = event.is_error == Some(true)
            || event
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"));

        if failed {
            let text = event
                .result
                .filter(|r| !r.is_empty())
                .or_else(|| event.errors.map(|e| e.join("\n")).filter(|e| !e.is_empty()))
                .or(event.subtype)
                .unwrap_or_else(|| "Claude reported an error".to_string());
            return NormalizedEvent::error(text);
        }

        let models: Vec<ModelUsage> = event
            .model_usage
            .map(|m| m.into_values().collect())
            .unwrap_or_default();
        let fallback = event.usage.as_ref().map(ModelUsage::from);
        let usage = aggregate_model_usage(
            &models,
            fallback.as_ref(),
            event.total_cost_usd,
            self.default_context_window(),
        );

        NormalizedEvent::Result {
            text: event.result.unwrap_or_default(),
            usage: Some(usage),
        }
    }
}

impl OutputParser for ClaudeParser {
    fn agent(&self) -> AgentKind {
        AgentKind::ClaudeCode
    }

    /// First event of the line. A user line batching several tool results
    /// yields the rest only through [`parse_events`](OutputParser::parse_events).
    fn parse_line(&mut self, line: &str) -> Option<NormalizedEvent> {
        self.parse_events(line).into_iter().next()
    }

    fn parse_events(&mut self, line: &str) -> Vec<NormalizedEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let Some(raw) = parse_json_object(trimmed) else {
            return vec![NormalizedEvent::text(trimmed, false)];
        };

        let event: ClaudeStreamEvent = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Unrecognized Claude line shape: {}", e);
                return vec![NormalizedEvent::system(raw)];
            }
        };

        match event.event_type.as_str() {
            "system" => vec![self.handle_system(event, raw)],
            "assistant" => event
                .message
                .as_ref()
                .and_then(|m| self.handle_assistant(m))
                .into_iter()
                .collect(),
            "user" => event
                .message
                .as_ref()
                .map(|m| self.handle_user(m))
                .unwrap_or_default(),
            "stream_event" => self.handle_stream_event(&event).into_iter().collect(),
            "result" => vec![self.handle_result(event)],
            _ => vec![NormalizedEvent::system(raw)],
        }
    }

    fn detect_error_from_line(&self, line: &str) -> Option<ClassifiedError> {
        self.detector.from_line(line)
    }

    fn detect_error_from_exit(
        &self,
        code: i32,
        stderr: &str,
        stdout: &str,
    ) -> Option<ClassifiedError> {
        self.detector.from_exit(code, stderr, stdout)
    }

    fn reset(&mut self) {
        self.tool_names.clear();
        self.last_tool_name = None;
        self.model = None;
        self.settings = load_or_default(self.config.as_ref(), AgentKind::ClaudeCode);
        self.detector.refresh();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::errors::{AgentErrorType, BuiltinPatterns};
    use crate::config::{AgentSettings, ConfigError, NoConfig};
    use serde_json::json;

    fn parser() -> ClaudeParser {
        ClaudeParser::new(Arc::new(BuiltinPatterns), Arc::new(NoConfig))
    }

    fn parse_all(parser: &mut ClaudeParser, lines: &[&str]) -> Vec<NormalizedEvent> {
        lines.iter().flat_map(|l| parser.parse_events(l)).collect()
    }

    mod system_lines {
        use super::*;

        #[test]
        fn init_emits_session_and_commands() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"system","subtype":"init","session_id":"s-1","model":"claude-opus-4","slash_commands":["compact"]}"#)
                .unwrap();
            assert_eq!(
                event,
                NormalizedEvent::Init {
                    session_id: Some("s-1".to_string()),
                    slash_commands: Some(vec!["compact".to_string()]),
                }
            );
            assert_eq!(p.model(), Some("claude-opus-4"));
        }

        #[test]
        fn other_subtypes_pass_through() {
            let mut p = parser();
            let line = json!({"type":"system","subtype":"compact_boundary"});
            let event = p.parse_line(&line.to_string()).unwrap();
            assert_eq!(event, NormalizedEvent::system(line));
        }
    }

    mod assistant_lines {
        use super::*;

        #[test]
        fn text_blocks_are_joined() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hello "},{"type":"text","text":"world"}]}}"#)
                .unwrap();
            assert_eq!(event, NormalizedEvent::text("Hello world", true));
        }

        #[test]
        fn text_wins_over_tool_use() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{}},{"type":"text","text":"Running"}]}}"#)
                .unwrap();
            assert!(matches!(event, NormalizedEvent::Text { ref text, .. } if text == "Running"));
        }

        #[test]
        fn tool_use_is_running() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#)
                .unwrap();
            match event {
                NormalizedEvent::ToolUse {
                    tool_name,
                    tool_state,
                } => {
                    assert_eq!(tool_name.as_deref(), Some("Bash"));
                    assert_eq!(tool_state.status, ToolStatus::Running);
                    assert_eq!(tool_state.id.as_deref(), Some("t1"));
                    assert_eq!(tool_state.input, Some(json!({"command": "ls"})));
                }
                other => panic!("expected ToolUse, got {:?}", other),
            }
        }

        #[test]
        fn thinking_is_reasoning_text() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"Let me look."}]}}"#)
                .unwrap();
            assert_eq!(event, NormalizedEvent::reasoning("Let me look.", true));
        }

        #[test]
        fn empty_content_yields_nothing() {
            let mut p = parser();
            assert!(p
                .parse_line(r#"{"type":"assistant","message":{"content":[]}}"#)
                .is_none());
        }
    }

    mod tool_results {
        use super::*;

        const BEGIN: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{}}]}}"#;
        const END: &str = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"file body"}]}}"#;

        #[test]
        fn result_is_correlated_with_begin() {
            let mut p = parser();
            let events = parse_all(&mut p, &[BEGIN, END]);
            match &events[1] {
                NormalizedEvent::ToolUse {
                    tool_name,
                    tool_state,
                } => {
                    assert_eq!(tool_name.as_deref(), Some("Read"));
                    assert_eq!(tool_state.status, ToolStatus::Completed);
                    assert_eq!(tool_state.output, Some(json!("file body")));
                }
                other => panic!("expected ToolUse, got {:?}", other),
            }
        }

        #[test]
        fn result_without_begin_has_no_name() {
            let mut p = parser();
            let event = p.parse_line(END).unwrap();
            assert!(matches!(
                event,
                NormalizedEvent::ToolUse { tool_name: None, ref tool_state } if tool_state.status == ToolStatus::Completed
            ));
        }

        #[test]
        fn error_result_has_error_status() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t9","is_error":true,"content":"denied"}]}}"#)
                .unwrap();
            assert!(matches!(
                event,
                NormalizedEvent::ToolUse { ref tool_state, .. } if tool_state.status == ToolStatus::Error
            ));
        }

        #[test]
        fn large_output_is_truncated() {
            let mut p = parser();
            let line = json!({
                "type": "user",
                "message": {"content": [{"type": "tool_result", "tool_use_id": "t1", "content": "y".repeat(20_000)}]}
            });
            let event = p.parse_line(&line.to_string()).unwrap();
            let NormalizedEvent::ToolUse { tool_state, .. } = event else {
                panic!("expected ToolUse");
            };
            let output = tool_state.output.unwrap();
            assert!(output
                .as_str()
                .unwrap()
                .ends_with("[output truncated, 20000 chars total]"));
        }

        #[test]
        fn batched_results_each_produce_an_event() {
            let mut p = parser();
            p.parse_line(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"a","name":"Read","input":{}},{"type":"tool_use","id":"b","name":"Grep","input":{}}]}}"#);
            let events = p.parse_events(
                r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"a","content":"one"},{"type":"tool_result","tool_use_id":"b","is_error":true,"content":"two"}]}}"#,
            );
            assert_eq!(events.len(), 2);
            let summary: Vec<_> = events
                .iter()
                .map(|e| match e {
                    NormalizedEvent::ToolUse {
                        tool_name,
                        tool_state,
                    } => (tool_name.clone(), tool_state.status, tool_state.output.clone()),
                    other => panic!("expected ToolUse, got {:?}", other),
                })
                .collect();
            assert_eq!(
                summary,
                vec![
                    (Some("Read".to_string()), ToolStatus::Completed, Some(json!("one"))),
                    (Some("Grep".to_string()), ToolStatus::Error, Some(json!("two"))),
                ]
            );
        }

        #[test]
        fn plain_user_echo_yields_nothing() {
            let mut p = parser();
            assert!(p
                .parse_line(r#"{"type":"user","message":{"role":"user","content":"hi"}}"#)
                .is_none());
        }
    }

    mod streaming {
        use super::*;

        #[test]
        fn text_delta_is_partial_text() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"He"}}}"#)
                .unwrap();
            assert_eq!(event, NormalizedEvent::text("He", true));
        }

        #[test]
        fn other_stream_events_are_ignored() {
            let mut p = parser();
            assert!(p
                .parse_line(r#"{"type":"stream_event","event":{"type":"message_start"}}"#)
                .is_none());
        }
    }

    mod results {
        use super::*;

        #[test]
        fn success_result_aggregates_usage() {
            let mut p = parser();
            let line = r#"{"type":"result","subtype":"success","result":"Done","total_cost_usd":0.3,
                "modelUsage":{
                    "claude-haiku":{"inputTokens":2000,"outputTokens":100,"costUSD":0.01,"contextWindow":200000},
                    "claude-sonnet":{"inputTokens":50000,"outputTokens":800,"cacheReadInputTokens":9000,"costUSD":0.29,"contextWindow":200000}
                }}"#
            .replace('\n', "");
            let event = p.parse_line(&line).unwrap();
            let NormalizedEvent::Result { text, usage } = event else {
                panic!("expected Result");
            };
            let usage = usage.unwrap();
            assert_eq!(text, "Done");
            assert_eq!(usage.input_tokens, 50_000);
            assert_eq!(usage.cache_read_input_tokens, 9_000);
            assert_eq!(usage.total_cost_usd, 0.3);
            assert_eq!(usage.context_window, 200_000);
        }

        #[test]
        fn error_subtype_is_error_event() {
            let mut p = parser();
            let event = p
                .parse_line(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#)
                .unwrap();
            assert_eq!(event, NormalizedEvent::error("error_max_turns"));
        }

        #[test]
        fn configured_window_used_when_unreported() {
            struct Fixed;
            impl AgentConfigSource for Fixed {
                fn load(&self, _: AgentKind) -> Result<AgentSettings, ConfigError> {
                    Ok(AgentSettings {
                        model: Some("opus".to_string()),
                        context_window: Some(1_000_000),
                    })
                }
            }
            let mut p = ClaudeParser::new(Arc::new(BuiltinPatterns), Arc::new(Fixed));
            let event = p
                .parse_line(r#"{"type":"result","subtype":"success","result":"","usage":{"input_tokens":5}}"#)
                .unwrap();
            let NormalizedEvent::Result { usage, .. } = event else {
                panic!("expected Result");
            };
            assert_eq!(usage.unwrap().context_window, 1_000_000);
            assert_eq!(p.model(), Some("opus"));
        }
    }

    mod passthrough {
        use super::*;

        #[test]
        fn non_json_is_text() {
            let mut p = parser();
            assert_eq!(
                p.parse_line("not json at all"),
                Some(NormalizedEvent::text("not json at all", false))
            );
        }

        #[test]
        fn blank_line_is_nothing() {
            assert!(parser().parse_line("   ").is_none());
        }

        #[test]
        fn unknown_type_is_system() {
            let mut p = parser();
            let event = p.parse_line(r#"{"type":"rate_limit_event"}"#).unwrap();
            assert!(matches!(event, NormalizedEvent::System { .. }));
        }

        #[test]
        fn missing_type_is_system() {
            let mut p = parser();
            let event = p.parse_line(r#"{"hello":"world"}"#).unwrap();
            assert!(matches!(event, NormalizedEvent::System { .. }));
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn reset_replays_identically() {
            let lines = [
                r#"{"type":"system","subtype":"init","session_id":"s","model":"m"}"#,
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}"#,
                r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#,
                r#"{"type":"result","subtype":"success","result":"done"}"#,
            ];
            let mut p = parser();
            let first = parse_all(&mut p, &lines);
            p.reset();
            let second = parse_all(&mut p, &lines);
            assert_eq!(first, second);
        }

        #[test]
        fn reset_clears_correlation() {
            let mut p = parser();
            p.parse_line(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash"}]}}"#);
            p.reset();
            let event = p
                .parse_line(r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#)
                .unwrap();
            assert!(matches!(event, NormalizedEvent::ToolUse { tool_name: None, .. }));
            assert_eq!(p.model(), None);
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn error_result_line_is_detected() {
            let err = parser()
                .detect_error_from_line(r#"{"type":"result","is_error":true,"result":"Prompt is too long"}"#)
                .unwrap();
            assert_eq!(err.error_type, AgentErrorType::TokenExhaustion);
            assert_eq!(err.agent, AgentKind::ClaudeCode);
        }

        #[test]
        fn assistant_text_is_not_an_error() {
            assert!(parser()
                .detect_error_from_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"rate limit"}]}}"#)
                .is_none());
        }

        #[test]
        fn stderr_api_error_on_exit() {
            let stderr = r#"API Error: 400 {"type":"error","error":{"message":"prompt is too long"}}"#;
            let err = parser().detect_error_from_exit(1, stderr, "").unwrap();
            assert_eq!(err.error_type, AgentErrorType::TokenExhaustion);
        }
    }
}
