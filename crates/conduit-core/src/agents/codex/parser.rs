//! Codex line parser (legacy envelope + thread event formats).
//!
//! # Routing
//!
//! Each line is sniffed before it is deserialized:
//!
//! 1. a `msg` object present: legacy envelope format
//! 2. a bare `type` string: thread event format
//! 3. neither: a configuration or prompt echo line
//!
//! Routing is per line, never per process. A parser that locked onto the
//! first format it saw would turn every line of the other format into noise.
//!
//! # Tool Correlation
//!
//! Begin and end events share an id (`call_id` in the legacy format, the item
//! `id` in thread events). Begin records `id -> tool name`, end removes it.
//! An end with no begin still yields a complete `ToolUse`, just without a
//! name.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::agents::errors::{ClassifiedError, ErrorPatternProvider};
use crate::agents::event::{NormalizedEvent, ToolState, ToolStatus, UsageStats};
use crate::agents::parser::{
    format_reasoning_text, parse_json_object, truncate_tool_output, ErrorDetector, OutputParser,
};
use crate::agents::AgentKind;
use crate::config::{load_or_default, AgentConfigSource, AgentSettings};

use super::types::{
    LegacyEnvelope, LegacyEvent, McpInvocation, ThreadEvent, ThreadItem, TokenCountInfo,
    TokenUsage,
};

const SHELL_TOOL: &str = "shell";
const PATCH_TOOL: &str = "apply_patch";

/// Parser state for Codex runs.
pub struct CodexParser {
    detector: ErrorDetector,
    config: Arc<dyn AgentConfigSource>,
    settings: AgentSettings,

    /// Model from a config line or `session_configured`.
    model: Option<String>,

    /// Context window reported by the agent during this run.
    reported_context_window: Option<u64>,

    /// Call/item id -> tool name.
    tool_names: HashMap<String, String>,
}

impl CodexParser {
    pub fn new(patterns: Arc<dyn ErrorPatternProvider>, config: Arc<dyn AgentConfigSource>) -> Self {
        let settings = load_or_default(config.as_ref(), AgentKind::Codex);
        Self {
            detector: ErrorDetector::new(AgentKind::Codex, patterns),
            config,
            settings,
            model: None,
            reported_context_window: None,
            tool_names: HashMap::new(),
        }
    }

    /// Model in use: reported by the agent, else configured.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().or(self.settings.model.as_deref())
    }

    /// Reported window, else configured, else the static default.
    pub fn context_window(&self) -> u64 {
        self.reported_context_window
            .or(self.settings.context_window)
            .unwrap_or_else(|| AgentKind::Codex.default_context_window())
    }

    fn usage_from(&self, usage: &TokenUsage) -> UsageStats {
        UsageStats {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_input_tokens: usage.cached_input_tokens,
            cache_creation_input_tokens: 0,
            total_cost_usd: 0.0,
            context_window: self.context_window(),
            reasoning_tokens: usage.reasoning_output_tokens,
        }
    }

    fn begin_tool(
        &mut self,
        id: &str,
        name: impl Into<String>,
        input: Option<Value>,
    ) -> NormalizedEvent {
        let name = name.into();
        self.tool_names.insert(id.to_string(), name.clone());
        NormalizedEvent::ToolUse {
            tool_name: Some(name),
            tool_state: ToolState::new(ToolStatus::Running)
                .with_id(Some(id.to_string()))
                .with_input(input),
        }
    }

    fn end_tool(&mut self, id: &str, fallback_name: Option<String>, state: ToolState) -> NormalizedEvent {
        let tool_name = self.tool_names.remove(id).or(fallback_name);
        NormalizedEvent::ToolUse {
            tool_name,
            tool_state: state.with_id(Some(id.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Legacy envelope format
    // ------------------------------------------------------------------------

    fn parse_legacy(&mut self, event: LegacyEvent, raw: Value) -> Option<NormalizedEvent> {
        match event {
            LegacyEvent::SessionConfigured { session_id, model } => {
                if model.is_some() {
                    self.model = model;
                }
                Some(NormalizedEvent::Init {
                    session_id,
                    slash_commands: None,
                })
            }
            LegacyEvent::TaskStarted {
                model_context_window,
            } => {
                if let Some(window) = model_context_window.filter(|w| *w > 0) {
                    self.reported_context_window = Some(window);
                }
                None
            }
            LegacyEvent::TaskComplete {} => None,
            LegacyEvent::AgentMessage { message } => Some(NormalizedEvent::Result {
                text: message,
                usage: None,
            }),
            LegacyEvent::AgentMessageDelta { delta } => Some(NormalizedEvent::text(delta, true)),
            LegacyEvent::AgentReasoning { text } => Some(NormalizedEvent::reasoning(
                format_reasoning_text(&text),
                false,
            )),
            LegacyEvent::AgentReasoningDelta { delta } => Some(NormalizedEvent::reasoning(
                format_reasoning_text(&delta),
                true,
            )),
            LegacyEvent::ExecCommandBegin {
                call_id,
                command,
                cwd,
            } => {
                let input = json!({
                    "command": command.as_ref().map(render_command).unwrap_or_default(),
                    "cwd": cwd,
                });
                Some(self.begin_tool(&call_id, SHELL_TOOL, Some(input)))
            }
            LegacyEvent::ExecCommandEnd {
                call_id,
                exit_code,
                aggregated_output,
                stdout,
                stderr,
            } => {
                let output = aggregated_output
                    .unwrap_or_else(|| join_streams(stdout.as_deref(), stderr.as_deref()));
                let state = ToolState::new(status_for_exit(exit_code))
                    .with_output(Some(Value::String(truncate_tool_output(&output))))
                    .with_exit_code(exit_code);
                Some(self.end_tool(&call_id, None, state))
            }
            LegacyEvent::McpToolCallBegin {
                call_id,
                invocation,
            } => {
                let name = invocation
                    .as_ref()
                    .and_then(McpInvocation::display_name)
                    .unwrap_or_else(|| "mcp".to_string());
                let input = invocation.and_then(|i| i.arguments);
                Some(self.begin_tool(&call_id, name, input))
            }
            LegacyEvent::McpToolCallEnd {
                call_id,
                invocation,
                result,
            } => {
                let (status, output) = mcp_outcome(result.as_ref());
                let state = ToolState::new(status)
                    .with_output(Some(Value::String(truncate_tool_output(&output))));
                let fallback = invocation.as_ref().and_then(McpInvocation::display_name);
                Some(self.end_tool(&call_id, fallback, state))
            }
            LegacyEvent::PatchApplyBegin { call_id, changes } => {
                Some(self.begin_tool(&call_id, PATCH_TOOL, changes))
            }
            LegacyEvent::PatchApplyEnd {
                call_id,
                success,
                stdout,
                stderr,
            } => {
                let status = if success == Some(false) {
                    ToolStatus::Error
                } else {
                    ToolStatus::Completed
                };
                let output = join_streams(stdout.as_deref(), stderr.as_deref());
                let state = ToolState::new(status)
                    .with_output(Some(Value::String(truncate_tool_output(&output))));
                Some(self.end_tool(&call_id, None, state))
            }
            LegacyEvent::TokenCount {
                info,
                input_tokens,
                cached_input_tokens,
                output_tokens,
                reasoning_output_tokens,
            } => {
                let TokenCountInfo {
                    last_token_usage,
                    total_token_usage,
                    model_context_window,
                } = info.unwrap_or_default();
                if let Some(window) = model_context_window.filter(|w| *w > 0) {
                    self.reported_context_window = Some(window);
                }
                // The last call's usage is what occupies the window; session
                // totals grow without bound.
                let usage = last_token_usage.or(total_token_usage).or_else(|| {
                    input_tokens.map(|input| TokenUsage {
                        input_tokens: input,
                        cached_input_tokens: cached_input_tokens.unwrap_or(0),
                        output_tokens: output_tokens.unwrap_or(0),
                        reasoning_output_tokens,
                    })
                })?;
                Some(NormalizedEvent::Usage {
                    usage: self.usage_from(&usage),
                })
            }
            LegacyEvent::Error { message } | LegacyEvent::StreamError { message } => {
                Some(NormalizedEvent::error(message))
            }
            LegacyEvent::Other => Some(NormalizedEvent::system(raw)),
        }
    }

    // ------------------------------------------------------------------------
    // Thread event format
    // ------------------------------------------------------------------------

    fn parse_thread(&mut self, event: ThreadEvent, raw: Value) -> Option<NormalizedEvent> {
        match event {
            ThreadEvent::ThreadStarted { thread_id } => Some(NormalizedEvent::Init {
                session_id: thread_id,
                slash_commands: None,
            }),
            ThreadEvent::TurnStarted {} => None,
            ThreadEvent::TurnCompleted { usage } => usage.map(|u| NormalizedEvent::Usage {
                usage: self.usage_from(&u),
            }),
            ThreadEvent::TurnFailed { error } => Some(NormalizedEvent::error(
                error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Turn failed".to_string()),
            )),
            ThreadEvent::ItemStarted { item } | ThreadEvent::ItemUpdated { item } => {
                self.parse_item(item, false, raw)
            }
            ThreadEvent::ItemCompleted { item } => self.parse_item(item, true, raw),
            ThreadEvent::Error { message } => Some(NormalizedEvent::error(message)),
            ThreadEvent::Other => Some(NormalizedEvent::system(raw)),
        }
    }

    fn parse_item(&mut self, item: ThreadItem, completed: bool, raw: Value) -> Option<NormalizedEvent> {
        match item.item_type.as_str() {
            "agent_message" => {
                let text = item.text.unwrap_or_default();
                if completed {
                    Some(NormalizedEvent::Result { text, usage: None })
                } else if text.is_empty() {
                    None
                } else {
                    Some(NormalizedEvent::text(text, true))
                }
            }
            "reasoning" => item
                .text
                .filter(|t| !t.is_empty())
                .map(|t| NormalizedEvent::reasoning(format_reasoning_text(&t), !completed)),
            "command_execution" => {
                let input = json!({ "command": item.command });
                let output = item.aggregated_output.clone();
                self.item_tool(&item, SHELL_TOOL.to_string(), completed, Some(input), output)
            }
            "mcp_tool_call" => {
                let name = McpInvocation {
                    server: item.server.clone(),
                    tool: item.tool.clone(),
                    arguments: None,
                }
                .display_name()
                .unwrap_or_else(|| "mcp".to_string());
                let output = item
                    .error
                    .as_ref()
                    .or(item.result.as_ref())
                    .map(value_text);
                self.item_tool(&item, name, completed, item.arguments.clone(), output)
            }
            "file_change" => {
                let input = item.changes.clone();
                self.item_tool(&item, PATCH_TOOL.to_string(), completed, input, None)
            }
            "web_search" => {
                let input = json!({ "query": item.query });
                self.item_tool(&item, "web_search".to_string(), completed, Some(input), None)
            }
            "todo_list" => {
                let input = item.items.clone();
                self.item_tool(&item, "todo_list".to_string(), completed, input, None)
            }
            "error" => Some(NormalizedEvent::error(
                item.message.or(item.text).unwrap_or_default(),
            )),
            _ => Some(NormalizedEvent::system(raw)),
        }
    }

    /// Start or finish a tool-like item.
    ///
    /// Items without an id are reported as they come, with no correlation.
    fn item_tool(
        &mut self,
        item: &ThreadItem,
        name: String,
        completed: bool,
        input: Option<Value>,
        output: Option<String>,
    ) -> Option<NormalizedEvent> {
        let id = item.id.clone().filter(|id| !id.is_empty());

        if !completed {
            return Some(match id {
                Some(id) if !self.tool_names.contains_key(&id) => {
                    self.begin_tool(&id, name, input)
                }
                // item.updated for a call we already announced, or no id at all
                id => NormalizedEvent::ToolUse {
                    tool_name: Some(name),
                    tool_state: ToolState::new(ToolStatus::Running)
                        .with_id(id)
                        .with_input(input),
                },
            });
        }

        let status = match item.status.as_deref() {
            Some("failed") | Some("declined") => ToolStatus::Error,
            _ if item.exit_code.is_some_and(|c| c != 0) => ToolStatus::Error,
            _ => ToolStatus::Completed,
        };
        let state = ToolState::new(status)
            .with_input(input)
            .with_output(output.map(|o| Value::String(truncate_tool_output(&o))))
            .with_exit_code(item.exit_code);
        Some(match id {
            Some(id) => self.end_tool(&id, Some(name), state),
            None => NormalizedEvent::ToolUse {
                tool_name: Some(name),
                tool_state: state,
            },
        })
    }
}

fn status_for_exit(exit_code: Option<i32>) -> ToolStatus {
    match exit_code {
        Some(0) | None => ToolStatus::Completed,
        Some(_) => ToolStatus::Error,
    }
}

/// Render an argv array as one shell-quoted string.
fn render_command(command: &Value) -> String {
    match command {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let args: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            shlex::try_join(args.iter().copied()).unwrap_or_else(|_| args.join(" "))
        }
        other => other.to_string(),
    }
}

fn join_streams(stdout: Option<&str>, stderr: Option<&str>) -> String {
    match (stdout.filter(|s| !s.is_empty()), stderr.filter(|s| !s.is_empty())) {
        (Some(out), Some(err)) => format!("{}\n{}", out, err),
        (Some(out), None) => out.to_string(),
        (None, Some(err)) => err.to_string(),
        (None, None) => String::new(),
    }
}

/// Text content of an MCP result: joined `content[].text`, else the JSON.
fn value_text(value: &Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return message.to_string();
    }
    if let Some(content) = value.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = content
            .iter()
            .filter_map(|c| c.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    value.to_string()
}

/// Status and output of a legacy `mcp_tool_call_end` result (`{"Ok":..}` / `{"Err":..}`).
fn mcp_outcome(result: Option<&Value>) -> (ToolStatus, String) {
    let Some(result) = result else {
        return (ToolStatus::Completed, String::new());
    };
    if let Some(err) = result.get("Err") {
        return (ToolStatus::Error, value_text(err));
    }
    let ok = result.get("Ok").unwrap_or(result);
    let failed = ok
        .get("isError")
        .or_else(|| ok.get("is_error"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let status = if failed {
        ToolStatus::Error
    } else {
        ToolStatus::Completed
    };
    (status, value_text(ok))
}

impl OutputParser for CodexParser {
    fn agent(&self) -> AgentKind {
        AgentKind::Codex
    }

    fn parse_line(&mut self, line: &str) -> Option<NormalizedEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let Some(raw) = parse_json_object(trimmed) else {
            return Some(NormalizedEvent::text(trimmed, false));
        };

        if raw.get("msg").is_some_and(Value::is_object) {
            return match serde_json::from_value::<LegacyEnvelope>(raw.clone()) {
                Ok(envelope) => self.parse_legacy(envelope.msg, raw),
                Err(e) => {
                    log::debug!("Unrecognized Codex legacy event: {}", e);
                    Some(NormalizedEvent::system(raw))
                }
            };
        }

        if raw.get("type").is_some_and(Value::is_string) {
            return match serde_json::from_value::<ThreadEvent>(raw.clone()) {
                Ok(event) => self.parse_thread(event, raw),
                Err(e) => {
                    log::debug!("Unrecognized Codex thread event: {}", e);
                    Some(NormalizedEvent::system(raw))
                }
            };
        }

        if let Some(model) = raw.get("model").and_then(Value::as_str) {
            self.model = Some(model.to_string());
        }
        Some(NormalizedEvent::System {
            raw,
            message: Some("configuration".to_string()),
        })
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
        self.model = None;
        self.reported_context_window = None;
        self.settings = load_or_default(self.config.as_ref(), AgentKind::Codex);
        self.detector.refresh();
    }
}

// ============================================================================
// TESTS
// ============================================================================
