//! Serde views of Codex's two stdout formats.
//!
//! # Legacy envelope format
//!
//! Older `codex exec --json` builds wrap every event in an envelope:
//!
//! ```json
//! {"id":"0","msg":{"type":"session_configured","session_id":"abc","model":"gpt-5"}}
//! {"id":"1","msg":{"type":"exec_command_begin","call_id":"c1","command":["bash","-lc","ls"]}}
//! ```
//!
//! and print a bare configuration object (no `msg`, no `type`) first.
//!
//! # Thread event format
//!
//! Current builds print flat events with a dotted `type`:
//!
//! ```json
//! {"type":"thread.started","thread_id":"t1"}
//! {"type":"item.completed","item":{"id":"item_3","type":"agent_message","text":"Done."}}
//! {"type":"turn.completed","usage":{"input_tokens":1200,"cached_input_tokens":800,"output_tokens":40}}
//! ```
//!
//! # Rust Concept: Internally Tagged Enums
//!
//! `#[serde(tag = "type")]` reads the `type` field and picks the variant
//! whose (renamed) name matches, then fills that variant's fields from the
//! rest of the object. `#[serde(other)]` catches every unknown tag so new
//! event types never fail the whole line.

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// Shared
// ============================================================================

/// Token counts as Codex reports them. `input_tokens` includes cached input.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_output_tokens: Option<u64>,
}

// ============================================================================
// Legacy envelope format
// ============================================================================

/// `{"id": ..., "msg": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    pub msg: LegacyEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LegacyEvent {
    SessionConfigured {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    TaskStarted {
        #[serde(default)]
        model_context_window: Option<u64>,
    },
    TaskComplete {},
    AgentMessage {
        #[serde(default)]
        message: String,
    },
    AgentMessageDelta {
        #[serde(default)]
        delta: String,
    },
    AgentReasoning {
        #[serde(default)]
        text: String,
    },
    AgentReasoningDelta {
        #[serde(default)]
        delta: String,
    },
    ExecCommandBegin {
        call_id: String,
        /// Usually an argv array, occasionally a plain string.
        #[serde(default)]
        command: Option<Value>,
        #[serde(default)]
        cwd: Option<String>,
    },
    ExecCommandEnd {
        call_id: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        aggregated_output: Option<String>,
        #[serde(default)]
        stdout: Option<String>,
        #[serde(default)]
        stderr: Option<String>,
    },
    McpToolCallBegin {
        call_id: String,
        #[serde(default)]
        invocation: Option<McpInvocation>,
    },
    McpToolCallEnd {
        call_id: String,
        #[serde(default)]
        invocation: Option<McpInvocation>,
        /// `{"Ok": {...}}` or `{"Err": "..."}`.
        #[serde(default)]
        result: Option<Value>,
    },
    PatchApplyBegin {
        call_id: String,
        #[serde(default)]
        changes: Option<Value>,
    },
    PatchApplyEnd {
        call_id: String,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        stdout: Option<String>,
        #[serde(default)]
        stderr: Option<String>,
    },
    TokenCount {
        #[serde(default)]
        info: Option<TokenCountInfo>,
        /// Older builds report counts flat on the event.
        #[serde(default)]
        input_tokens: Option<u64>,
        #[serde(default)]
        cached_input_tokens: Option<u64>,
        #[serde(default)]
        output_tokens: Option<u64>,
        #[serde(default)]
        reasoning_output_tokens: Option<u64>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    StreamError {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpInvocation {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl McpInvocation {
    /// `server/tool`, or whichever half is known.
    pub fn display_name(&self) -> Option<String> {
        match (&self.server, &self.tool) {
            (Some(server), Some(tool)) => Some(format!("{}/{}", server, tool)),
            (None, Some(tool)) => Some(tool.clone()),
            (Some(server), None) => Some(server.clone()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenCountInfo {
    /// Usage of the most recent model call.
    pub last_token_usage: Option<TokenUsage>,
    /// Usage accumulated over the whole session.
    pub total_token_usage: Option<TokenUsage>,
    pub model_context_window: Option<u64>,
}

// ============================================================================
// Thread event format
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        #[serde(default)]
        thread_id: Option<String>,
    },
    #[serde(rename = "turn.started")]
    TurnStarted {},
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<ThreadError>,
    },
    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThreadError {
    pub message: String,
}

/// An item inside `item.*` events. Which fields are set depends on `item_type`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThreadItem {
    pub id: Option<String>,
    #[serde(rename = "type", alias = "item_type")]
    pub item_type: String,
    /// `agent_message` / `reasoning`
    pub text: Option<String>,
    /// `command_execution`
    pub command: Option<String>,
    pub aggregated_output: Option<String>,
    pub exit_code: Option<i32>,
    /// `in_progress`, `completed`, `failed`, `declined`
    pub status: Option<String>,
    /// `mcp_tool_call`
    pub server: Option<String>,
    pub tool: Option<String>,
    pub arguments: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    /// `file_change`
    pub changes: Option<Value>,
    /// `web_search`
    pub query: Option<String>,
    /// `todo_list`
    pub items: Option<Value>,
    /// `error` items
    pub message: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_legacy_exec_begin() {
        let json = r#"{"id":"1","msg":{"type":"exec_command_begin","call_id":"c1","command":["ls","-la"],"cwd":"/tmp","parsed_cmd":[]}}"#;
        let envelope: LegacyEnvelope = serde_json::from_str(json).unwrap();
        match envelope.msg {
            LegacyEvent::ExecCommandBegin { call_id, cwd, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(cwd.as_deref(), Some("/tmp"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_legacy_unknown_type() {
        let json = r#"{"id":"1","msg":{"type":"turn_diff","unified_diff":"..."}}"#;
        let envelope: LegacyEnvelope = serde_json::from_str(json).unwrap();
        assert!(matches!(envelope.msg, LegacyEvent::Other));
    }

    #[test]
    fn parse_legacy_token_count_info() {
        let json = r#"{"type":"token_count","info":{"last_token_usage":{"input_tokens":10,"cached_input_tokens":4,"output_tokens":2,"reasoning_output_tokens":1,"total_tokens":12},"model_context_window":272000}}"#;
        let event: LegacyEvent = serde_json::from_str(json).unwrap();
        let LegacyEvent::TokenCount { info, .. } = event else {
            panic!("expected TokenCount");
        };
        let info = info.unwrap();
        assert_eq!(info.model_context_window, Some(272_000));
        assert_eq!(info.last_token_usage.unwrap().reasoning_output_tokens, Some(1));
    }

    #[test]
    fn parse_thread_item() {
        let json = r#"{"type":"item.started","item":{"id":"item_1","type":"command_execution","command":"bash -lc ls","aggregated_output":"","exit_code":null,"status":"in_progress"}}"#;
        let event: ThreadEvent = serde_json::from_str(json).unwrap();
        let ThreadEvent::ItemStarted { item } = event else {
            panic!("expected ItemStarted");
        };
        assert_eq!(item.item_type, "command_execution");
        assert_eq!(item.exit_code, None);
        assert_eq!(item.status.as_deref(), Some("in_progress"));
    }

    #[test]
    fn parse_thread_item_type_alias() {
        let item: ThreadItem =
            serde_json::from_str(r#"{"id":"i","item_type":"reasoning","text":"hm"}"#).unwrap();
        assert_eq!(item.item_type, "reasoning");
    }

    #[test]
    fn parse_unknown_thread_event() {
        let event: ThreadEvent = serde_json::from_str(r#"{"type":"thread.resumed"}"#).unwrap();
        assert!(matches!(event, ThreadEvent::Other));
    }

    #[test]
    fn mcp_display_name() {
        let inv = McpInvocation {
            server: Some("github".to_string()),
            tool: Some("search".to_string()),
            arguments: None,
        };
        assert_eq!(inv.display_name().as_deref(), Some("github/search"));
    }
}
