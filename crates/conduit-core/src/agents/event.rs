//! Normalized event type shared by every agent backend.
//!
//! Whether an event came from an ACP session update or from one line of a
//! line-based agent's stdout, the host only ever sees a [`NormalizedEvent`].

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Snapshot of a tool invocation at one point of its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ToolState {
    /// A state with only a status set.
    pub fn new(status: ToolStatus) -> Self {
        Self {
            id: None,
            status,
            input: None,
            output: None,
            exit_code: None,
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn with_input(mut self, input: Option<serde_json::Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Option<serde_json::Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Token and cost statistics for one turn.
///
/// `reasoning_tokens` is informational: those tokens are already counted in
/// `output_tokens`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub total_cost_usd: f64,
    pub context_window: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

/// Unified event type emitted by every agent backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NormalizedEvent {
    /// Agent or session is ready.
    Init {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        slash_commands: Option<Vec<String>>,
    },

    /// A chunk of streamed output.
    ///
    /// `is_partial` marks text that is not final. `reasoning` marks thinking
    /// text, which hosts must keep apart from the answer.
    Text {
        text: String,
        is_partial: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        reasoning: bool,
    },

    /// A tool invocation observed at any lifecycle stage.
    ToolUse {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        tool_state: ToolState,
    },

    /// The turn's final, authoritative text.
    Result {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageStats>,
    },

    /// A usage update not attached to a result.
    Usage { usage: UsageStats },

    /// Administrative passthrough. `raw` always holds the original payload.
    System {
        raw: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// An error reported by the agent or protocol, surfaced as data.
    Error { text: String },
}

impl NormalizedEvent {
    /// Final-or-streamed answer text.
    pub fn text(text: impl Into<String>, is_partial: bool) -> Self {
        NormalizedEvent::Text {
            text: text.into(),
            is_partial,
            reasoning: false,
        }
    }

    /// Thinking/reasoning text.
    pub fn reasoning(text: impl Into<String>, is_partial: bool) -> Self {
        NormalizedEvent::Text {
            text: text.into(),
            is_partial,
            reasoning: true,
        }
    }

    pub fn system(raw: serde_json::Value) -> Self {
        NormalizedEvent::System { raw, message: None }
    }

    pub fn error(text: impl Into<String>) -> Self {
        NormalizedEvent::Error { text: text.into() }
    }
}

// ============================================================================
// TESTS
// ============================================================================
