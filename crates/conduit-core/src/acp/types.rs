//! ACP wire types.
//!
//! JSON-RPC framing plus the handful of ACP payloads this crate sends or
//! answers. ACP uses camelCase keys throughout, so most structs carry
//! `#[serde(rename_all = "camelCase")]`.
//!
//! Incoming messages are not deserialized into one untagged enum: the shape
//! decides the kind (see [`classify`]), and the order of those checks matters
//! more than any serde variant order would make obvious.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version we speak.
pub const PROTOCOL_VERSION: u32 = 1;

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// ============================================================================
// JSON-RPC framing
// ============================================================================

#[derive(Debug, Serialize)]
pub struct OutgoingRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct OutgoingNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(err: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", err))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, err.to_string())
    }
}

/// Our answer to an agent-initiated request.
#[derive(Debug, Serialize)]
pub struct OutgoingResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl OutgoingResponse {
    pub fn from_result(id: Value, result: Result<Value, JsonRpcError>) -> Self {
        match result {
            Ok(value) => Self {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                jsonrpc: "2.0",
                id,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// An incoming line, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// `id` + `result`/`error`: the answer to one of our requests.
    Response {
        id: Value,
        result: Result<Value, JsonRpcError>,
    },
    /// `id` + `method`: the agent asks us something.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// `method` without `id`.
    Notification { method: String, params: Value },
    /// None of the above.
    Unknown(Value),
}

/// Classify a decoded message. Checks run in a fixed order: response, then
/// request, then notification.
pub fn classify(value: Value) -> Incoming {
    let mut map = match value {
        Value::Object(map) => map,
        other => return Incoming::Unknown(other),
    };

    let id = map.remove("id").filter(|id| !id.is_null());
    let method = map
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(id) = id {
        if map.contains_key("result") || map.contains_key("error") {
            let result = match map.remove("error").filter(|e| !e.is_null()) {
                Some(error) => Err(serde_json::from_value(error.clone()).unwrap_or_else(|_| {
                    JsonRpcError::new(INTERNAL_ERROR, error.to_string())
                })),
                None => Ok(map.remove("result").unwrap_or(Value::Null)),
            };
            return Incoming::Response { id, result };
        }
        if let Some(method) = method {
            let params = map.remove("params").unwrap_or(Value::Null);
            return Incoming::Request { id, method, params };
        }
        map.insert("id".to_string(), id);
        return Incoming::Unknown(Value::Object(map));
    }

    if let Some(method) = method {
        let params = map.remove("params").unwrap_or(Value::Null);
        return Incoming::Notification { method, params };
    }
    Incoming::Unknown(Value::Object(map))
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: FsCapabilities,
    pub terminal: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u32,
    pub client_info: Implementation,
    pub client_capabilities: ClientCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptCapabilities {
    pub image: bool,
    pub audio: bool,
    pub embedded_context: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentCapabilities {
    pub load_session: bool,
    pub prompt_capabilities: PromptCapabilities,
}

/// Protocol version as an agent reports it.
///
/// Some agents send the version as a string. Anything else is kept as is
/// so an odd value never fails the handshake.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ProtocolVersion {
    Number(u64),
    Text(String),
    Other(Value),
}

impl ProtocolVersion {
    pub fn as_number(&self) -> Option<u64> {
        match self {
            ProtocolVersion::Number(n) => Some(*n),
            ProtocolVersion::Text(s) => s.trim().parse().ok(),
            ProtocolVersion::Other(_) => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.as_number() == Some(u64::from(PROTOCOL_VERSION))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::Number(n) => write!(f, "{}", n),
            ProtocolVersion::Text(s) => write!(f, "{}", s),
            ProtocolVersion::Other(v) => write!(f, "{}", v),
        }
    }
}

/// What the agent told us about itself in the `initialize` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDescriptor {
    pub protocol_version: Option<ProtocolVersion>,
    pub agent_info: Option<Implementation>,
    #[serde(rename = "agentCapabilities")]
    pub capabilities: AgentCapabilities,
    pub auth_methods: Vec<Value>,
}

// ============================================================================
// Sessions and prompts
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    pub cwd: String,
    pub mcp_servers: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSessionParams {
    pub session_id: String,
    pub cwd: String,
    pub mcp_servers: Vec<Value>,
}

/// A prompt content block.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// A base64 image attached to a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    pub session_id: String,
    pub prompt: Vec<ContentBlock>,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModeParams {
    pub session_id: String,
    pub mode_id: String,
}

/// Params of a `session/update` notification.
///
/// `update` stays raw: the adapter interprets it and passes unknown kinds
/// through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: Value,
}

// ============================================================================
// Agent-initiated requests
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub name: String,
    /// `allow_once`, `allow_always`, `reject_once`, `reject_always`
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_call: Option<Value>,
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

/// `{"outcome":{"outcome":"selected","optionId":"..."}}` or `{"outcome":{"outcome":"cancelled"}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    Selected {
        #[serde(rename = "optionId")]
        option_id: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestPermissionResponse {
    pub outcome: PermissionOutcome,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    pub path: String,
    /// 1-based first line.
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalIdParams {
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitStatus {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================
