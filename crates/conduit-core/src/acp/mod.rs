//! Agent Client Protocol (ACP) support.
//!
//! ACP is JSON-RPC 2.0 over the agent's stdin/stdout, one message per line.
//! Unlike the line-based agents, the conversation is bidirectional: we send
//! `initialize`, `session/new` and `session/prompt`; the agent streams
//! `session/update` notifications back and may itself ask us to read files,
//! run terminals or approve a tool call.
//!
//! - [`client`]: the transport (process, pending requests, dispatch)
//! - [`handlers`]: answers to agent-initiated requests
//! - [`adapter`]: session updates to [`NormalizedEvent`](crate::agents::event::NormalizedEvent)
//! - [`process`]: one ACP agent run behind the [`AgentRun`](crate::run::AgentRun) contract

pub mod adapter;
pub mod client;
pub mod handlers;
pub mod process;
pub mod types;

pub use client::{AcpClient, AcpConnectConfig, UpdateCallback};
pub use handlers::{HandlerRegistry, RequestHandler, TerminalRegistry};
pub use process::{AcpAgentConfig, AcpAgentProcess, TextAccumulator};

use thiserror::Error;

/// Transport and protocol failures.
#[derive(Error, Debug)]
pub enum AcpError {
    #[error("Failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Agent stdin is closed")]
    StdinClosed,

    #[error("Not supported by agent: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
