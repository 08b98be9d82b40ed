//! The host-facing contract shared by every agent run.
//!
//! Whether an agent speaks ACP ([`crate::acp::AcpAgentProcess`]) or prints
//! JSON lines ([`crate::spawn::LineAgentProcess`]), the host drives it through
//! [`AgentRun`] and reads [`RunEvent`]s from a subscription. The host never
//! needs to know which transport is underneath.
//!
//! Failures are events, not return values: a run that cannot start emits one
//! `AgentError` followed by one `Exit`, so the host always sees a terminal
//! signal.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::agents::errors::ClassifiedError;
use crate::agents::event::NormalizedEvent;
use crate::event_bus::EventReceiver;

/// What a run reports to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum RunEvent {
    /// A normalized agent event.
    Data(NormalizedEvent),
    /// The run ended with this exit code. Emitted at most once.
    Exit(i32),
    /// A classified failure. Usually followed by `Exit`.
    AgentError(ClassifiedError),
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Agent is not running")]
    NotRunning,
    #[error("Agent stdin is closed")]
    StdinClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Imperative control surface of one agent run.
///
/// # Rust Concept: async-trait
///
/// Async functions in traits used as `dyn AgentRun` need boxing. The
/// `#[async_trait]` macro rewrites each `async fn` into one returning
/// `Pin<Box<dyn Future + Send>>`, which keeps the trait object-safe.
#[async_trait]
pub trait AgentRun: Send + Sync {
    /// Launch the agent. Startup failures are reported as events.
    async fn start(&self);

    /// Send user input: a prompt for ACP agents, a stdin line otherwise.
    async fn write(&self, text: &str) -> Result<(), RunError>;

    /// Ask the agent to stop the current turn. Best effort, idempotent.
    async fn cancel(&self);

    /// Terminate the agent. Nothing is emitted afterwards. Idempotent.
    async fn kill(&self);

    /// Subscribe to this run's events.
    fn subscribe(&self) -> EventReceiver;
}
