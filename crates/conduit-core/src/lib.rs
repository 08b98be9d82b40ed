//! # conduit-core
//!
//! Drive heterogeneous AI coding-agent CLIs through one event model.
//!
//! Two kinds of agents are supported:
//! - agents speaking the Agent Client Protocol (JSON-RPC over stdio), see [`acp`]
//! - agents printing JSON lines on stdout, see [`spawn`] and [`agents`]
//!
//! Either way the host holds an [`AgentRun`] and reads [`RunEvent`]s; it never
//! needs to know which agent produced an event.
//!
//! ## Key Concepts
//!
//! - **NormalizedEvent**: unified event type across all agent backends
//! - **Turn**: one prompt and the agent's complete response, ending in a `Result`
//! - **ClassifiedError**: an agent failure mapped to a small fixed taxonomy

pub mod acp;
pub mod agents;
pub mod config;
pub mod event_bus;
pub mod logging;
pub mod paths;
pub mod run;
pub mod shell;
pub mod spawn;
pub mod usage;

// Re-export commonly used types
pub use acp::{AcpAgentConfig, AcpAgentProcess, AcpError};
pub use agents::errors::{AgentErrorType, ClassifiedError};
pub use agents::event::{NormalizedEvent, ToolState, ToolStatus, UsageStats};
pub use agents::AgentKind;
pub use run::{AgentRun, RunError, RunEvent};
pub use spawn::{LineAgentProcess, LineSpawnConfig, SpawnError};
