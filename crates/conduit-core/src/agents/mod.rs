//! Agent identities, the normalized event model, and the line-based output parsers.
//!
//! Each line-based agent lives in its own module with the same layout:
//! - `types.rs`: serde views of the agent's raw JSON lines
//! - `parser.rs`: the [`OutputParser`](parser::OutputParser) implementation
//!
//! ACP-speaking agents don't need a parser; see [`crate::acp`].

pub mod claude;
pub mod codex;
pub mod errors;
pub mod event;
pub mod parser;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The agent CLIs this layer knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "opencode")]
    OpenCode,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
    #[serde(rename = "copilot")]
    Copilot,
    /// Any other agent reached over ACP.
    #[serde(rename = "acp")]
    Acp,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::ClaudeCode,
        AgentKind::Codex,
        AgentKind::OpenCode,
        AgentKind::GeminiCli,
        AgentKind::Copilot,
        AgentKind::Acp,
    ];

    /// Stable identifier used in config file names and error reports.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::ClaudeCode => "claude-code",
            AgentKind::Codex => "codex",
            AgentKind::OpenCode => "opencode",
            AgentKind::GeminiCli => "gemini-cli",
            AgentKind::Copilot => "copilot",
            AgentKind::Acp => "acp",
        }
    }

    /// Context window used when the agent does not report one.
    pub fn default_context_window(self) -> u64 {
        match self {
            AgentKind::ClaudeCode => 200_000,
            AgentKind::Codex => 200_000,
            AgentKind::OpenCode => 128_000,
            AgentKind::GeminiCli => 1_048_576,
            AgentKind::Copilot => 128_000,
            AgentKind::Acp => 200_000,
        }
    }

    /// Whether the agent's provider enforces a single combined input+output
    /// token limit. For these agents output tokens count against the window.
    pub fn uses_combined_context(self) -> bool {
        matches!(self, AgentKind::Codex)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .or(match normalized.as_str() {
                "claude" => Some(AgentKind::ClaudeCode),
                "gemini" => Some(AgentKind::GeminiCli),
                _ => None,
            })
            .ok_or_else(|| format!("Unknown agent: {}", s))
    }
}
