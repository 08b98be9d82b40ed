//! Error classification for agent output.
//!
//! Agents report failures in wildly different ways: a JSON error object on
//! stdout, an HTTP status line on stderr, or just a non-zero exit. This module
//! turns whatever text we could extract into a [`ClassifiedError`] the host
//! can act on (re-login, wait and retry, start a fresh session, ...).
//!
//! The patterns themselves come from an [`ErrorPatternProvider`]. Hosts with
//! their own pattern catalog plug it in; everyone else gets [`BuiltinPatterns`].

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::AgentKind;

/// What kind of failure an agent reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorType {
    AuthExpired,
    TokenExhaustion,
    RateLimited,
    NetworkError,
    PermissionDenied,
    SessionNotFound,
    AgentCrashed,
    Unknown,
}

/// An agent failure with enough context for the host to decide what to do.
///
/// `recoverable` is advisory. This layer never retries on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub error_type: AgentErrorType,
    pub message: String,
    pub recoverable: bool,
    pub agent: AgentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ClassifiedError {
    pub fn new(
        error_type: AgentErrorType,
        message: impl Into<String>,
        recoverable: bool,
        agent: AgentKind,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            recoverable,
            agent,
            raw: None,
        }
    }

    pub fn from_match(found: PatternMatch, agent: AgentKind) -> Self {
        Self::new(found.error_type, found.message, found.recoverable, agent)
    }

    /// Generic crash for a non-zero exit we could not explain.
    pub fn crashed(code: i32, agent: AgentKind) -> Self {
        Self::new(
            AgentErrorType::AgentCrashed,
            format!("Agent exited with code {}", code),
            true,
            agent,
        )
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }
}

/// One entry in a pattern catalog.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub regex: Regex,
    pub error_type: AgentErrorType,
    pub message: String,
    pub recoverable: bool,
}

impl ErrorPattern {
    /// Compile a pattern. Returns `None` (and logs) for an invalid regex so a
    /// bad catalog entry never takes the whole catalog down.
    pub fn new(
        pattern: &str,
        error_type: AgentErrorType,
        message: &str,
        recoverable: bool,
    ) -> Option<Self> {
        match Regex::new(pattern) {
            Ok(regex) => Some(Self {
                regex,
                error_type,
                message: message.to_string(),
                recoverable,
            }),
            Err(e) => {
                log::warn!("Skipping invalid error pattern {:?}: {}", pattern, e);
                None
            }
        }
    }
}

/// Result of matching text against a pattern catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub error_type: AgentErrorType,
    pub message: String,
    pub recoverable: bool,
}

/// Source of error patterns, supplied per agent.
///
/// # Rust Concept: Default Trait Methods
///
/// `match_text` has a default body, so most providers only implement
/// `patterns`. A provider with smarter matching (say, scoring several
/// candidates) can still override it.
pub trait ErrorPatternProvider: Send + Sync {
    /// Patterns for one agent, most specific first.
    fn patterns(&self, agent: AgentKind) -> Vec<ErrorPattern>;

    /// First pattern whose regex matches `text`.
    fn match_text(&self, patterns: &[ErrorPattern], text: &str) -> Option<PatternMatch> {
        patterns
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| PatternMatch {
                error_type: p.error_type,
                message: p.message.clone(),
                recoverable: p.recoverable,
            })
    }
}

/// Regex, type, message, recoverable.
type PatternRow = (&'static str, AgentErrorType, &'static str, bool);

/// Built-in catalog covering the failures every agent CLI runs into.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPatterns;

const COMMON_PATTERNS: &[PatternRow] = &[
    (
        r"(?i)prompt is too long|context[ _](length|window)[ _]exceeded|maximum context length|too many tokens|input is too long",
        AgentErrorType::TokenExhaustion,
        "The conversation no longer fits in the model's context window",
        true,
    ),
    (
        r"(?i)rate[ _]?limit|too many requests|\b429\b|overloaded|quota exceeded|usage limit",
        AgentErrorType::RateLimited,
        "Rate limited by the model provider",
        true,
    ),
    (
        r"(?i)invalid api key|invalid x-api-key|unauthorized|\b401\b|not logged in|please run /login|token (has )?expired|authentication (failed|error|required)",
        AgentErrorType::AuthExpired,
        "Authentication failed or expired, log in again",
        true,
    ),
    (
        r"(?i)session not found|no conversation found|unknown session|thread not found",
        AgentErrorType::SessionNotFound,
        "The session to resume no longer exists",
        true,
    ),
    (
        r"(?i)permission denied|\bEACCES\b|operation not permitted",
        AgentErrorType::PermissionDenied,
        "Permission denied",
        false,
    ),
    (
        r"(?i)ECONNREFUSED|ENOTFOUND|ETIMEDOUT|ECONNRESET|network error|connection (refused|reset|closed)|socket hang up|fetch failed|stream disconnected",
        AgentErrorType::NetworkError,
        "Network error while talking to the model provider",
        true,
    ),
];

const CLAUDE_PATTERNS: &[PatternRow] = &[(
    r"(?i)credit balance is too low",
    AgentErrorType::RateLimited,
    "Account credit balance is too low",
    false,
)];

const CODEX_PATTERNS: &[PatternRow] = &[(
    r"(?i)OPENAI_API_KEY|not signed in|run `?codex login`?",
    AgentErrorType::AuthExpired,
    "Codex is not signed in, run `codex login`",
    true,
)];

fn compile(table: &'static [PatternRow]) -> impl Iterator<Item = ErrorPattern> {
    table
        .iter()
        .filter_map(|(re, ty, msg, rec)| ErrorPattern::new(re, *ty, msg, *rec))
}

impl ErrorPatternProvider for BuiltinPatterns {
    fn patterns(&self, agent: AgentKind) -> Vec<ErrorPattern> {
        let specific: &'static [PatternRow] = match agent {
            AgentKind::ClaudeCode => CLAUDE_PATTERNS,
            AgentKind::Codex => CODEX_PATTERNS,
            _ => &[],
        };
        compile(specific).chain(compile(COMMON_PATTERNS)).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
