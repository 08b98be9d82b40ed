//! Claude Code stream-json parser.
//!
//! Claude Code prints a single output format, so every line goes through the
//! same `type` dispatch.

mod parser;
mod types;

pub use parser::ClaudeParser;
pub use types::*;
