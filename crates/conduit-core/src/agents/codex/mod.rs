//! Codex JSON-lines parser.
//!
//! Codex has shipped two incompatible stdout formats (see [`types`]). The
//! parser decides per line which one it is looking at, so a stream that mixes
//! them, or starts with an echo line, still parses.

mod parser;
pub mod types;

pub use parser::CodexParser;
