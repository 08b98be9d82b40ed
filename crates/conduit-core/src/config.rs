//! Per-agent static settings.
//!
//! Parsers read the model name and context-window override once and cache
//! them; [`OutputParser::reset`](crate::agents::parser::OutputParser::reset)
//! re-reads them before every run so edits take effect without a restart.
//!
//! Settings live in `~/.config/conduit/agents/<agent>.toml`:
//!
//! ```toml
//! model = "claude-sonnet-4-5"
//! context_window = 200000
//! ```
//!
//! Codex additionally falls back to its own `~/.codex/config.toml`
//! (`model`, `model_context_window`), since most Codex users configure the
//! model there.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::agents::AgentKind;
use crate::paths::{agent_config_dir, get_home_dir};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings for one agent type. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub model: Option<String>,
    pub context_window: Option<u64>,
}

impl AgentSettings {
    /// Fill unset fields from `other`.
    fn or(self, other: AgentSettings) -> AgentSettings {
        AgentSettings {
            model: self.model.or(other.model),
            context_window: self.context_window.or(other.context_window),
        }
    }
}

/// Read-only source of per-agent settings.
pub trait AgentConfigSource: Send + Sync {
    fn load(&self, agent: AgentKind) -> Result<AgentSettings, ConfigError>;
}

/// A source that always returns empty settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConfig;

impl AgentConfigSource for NoConfig {
    fn load(&self, _agent: AgentKind) -> Result<AgentSettings, ConfigError> {
        Ok(AgentSettings::default())
    }
}

/// Codex's own config file layout (only the keys we use).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CodexConfigFile {
    model: Option<String>,
    model_context_window: Option<u64>,
}

/// TOML-file backed settings.
#[derive(Debug, Clone)]
pub struct TomlConfigSource {
    agents_dir: Option<PathBuf>,
    codex_home: Option<PathBuf>,
}

impl Default for TomlConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TomlConfigSource {
    /// Use the standard locations (`CONDUIT_CONFIG_DIR`, `CODEX_HOME` honored).
    pub fn new() -> Self {
        let codex_home = std::env::var_os("CODEX_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| get_home_dir().map(|h| h.join(".codex")));
        Self {
            agents_dir: agent_config_dir(),
            codex_home,
        }
    }

    /// Use explicit directories.
    pub fn with_dirs(agents_dir: Option<PathBuf>, codex_home: Option<PathBuf>) -> Self {
        Self {
            agents_dir,
            codex_home,
        }
    }

    fn read_optional<T>(path: &Path) -> Result<Option<T>, ConfigError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }
}

impl AgentConfigSource for TomlConfigSource {
    fn load(&self, agent: AgentKind) -> Result<AgentSettings, ConfigError> {
        let own: AgentSettings = match &self.agents_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.toml", agent.as_str()));
                let settings = Self::read_optional(&path)?.unwrap_or_default();
                log::debug!("Loaded {} settings from {}", agent, path.display());
                settings
            }
            None => AgentSettings::default(),
        };

        if agent != AgentKind::Codex {
            return Ok(own);
        }

        let codex = match &self.codex_home {
            Some(dir) => Self::read_optional::<CodexConfigFile>(&dir.join("config.toml"))?
                .map(|c| AgentSettings {
                    model: c.model,
                    context_window: c.model_context_window,
                })
                .unwrap_or_default(),
            None => AgentSettings::default(),
        };
        Ok(own.or(codex))
    }
}

/// Load settings, logging and defaulting on failure.
///
/// Parsers call this on construction and on reset; a broken settings file
/// degrades to the static defaults rather than stopping the run.
pub fn load_or_default(source: &dyn AgentConfigSource, agent: AgentKind) -> AgentSettings {
    source.load(agent).unwrap_or_else(|e| {
        log::warn!("Ignoring {} settings: {}", agent, e);
        AgentSettings::default()
    })
}

// ============================================================================
// TESTS
// ============================================================================
