//! Filesystem locations used by conduit.

use std::env;
use std::path::PathBuf;

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Option<PathBuf> {
    for var in ["HOME", "USERPROFILE"] {
        if let Ok(value) = env::var(var) {
            if !value.is_empty() {
                return Some(PathBuf::from(value));
            }
        }
    }
    None
}

/// Directory holding per-agent settings files (`~/.config/conduit/agents`).
///
/// `CONDUIT_CONFIG_DIR` overrides the base directory.
pub fn agent_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("CONDUIT_CONFIG_DIR") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join("agents"));
        }
    }
    get_home_dir().map(|home| home.join(".config").join("conduit").join("agents"))
}

/// Directories where agent CLIs are commonly installed but which are often
/// missing from the PATH of GUI-launched processes.
pub fn common_tool_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(unix)]
    {
        if let Some(home) = get_home_dir() {
            for rel in [".local/bin", ".cargo/bin", ".npm-global/bin", ".bun/bin", ".volta/bin"] {
                dirs.push(home.join(rel));
            }
        }
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        dirs.push(PathBuf::from("/usr/local/bin"));
    }

    #[cfg(windows)]
    {
        if let Ok(appdata) = env::var("APPDATA") {
            dirs.push(PathBuf::from(appdata).join("npm"));
        }
        if let Some(home) = get_home_dir() {
            dirs.push(home.join(".cargo").join("bin"));
        }
    }

    dirs
}
