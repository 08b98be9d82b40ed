//! Command construction for agent subprocesses.
//!
//! Agent CLIs are frequently installed by npm, cargo or Homebrew into
//! directories that a GUI-launched host does not have on its PATH. Every
//! command built here gets an augmented PATH with those directories (and the
//! binary's own directory) prepended.
//!
//! Line-based agents may additionally be run through the user's login shell,
//! which picks up whatever the shell profile exports.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::process::Command;

use crate::paths::common_tool_dirs;

/// Exit status emitted when an agent process terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentExit {
    pub code: i32,
    pub signal: Option<i32>,
}

impl AgentExit {
    /// Build from a std exit status, mapping signal deaths to `128 + signal`.
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self {
                    code: status.code().unwrap_or(128 + signal),
                    signal: Some(signal),
                };
            }
        }
        Self {
            code: status.code().unwrap_or(1),
            signal: None,
        }
    }
}

/// Compute a PATH value with the binary's parent directory and the common
/// tool install directories prepended to `existing`. Duplicates are dropped,
/// keeping the first occurrence.
pub fn augmented_path(binary_path: &str, existing: Option<OsString>) -> OsString {
    let mut entries: Vec<PathBuf> = Vec::new();

    if binary_path.contains('/') || binary_path.contains('\\') {
        if let Some(dir) = Path::new(binary_path).parent() {
            if !dir.as_os_str().is_empty() {
                entries.push(dir.to_path_buf());
            }
        }
    }
    entries.extend(common_tool_dirs());
    if let Some(existing) = existing {
        entries.extend(std::env::split_paths(&existing));
    }

    let mut seen = std::collections::HashSet::new();
    entries.retain(|p| seen.insert(p.clone()));

    std::env::join_paths(entries).unwrap_or_default()
}

/// Set the augmented PATH on a command.
pub fn prepare_path_env(cmd: &mut Command, binary_path: &str) {
    cmd.env(
        "PATH",
        augmented_path(binary_path, std::env::var_os("PATH")),
    );
}

/// Build a command that runs `binary_path` directly with the augmented PATH.
pub fn build_direct_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
) -> Command {
    let mut cmd = Command::new(binary_path);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, binary_path);
    cmd
}

/// Wrap `binary_path args...` in a login shell so the user's profile runs first.
///
/// The command line handed to the shell is quoted with [`quote_command`]. A
/// custom prefix such as `/bin/zsh -i -c` replaces the default `$SHELL -l -c`.
/// On Windows there is no login shell and the binary runs directly.
#[cfg(unix)]
pub fn build_login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, String> {
    let (program, shell_flags) = login_shell_invocation(shell_prefix)?;
    let command_line = quote_command(binary_path, args)?;

    let mut cmd = Command::new(program);
    cmd.args(shell_flags).arg(command_line);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, binary_path);
    Ok(cmd)
}

#[cfg(windows)]
pub fn build_login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    _shell_prefix: Option<&str>,
) -> Result<Command, String> {
    Ok(build_direct_command(binary_path, args, working_dir))
}

/// Quote a binary and its arguments into one shell-safe command string.
pub fn quote_command(binary_path: &str, args: &[String]) -> Result<String, String> {
    std::iter::once(binary_path)
        .chain(args.iter().map(String::as_str))
        .map(|word| {
            shlex::try_quote(word)
                .map(|quoted| quoted.into_owned())
                .map_err(|_| format!("Cannot quote {:?} for the shell", word))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|words| words.join(" "))
}

/// Shells that do not understand `-l -c`.
#[cfg(unix)]
const NON_POSIX_SHELLS: &[&str] = &["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

/// Split the shell prefix into program and flags.
#[cfg(unix)]
fn login_shell_invocation(custom_prefix: Option<&str>) -> Result<(String, Vec<String>), String> {
    let prefix = match custom_prefix.map(str::trim) {
        Some(custom) if !custom.is_empty() => custom.to_string(),
        _ => default_shell_prefix(std::env::var("SHELL").ok().as_deref()),
    };
    let mut words = prefix.split_whitespace().map(str::to_string);
    let program = words
        .next()
        .ok_or_else(|| "Shell prefix is empty".to_string())?;
    Ok((program, words.collect()))
}

/// `$SHELL -l -c`, substituting bash (or sh) for shells in [`NON_POSIX_SHELLS`].
#[cfg(unix)]
fn default_shell_prefix(shell: Option<&str>) -> String {
    let shell = shell.filter(|s| !s.is_empty()).unwrap_or("/bin/sh");
    let name = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let shell = if !NON_POSIX_SHELLS.contains(&name) {
        shell
    } else if Path::new("/bin/bash").exists() {
        "/bin/bash"
    } else {
        "/bin/sh"
    };
    format!("{} -l -c", shell)
}

// ============================================================================
// TESTS
// ============================================================================
