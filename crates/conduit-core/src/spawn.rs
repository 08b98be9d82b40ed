//! Line-based agent processes.
//!
//! Agents such as Claude Code and Codex print one JSON object per stdout
//! line. [`LineAgentProcess`] spawns such an agent and runs every line through
//! its [`OutputParser`](crate::agents::parser::OutputParser), publishing the
//! results on the same [`RunEvent`] stream an ACP run uses.
//!
//! Per run there are three tasks:
//! - stdout reader: parse, detect structured errors, emit
//! - stderr reader: log and keep a capped copy for exit classification
//! - exit watcher: wait for the process, drain both readers, classify, emit `Exit`
//!
//! # Rust Concept: tokio tasks instead of threads
//!
//! Each reader is a `tokio::spawn`ed future rather than an OS thread. The
//! exit watcher holds their `JoinHandle`s and awaits them after the child
//! exits, which guarantees every stdout line has been parsed before `Exit`
//! goes out.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;

use crate::agents::errors::{AgentErrorType, ClassifiedError};
use crate::agents::parser::SharedParser;
use crate::agents::AgentKind;
use crate::event_bus::{EventBus, EventReceiver};
use crate::logging::{log_line, open_log_file, Direction, LogHandle};
use crate::run::{AgentRun, RunError, RunEvent};
use crate::shell::{build_direct_command, build_login_shell_command, AgentExit};

/// Bytes of stderr (and trailing stdout) kept for exit classification.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// How long `stop()` waits after SIGINT before killing.
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Invalid command: {0}")]
    Command(String),
    #[error("Failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Failed to capture {0}")]
    MissingPipe(&'static str),
}

/// Configuration for spawning a line-based agent.
#[derive(Debug, Clone)]
pub struct LineSpawnConfig {
    pub agent: AgentKind,
    /// Path to the agent binary
    pub binary_path: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    /// Run through the user's login shell instead of directly.
    pub login_shell: bool,
    /// Custom shell prefix (e.g., "/bin/zsh -l -c"). Implies `login_shell`.
    pub shell_prefix: Option<String>,
    /// Line written to stdin right after spawning
    pub initial_stdin: Option<String>,
    /// Whether the process reads stdin at all
    pub uses_stdin: bool,
    pub log_dir: Option<PathBuf>,
    pub log_id: Option<String>,
}

impl LineSpawnConfig {
    pub fn new(agent: AgentKind, binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            agent,
            binary_path: binary_path.into(),
            args,
            working_dir: None,
            env: Vec::new(),
            login_shell: false,
            shell_prefix: None,
            initial_stdin: None,
            uses_stdin: true,
            log_dir: None,
            log_id: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn login_shell(mut self) -> Self {
        self.login_shell = true;
        self
    }

    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self.login_shell = true;
        self
    }

    pub fn initial_stdin(mut self, message: impl Into<String>) -> Self {
        self.initial_stdin = Some(message.into());
        self
    }

    pub fn no_stdin(mut self) -> Self {
        self.uses_stdin = false;
        self
    }

    pub fn log(mut self, dir: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self.log_id = Some(id.into());
        self
    }

    fn build_command(&self) -> Result<Command, SpawnError> {
        let mut cmd = if self.login_shell {
            build_login_shell_command(
                &self.binary_path,
                &self.args,
                self.working_dir.as_deref(),
                self.shell_prefix.as_deref(),
            )
            .map_err(SpawnError::Command)?
        } else {
            build_direct_command(&self.binary_path, &self.args, self.working_dir.as_deref())
        };
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if self.uses_stdin {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

/// Append `text` plus a newline, dropping the oldest bytes past `CAPTURE_LIMIT`.
fn capture(buffer: &Mutex<String>, text: &str) {
    let Ok(mut buf) = buffer.lock() else {
        return;
    };
    buf.push_str(text);
    buf.push('\n');
    if buf.len() > CAPTURE_LIMIT {
        let mut cut = buf.len() - CAPTURE_LIMIT;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// Line reader that tolerates invalid UTF-8.
///
/// Bad byte sequences become U+FFFD instead of ending the stream. Only EOF
/// or a real I/O error stops it.
pub(crate) struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    pub(crate) fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
            buf: Vec::new(),
        }
    }

    /// Next line without its `\n` or `\r\n` terminator. `None` at EOF.
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

struct Inner {
    config: LineSpawnConfig,
    parser: SharedParser,
    bus: EventBus,
    log: LogHandle,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pid: Mutex<Option<u32>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    stdout_tail: Mutex<String>,
    stderr: Mutex<String>,
    started: AtomicBool,
    killed: AtomicBool,
    exited: AtomicBool,
}

impl Inner {
    fn emit(&self, event: RunEvent) {
        if !self.killed.load(Ordering::SeqCst) {
            self.bus.emit(event);
        }
    }

    fn emit_exit(&self, code: i32) {
        if self.killed.load(Ordering::SeqCst) || self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.emit(RunEvent::Exit(code));
    }

    fn fail(&self, message: impl std::fmt::Display) {
        let message = message.to_string();
        log::error!("{} failed to start: {}", self.config.agent, message);
        self.emit(RunEvent::AgentError(ClassifiedError::new(
            AgentErrorType::Unknown,
            message,
            false,
            self.config.agent,
        )));
        self.emit_exit(1);
    }

    fn handle_stdout(&self, line: &str) {
        log_line(&self.log, Direction::Stdout, line);
        capture(&self.stdout_tail, line);

        let (events, error) = match self.parser.lock() {
            Ok(mut parser) => (parser.parse_events(line), parser.detect_error_from_line(line)),
            Err(_) => {
                log::warn!("Parser lock poisoned, dropping line");
                return;
            }
        };
        for event in events {
            self.emit(RunEvent::Data(event));
        }
        if let Some(error) = error {
            log::warn!("{} reported {:?}: {}", self.config.agent, error.error_type, error.message);
            self.emit(RunEvent::AgentError(error));
        }
    }

    fn handle_stderr(&self, line: &str) {
        log::debug!("{} stderr: {}", self.config.agent, line);
        log_line(&self.log, Direction::Stderr, line);
        capture(&self.stderr, line);
    }

    fn handle_exit(&self, exit: AgentExit) {
        log::info!(
            "{} exited with code {} (signal {:?})",
            self.config.agent,
            exit.code,
            exit.signal
        );
        let stderr = self.stderr.lock().map(|s| s.clone()).unwrap_or_default();
        let stdout = self.stdout_tail.lock().map(|s| s.clone()).unwrap_or_default();
        let error = self
            .parser
            .lock()
            .ok()
            .and_then(|parser| parser.detect_error_from_exit(exit.code, &stderr, &stdout));
        if let Some(error) = error {
            self.emit(RunEvent::AgentError(error));
        }
        self.emit_exit(exit.code);
    }

    fn request_kill(&self) {
        if let Ok(mut kill) = self.kill.lock() {
            if let Some(tx) = kill.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// A line-based agent run. Clones share the same run.
#[derive(Clone)]
pub struct LineAgentProcess {
    inner: Arc<Inner>,
}

impl LineAgentProcess {
    /// Prepare a run. Nothing is spawned until [`AgentRun::start`].
    ///
    /// The parser is reset at start, so one parser can serve consecutive
    /// runs of the same agent.
    pub fn new(config: LineSpawnConfig, parser: SharedParser) -> Self {
        let log_id = config
            .log_id
            .clone()
            .unwrap_or_else(|| config.agent.as_str().to_string());
        let log = open_log_file(config.log_dir.as_deref(), &log_id);
        Self {
            inner: Arc::new(Inner {
                config,
                parser,
                bus: EventBus::new(),
                log,
                stdin: tokio::sync::Mutex::new(None),
                pid: Mutex::new(None),
                kill: Mutex::new(None),
                stdout_tail: Mutex::new(String::new()),
                stderr: Mutex::new(String::new()),
                started: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                exited: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &LineSpawnConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
            && !self.inner.exited.load(Ordering::SeqCst)
            && !self.inner.killed.load(Ordering::SeqCst)
    }

    async fn spawn(&self) -> Result<(), SpawnError> {
        let inner = &self.inner;
        let mut child = inner.config.build_command()?.spawn()?;

        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;
        let mut stdin = child.stdin.take();

        if let Some(initial) = &inner.config.initial_stdin {
            if let Some(pipe) = stdin.as_mut() {
                log_line(&inner.log, Direction::Stdin, initial);
                pipe.write_all(format!("{}\n", initial).as_bytes()).await?;
                pipe.flush().await?;
            }
        }
        *inner.stdin.lock().await = stdin;
        if let Ok(mut pid) = inner.pid.lock() {
            *pid = child.id();
        }

        let out = Arc::clone(inner);
        let stdout_task = tokio::spawn(async move {
            let mut lines = LossyLines::new(stdout);
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => out.handle_stdout(&line),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Reading {} stdout failed: {}", out.config.agent, e);
                        break;
                    }
                }
            }
        });

        let err = Arc::clone(inner);
        let stderr_task = tokio::spawn(async move {
            let mut lines = LossyLines::new(stderr);
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => err.handle_stderr(&line),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Reading {} stderr failed: {}", err.config.agent, e);
                        break;
                    }
                }
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        if let Ok(mut kill) = inner.kill.lock() {
            *kill = Some(kill_tx);
        }

        let watcher = Arc::clone(inner);
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            watcher.stdin.lock().await.take();

            let exit = match status {
                Ok(status) => AgentExit::from_status(status),
                Err(e) => {
                    log::warn!("Waiting on {} failed: {}", watcher.config.agent, e);
                    AgentExit {
                        code: 1,
                        signal: None,
                    }
                }
            };
            watcher.handle_exit(exit);
        });

        Ok(())
    }

    /// Send SIGINT and give the agent a moment to exit; kill it otherwise.
    pub async fn stop(&self) {
        self.inner.stdin.lock().await.take();
        if !self.interrupt() {
            self.inner.request_kill();
            return;
        }
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.inner.exited.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.inner.request_kill();
    }

    /// Deliver SIGINT. Returns false where signals are unavailable.
    fn interrupt(&self) -> bool {
        #[cfg(unix)]
        {
            let pid = self.inner.pid.lock().ok().and_then(|p| *p);
            if let Some(pid) = pid {
                if !self.inner.exited.load(Ordering::SeqCst) {
                    // SAFETY: kill(2) with a pid we spawned; no memory is touched.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGINT);
                    }
                }
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl AgentRun for LineAgentProcess {
    async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            log::warn!("{} run already started", self.inner.config.agent);
            return;
        }
        if let Ok(mut parser) = self.inner.parser.lock() {
            parser.reset();
        }
        log::info!(
            "Starting {}: {} {}",
            self.inner.config.agent,
            self.inner.config.binary_path,
            self.inner.config.args.join(" ")
        );
        if let Err(e) = self.spawn().await {
            self.inner.fail(e);
        }
    }

    async fn write(&self, text: &str) -> Result<(), RunError> {
        if self.inner.killed.load(Ordering::SeqCst) || !self.inner.started.load(Ordering::SeqCst) {
            return Err(RunError::NotRunning);
        }
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(RunError::StdinClosed)?;
        log_line(&self.inner.log, Direction::Stdin, text);
        stdin.write_all(format!("{}\n", text).as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn cancel(&self) {
        self.interrupt();
    }

    async fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.bus.close();
        self.inner.stdin.lock().await.take();
        self.inner.request_kill();
    }

    fn subscribe(&self) -> EventReceiver {
        self.inner.bus.subscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================
