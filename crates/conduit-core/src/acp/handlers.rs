//! Handlers for agent-initiated requests.
//!
//! An ACP agent may call back into the client: read or write a file, run a
//! command in a terminal, or ask permission before a tool call. Each method
//! name maps to one [`RequestHandler`] in a [`HandlerRegistry`]; the client
//! answers anything unregistered with `-32601 Method not found`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::types::{
    CreateTerminalParams, JsonRpcError, PermissionOutcome, ReadTextFileParams,
    RequestPermissionParams, RequestPermissionResponse, TerminalExitStatus, TerminalIdParams,
    WriteTextFileParams,
};
use crate::shell::prepare_path_env;

/// Answers one inbound JSON-RPC method.
///
/// Handlers run on their own task, so a slow one (waiting for a terminal to
/// exit, say) never stalls the client's read loop.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value, JsonRpcError>;
}

/// Method name to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `method`.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(JsonRpcError::invalid_params)
}

/// Register the fs and terminal handlers.
///
/// Permission handling is left to the caller because the policy differs per
/// host; see [`AutoApprovePermissions`] for the unattended one.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry, terminals: Arc<TerminalRegistry>) {
    registry.register("fs/read_text_file", Arc::new(ReadTextFile));
    registry.register("fs/write_text_file", Arc::new(WriteTextFile));

    for (method, op) in [
        ("terminal/create", TerminalOp::Create),
        ("terminal/output", TerminalOp::Output),
        ("terminal/wait_for_exit", TerminalOp::WaitForExit),
        ("terminal/kill", TerminalOp::Kill),
        ("terminal/release", TerminalOp::Release),
    ] {
        registry.register(
            method,
            Arc::new(TerminalHandler {
                registry: Arc::clone(&terminals),
                op,
            }),
        );
    }
}

// ============================================================================
// Filesystem
// ============================================================================

/// `fs/read_text_file`. `line` is 1-based; `limit` caps the number of lines.
pub struct ReadTextFile;

#[async_trait]
impl RequestHandler for ReadTextFile {
    async fn handle(&self, params: Value) -> Result<Value, JsonRpcError> {
        let params: ReadTextFileParams = parse_params(params)?;
        let content = tokio::fs::read_to_string(&params.path)
            .await
            .map_err(|e| JsonRpcError::internal(format!("{}: {}", params.path, e)))?;

        let content = if params.line.is_some() || params.limit.is_some() {
            let skip = params.line.unwrap_or(1).saturating_sub(1);
            let take = params.limit.unwrap_or(usize::MAX);
            content
                .lines()
                .skip(skip)
                .take(take)
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            content
        };

        Ok(json!({ "content": content }))
    }
}

/// `fs/write_text_file`. Missing parent directories are created.
pub struct WriteTextFile;

#[async_trait]
impl RequestHandler for WriteTextFile {
    async fn handle(&self, params: Value) -> Result<Value, JsonRpcError> {
        let params: WriteTextFileParams = parse_params(params)?;
        if let Some(parent) = Path::new(&params.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(JsonRpcError::internal)?;
            }
        }
        tokio::fs::write(&params.path, params.content.as_bytes())
            .await
            .map_err(|e| JsonRpcError::internal(format!("{}: {}", params.path, e)))?;
        Ok(Value::Null)
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// `session/request_permission` without a human in the loop.
///
/// Selects the first option whose kind starts with `allow`; when none does,
/// the request is answered `cancelled`.
pub struct AutoApprovePermissions;

impl AutoApprovePermissions {
    pub fn decide(params: &RequestPermissionParams) -> PermissionOutcome {
        params
            .options
            .iter()
            .find(|opt| opt.kind.starts_with("allow"))
            .map(|opt| PermissionOutcome::Selected {
                option_id: opt.option_id.clone(),
            })
            .unwrap_or(PermissionOutcome::Cancelled)
    }
}

#[async_trait]
impl RequestHandler for AutoApprovePermissions {
    async fn handle(&self, params: Value) -> Result<Value, JsonRpcError> {
        let params: RequestPermissionParams = parse_params(params)?;
        let outcome = Self::decide(&params);
        log::info!("Permission request answered: {:?}", outcome);
        serde_json::to_value(RequestPermissionResponse { outcome }).map_err(JsonRpcError::internal)
    }
}

// ============================================================================
// Terminals
// ============================================================================

/// Retained terminal output, optionally capped in bytes.
///
/// When the cap is exceeded the oldest output is dropped, always cutting on
/// a UTF-8 character boundary.
#[derive(Debug, Default)]
struct OutputBuffer {
    data: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        let Some(limit) = self.limit else {
            return;
        };
        if self.data.len() <= limit {
            return;
        }
        let mut cut = self.data.len() - limit;
        while !self.data.is_char_boundary(cut) {
            cut += 1;
        }
        self.data.drain(..cut);
        self.truncated = true;
    }
}

struct Terminal {
    output: Arc<Mutex<OutputBuffer>>,
    exit: watch::Receiver<Option<TerminalExitStatus>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl Terminal {
    fn request_kill(&self) {
        if let Ok(mut guard) = self.kill.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// Commands started on the agent's behalf, keyed by terminal id.
#[derive(Default)]
pub struct TerminalRegistry {
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
}

fn exit_status_of(status: std::process::ExitStatus) -> TerminalExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return TerminalExitStatus {
                exit_code: status.code(),
                signal: Some(signal.to_string()),
            };
        }
    }
    TerminalExitStatus {
        exit_code: status.code(),
        signal: None,
    }
}

fn spawn_reader<R>(stream: R, output: Arc<Mutex<OutputBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&buf);
                    if let Ok(mut out) = output.lock() {
                        out.push(&chunk);
                    }
                }
            }
        }
    })
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a command and return its terminal id.
    pub fn create(&self, params: CreateTerminalParams) -> Result<String, JsonRpcError> {
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
        prepare_path_env(&mut cmd, &params.command);
        for var in &params.env {
            cmd.env(&var.name, &var.value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| JsonRpcError::internal(format!("Failed to run {}: {}", params.command, e)))?;

        let output = Arc::new(Mutex::new(OutputBuffer::new(params.output_byte_limit)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&output)));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let command = params.command.clone();

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
            // Drain remaining output before publishing the exit.
            for reader in readers {
                let _ = tokio::time::timeout(std::time::Duration::from_secs(1), reader).await;
            }
            let status = match status {
                Ok(status) => exit_status_of(status),
                Err(e) => {
                    log::warn!("Waiting on terminal command {} failed: {}", command, e);
                    TerminalExitStatus {
                        exit_code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(status));
        });

        let id = uuid::Uuid::new_v4().to_string();
        let terminal = Arc::new(Terminal {
            output,
            exit: exit_rx,
            kill: Mutex::new(Some(kill_tx)),
        });
        if let Ok(mut map) = self.terminals.lock() {
            map.insert(id.clone(), terminal);
        }
        log::debug!("Terminal {} started: {}", id, params.command);
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Arc<Terminal>, JsonRpcError> {
        self.terminals
            .lock()
            .ok()
            .and_then(|map| map.get(id).cloned())
            .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown terminal {}", id)))
    }

    /// Current output, whether it was truncated, and the exit status if done.
    pub fn output(&self, id: &str) -> Result<(String, bool, Option<TerminalExitStatus>), JsonRpcError> {
        let terminal = self.get(id)?;
        let (data, truncated) = terminal
            .output
            .lock()
            .map(|out| (out.data.clone(), out.truncated))
            .unwrap_or_default();
        let exit = terminal.exit.borrow().clone();
        Ok((data, truncated, exit))
    }

    pub async fn wait_for_exit(&self, id: &str) -> Result<TerminalExitStatus, JsonRpcError> {
        let terminal = self.get(id)?;
        let mut exit = terminal.exit.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| JsonRpcError::internal("terminal watcher ended"))?
            .clone();
        status.ok_or_else(|| JsonRpcError::internal("terminal exit missing"))
    }

    /// Kill the command but keep the terminal so its output can still be read.
    pub fn kill(&self, id: &str) -> Result<(), JsonRpcError> {
        self.get(id)?.request_kill();
        Ok(())
    }

    /// Kill the command if still running and forget the terminal.
    pub fn release(&self, id: &str) -> Result<(), JsonRpcError> {
        let terminal = self
            .terminals
            .lock()
            .ok()
            .and_then(|mut map| map.remove(id))
            .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown terminal {}", id)))?;
        terminal.request_kill();
        Ok(())
    }

    /// Kill and forget every terminal.
    pub fn release_all(&self) {
        let drained: Vec<Arc<Terminal>> = match self.terminals.lock() {
            Ok(mut map) => map.drain().map(|(_, t)| t).collect(),
            Err(_) => return,
        };
        for terminal in drained {
            terminal.request_kill();
        }
    }

    pub fn len(&self) -> usize {
        self.terminals.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
enum TerminalOp {
    Create,
    Output,
    WaitForExit,
    Kill,
    Release,
}

struct TerminalHandler {
    registry: Arc<TerminalRegistry>,
    op: TerminalOp,
}

#[async_trait]
impl RequestHandler for TerminalHandler {
    async fn handle(&self, params: Value) -> Result<Value, JsonRpcError> {
        match self.op {
            TerminalOp::Create => {
                let params: CreateTerminalParams = parse_params(params)?;
                let id = self.registry.create(params)?;
                Ok(json!({ "terminalId": id }))
            }
            TerminalOp::Output => {
                let TerminalIdParams { terminal_id } = parse_params(params)?;
                let (output, truncated, exit) = self.registry.output(&terminal_id)?;
                Ok(json!({
                    "output": output,
                    "truncated": truncated,
                    "exitStatus": exit,
                }))
            }
            TerminalOp::WaitForExit => {
                let TerminalIdParams { terminal_id } = parse_params(params)?;
                let status = self.registry.wait_for_exit(&terminal_id).await?;
                serde_json::to_value(status).map_err(JsonRpcError::internal)
            }
            TerminalOp::Kill => {
                let TerminalIdParams { terminal_id } = parse_params(params)?;
                self.registry.kill(&terminal_id)?;
                Ok(Value::Null)
            }
            TerminalOp::Release => {
                let TerminalIdParams { terminal_id } = parse_params(params)?;
                self.registry.release(&terminal_id)?;
                Ok(Value::Null)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
