//! JSON-RPC transport to one ACP agent process.
//!
//! The client owns the agent's stdin and a table of requests awaiting a
//! response. One reader task consumes stdout line by line and routes every
//! message:
//!
//! - responses complete the matching pending request
//! - agent-initiated requests go to the [`HandlerRegistry`], each on its own task
//! - `session/update` notifications go to the update callback, synchronously
//!
//! Because updates are delivered from inside the read loop, every update that
//! arrived before a response has been handed to the callback by the time the
//! awaiting request returns. The process wrapper relies on this to build a
//! turn's final text.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conduit_core::acp::{AcpClient, AcpConnectConfig, HandlerRegistry};
//!
//! # async fn demo() -> Result<(), conduit_core::acp::AcpError> {
//! let config = AcpConnectConfig::new("gemini").with_args(vec!["--experimental-acp".into()]);
//! let on_update = Arc::new(|n: conduit_core::acp::types::SessionNotification| {
//!     println!("{}", n.update);
//! });
//! let (client, descriptor) = AcpClient::connect(config, HandlerRegistry::new(), on_update).await?;
//! let session = client.new_session("/tmp").await?;
//! client.prompt(&session, "hello", &[]).await?;
//! client.disconnect();
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};

use super::handlers::HandlerRegistry;
use super::types::{
    classify, AgentDescriptor, CancelParams, ClientCapabilities, ContentBlock, FsCapabilities,
    ImageContent, Implementation, Incoming, InitializeParams, JsonRpcError, LoadSessionParams,
    NewSessionParams, NewSessionResponse, OutgoingNotification, OutgoingRequest,
    OutgoingResponse, PromptParams, PromptResponse, SessionNotification, SetModeParams,
    StopReason, PROTOCOL_VERSION,
};
use super::AcpError;
use crate::logging::{disabled, log_line, Direction, LogHandle};
use crate::shell::{build_direct_command, AgentExit};
use crate::spawn::LossyLines;

/// Receives every `session/update` notification, in arrival order.
pub type UpdateCallback = Arc<dyn Fn(SessionNotification) + Send + Sync>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = Result<Value, AcpError>;

/// How long `disconnect` waits for an in-flight write before giving up on
/// closing stdin itself. The agent is killed either way.
const STDIN_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How to launch an ACP agent.
#[derive(Debug, Clone)]
pub struct AcpConnectConfig {
    pub binary_path: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub client_info: Implementation,
    pub log: LogHandle,
}

impl AcpConnectConfig {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            client_info: default_client_info(),
            log: disabled(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: Option<String>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_log(mut self, log: LogHandle) -> Self {
        self.log = log;
        self
    }
}

fn default_client_info() -> Implementation {
    Implementation {
        name: "conduit".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        title: None,
    }
}

struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Reply>,
}

/// Requests awaiting a response. Once closed, nothing new is accepted.
#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    closed: bool,
}

struct Shared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    handlers: HandlerRegistry,
    on_update: UpdateCallback,
    descriptor: Mutex<Option<AgentDescriptor>>,
    client_info: Implementation,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    log: LogHandle,
}

impl Shared {
    /// Reject every pending request with `ConnectionClosed` and refuse new ones.
    fn reject_all(&self) {
        let drained: Vec<(u64, PendingRequest)> = match self.pending.lock() {
            Ok(mut table) => {
                table.closed = true;
                table.entries.drain().collect()
            }
            Err(_) => return,
        };
        for (id, pending) in drained {
            log::debug!("Rejecting pending request {} ({})", id, pending.method);
            let _ = pending.reply.send(Err(AcpError::ConnectionClosed));
        }
    }

    fn take_pending(&self, id: u64) -> Option<PendingRequest> {
        self.pending.lock().ok()?.entries.remove(&id)
    }

    async fn write_line(&self, line: String) -> Result<(), AcpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(AcpError::StdinClosed)?;
        log_line(&self.log, Direction::Stdin, &line);

        let mut data = line;
        data.push('\n');
        let result = async {
            writer.write_all(data.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            log::warn!("Write to agent stdin failed: {}", e);
            *guard = None;
            return Err(AcpError::StdinClosed);
        }
        Ok(())
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), AcpError> {
        let line = serde_json::to_string(message)?;
        self.write_line(line).await
    }
}

/// Handle to one ACP connection. Cheap to clone; all clones share the
/// same process and pending table.
#[derive(Clone)]
pub struct AcpClient {
    shared: Arc<Shared>,
    exit: watch::Receiver<Option<i32>>,
}

impl AcpClient {
    /// Spawn the agent, start the I/O tasks and perform `initialize`.
    pub async fn connect(
        config: AcpConnectConfig,
        handlers: HandlerRegistry,
        on_update: UpdateCallback,
    ) -> Result<(Self, AgentDescriptor), AcpError> {
        let mut cmd = build_direct_command(
            &config.binary_path,
            &config.args,
            config.working_dir.as_deref(),
        );
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!(
            "Starting ACP agent: {} {}",
            config.binary_path,
            config.args.join(" ")
        );
        let mut child = cmd.spawn().map_err(AcpError::Spawn)?;

        let missing = |name: &str| {
            AcpError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("agent {} unavailable", name),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let client = Self::start(
            stdout,
            Box::new(stdin),
            handlers,
            on_update,
            config.client_info.clone(),
            config.log.clone(),
            exit_rx,
            Some(kill_tx),
        );

        if let Some(stderr) = stderr {
            let log = config.log.clone();
            tokio::spawn(async move {
                let mut lines = LossyLines::new(stderr);
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("acp stderr: {}", line);
                    log_line(&log, Direction::Stderr, &line);
                }
            });
        }

        let shared = Arc::clone(&client.shared);
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
            let code = match status {
                Ok(status) => AgentExit::from_status(status).code,
                Err(e) => {
                    log::warn!("Waiting on ACP agent failed: {}", e);
                    -1
                }
            };
            log::info!("ACP agent exited with code {}", code);
            shared.reject_all();
            let _ = exit_tx.send(Some(code));
        });

        match client.initialize().await {
            Ok(descriptor) => Ok((client, descriptor)),
            Err(e) => {
                client.disconnect();
                Err(AcpError::HandshakeFailed(e.to_string()))
            }
        }
    }

    /// Run the protocol over arbitrary streams, without a process.
    ///
    /// Nothing is sent until [`initialize`](Self::initialize) is called.
    /// Must be called inside a tokio runtime.
    pub fn from_streams<R, W>(
        reader: R,
        writer: W,
        handlers: HandlerRegistry,
        on_update: UpdateCallback,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (_exit_tx, exit_rx) = watch::channel(None);
        Self::start(
            reader,
            Box::new(writer),
            handlers,
            on_update,
            default_client_info(),
            disabled(),
            exit_rx,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn start<R>(
        reader: R,
        writer: BoxedWriter,
        handlers: HandlerRegistry,
        on_update: UpdateCallback,
        client_info: Implementation,
        log: LogHandle,
        exit: watch::Receiver<Option<i32>>,
        kill: Option<oneshot::Sender<()>>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
            handlers,
            on_update,
            descriptor: Mutex::new(None),
            client_info,
            kill: Mutex::new(kill),
            log,
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut lines = LossyLines::new(reader);
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => dispatch_line(&reader_shared, &line),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Reading agent stdout failed: {}", e);
                        break;
                    }
                }
            }
            log::debug!("Agent stdout closed");
            reader_shared.reject_all();
        });

        Self { shared, exit }
    }

    // ------------------------------------------------------------------
    // Generic JSON-RPC
    // ------------------------------------------------------------------

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, AcpError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self
                .shared
                .pending
                .lock()
                .map_err(|_| AcpError::ConnectionClosed)?;
            if table.closed {
                return Err(AcpError::ConnectionClosed);
            }
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    reply: tx,
                },
            );
        }

        let message = OutgoingRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        if let Err(e) = self.shared.write_message(&message).await {
            self.shared.take_pending(id);
            return Err(e);
        }

        rx.await.unwrap_or(Err(AcpError::ConnectionClosed))
    }

    /// Typed variant of [`request`](Self::request).
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, AcpError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| AcpError::InvalidMessage(format!("{} response: {}", method, e)))
    }

    /// Send a notification. No response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), AcpError> {
        self.shared
            .write_message(&OutgoingNotification {
                jsonrpc: "2.0",
                method,
                params,
            })
            .await
    }

    // ------------------------------------------------------------------
    // ACP operations
    // ------------------------------------------------------------------

    /// Perform the `initialize` handshake and remember what the agent supports.
    pub async fn initialize(&self) -> Result<AgentDescriptor, AcpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_info: self.shared.client_info.clone(),
            client_capabilities: ClientCapabilities {
                fs: FsCapabilities {
                    read_text_file: self.shared.handlers.contains("fs/read_text_file"),
                    write_text_file: self.shared.handlers.contains("fs/write_text_file"),
                },
                terminal: self.shared.handlers.contains("terminal/create"),
            },
        };
        let descriptor: AgentDescriptor = self.call("initialize", &params).await?;
        match &descriptor.protocol_version {
            Some(version) if !version.is_supported() => log::warn!(
                "Agent speaks ACP version {}, we speak {}",
                version,
                PROTOCOL_VERSION
            ),
            Some(_) => {}
            None => log::debug!("Agent did not report an ACP version"),
        }
        if let Ok(mut slot) = self.shared.descriptor.lock() {
            *slot = Some(descriptor.clone());
        }
        Ok(descriptor)
    }

    /// The `initialize` result, once the handshake has completed.
    pub fn descriptor(&self) -> Option<AgentDescriptor> {
        self.shared.descriptor.lock().ok()?.clone()
    }

    pub async fn new_session(&self, cwd: &str) -> Result<String, AcpError> {
        let params = NewSessionParams {
            cwd: cwd.to_string(),
            mcp_servers: Vec::new(),
        };
        let response: NewSessionResponse = self.call("session/new", &params).await?;
        Ok(response.session_id)
    }

    /// Resume a previous session. The agent replays its history as
    /// `session/update` notifications before responding.
    pub async fn load_session(&self, session_id: &str, cwd: &str) -> Result<(), AcpError> {
        let supported = self
            .descriptor()
            .map(|d| d.capabilities.load_session)
            .unwrap_or(false);
        if !supported {
            return Err(AcpError::Unsupported("session/load".to_string()));
        }
        let params = LoadSessionParams {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
            mcp_servers: Vec::new(),
        };
        self.request("session/load", serde_json::to_value(&params)?)
            .await?;
        Ok(())
    }

    /// Send a prompt and wait for the turn to end.
    pub async fn prompt(
        &self,
        session_id: &str,
        text: &str,
        images: &[ImageContent],
    ) -> Result<StopReason, AcpError> {
        let mut prompt = vec![ContentBlock::Text {
            text: text.to_string(),
        }];
        prompt.extend(images.iter().map(|img| ContentBlock::Image {
            data: img.data.clone(),
            mime_type: img.mime_type.clone(),
        }));
        let params = PromptParams {
            session_id: session_id.to_string(),
            prompt,
        };
        let response: PromptResponse = self.call("session/prompt", &params).await?;
        Ok(response.stop_reason)
    }

    /// Ask the agent to stop the current turn. Does not wait for anything.
    pub async fn cancel(&self, session_id: &str) -> Result<(), AcpError> {
        let params = CancelParams {
            session_id: session_id.to_string(),
        };
        self.notify("session/cancel", serde_json::to_value(&params)?)
            .await
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<(), AcpError> {
        let params = SetModeParams {
            session_id: session_id.to_string(),
            mode_id: mode_id.to_string(),
        };
        self.request("session/set_mode", serde_json::to_value(&params)?)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Tear the connection down.
    ///
    /// Pending requests are rejected before this returns. The agent process,
    /// if any, is killed. Idempotent.
    pub fn disconnect(&self) {
        self.shared.reject_all();
        if let Ok(mut kill) = self.shared.kill.lock() {
            if let Some(tx) = kill.take() {
                let _ = tx.send(());
            }
        }
        self.close_stdin();
    }

    /// Drop our end of the agent's stdin so it sees EOF.
    ///
    /// A write holding the lock is allowed to finish first, up to
    /// [`STDIN_CLOSE_GRACE`].
    fn close_stdin(&self) {
        let runtime = Handle::try_current().ok();
        if let Ok(mut slot) = self.shared.writer.try_lock() {
            if let (Some(mut writer), Some(runtime)) = (slot.take(), runtime) {
                runtime.spawn(async move {
                    let _ = writer.shutdown().await;
                });
            }
            return;
        }

        let Some(runtime) = runtime else {
            log::warn!("Agent stdin busy and no runtime to close it on");
            return;
        };
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            match tokio::time::timeout(STDIN_CLOSE_GRACE, shared.writer.lock()).await {
                Ok(mut slot) => {
                    if let Some(mut writer) = slot.take() {
                        let _ = writer.shutdown().await;
                    }
                }
                Err(_) => log::warn!("Agent stdin still busy, not closing it"),
            }
        });
    }

    /// True once the connection no longer accepts requests.
    pub fn is_closed(&self) -> bool {
        self.shared.pending.lock().map(|t| t.closed).unwrap_or(true)
    }

    /// Wait for the agent process to exit. `None` when there is no process
    /// (see [`from_streams`](Self::from_streams)).
    pub async fn wait_for_exit(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        let code = *exit.wait_for(Option::is_some).await.ok()?;
        code
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .map(|t| t.entries.len())
            .unwrap_or(0)
    }
}

fn dispatch_line(shared: &Arc<Shared>, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    log_line(&shared.log, Direction::Stdout, trimmed);

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Skipping malformed agent line ({}): {}", e, trimmed);
            return;
        }
    };

    match classify(value) {
        Incoming::Response { id, result } => {
            let Some(numeric) = id.as_u64() else {
                log::warn!("Response with non-numeric id {}", id);
                return;
            };
            let Some(pending) = shared.take_pending(numeric) else {
                log::debug!("Response for unknown request {}", numeric);
                return;
            };
            let reply = result.map_err(|e| AcpError::Rpc {
                code: e.code,
                message: e.message,
                data: e.data,
            });
            let _ = pending.reply.send(reply);
        }
        Incoming::Request { id, method, params } => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let result = match shared.handlers.get(&method) {
                    Some(handler) => handler.handle(params).await,
                    None => {
                        log::warn!("Agent called unsupported method {}", method);
                        Err(JsonRpcError::method_not_found(&method))
                    }
                };
                let response = OutgoingResponse::from_result(id, result);
                if let Err(e) = shared.write_message(&response).await {
                    log::warn!("Could not answer {}: {}", method, e);
                }
            });
        }
        Incoming::Notification { method, params } => {
            if method == "session/update" {
                match serde_json::from_value::<SessionNotification>(params) {
                    Ok(notification) => (shared.on_update)(notification),
                    Err(e) => log::warn!("Malformed session/update: {}", e),
                }
            } else {
                log::debug!("Ignoring notification {}", method);
            }
        }
        Incoming::Unknown(value) => {
            log::warn!("Unrecognized message from agent: {}", value);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::handlers::RequestHandler;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{duplex, split, AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    /// The agent's end of an in-memory connection.
    struct FakeAgent {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeAgent {
        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.send_raw(&value.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.send_bytes(line.as_bytes()).await;
        }

        async fn send_bytes(&mut self, line: &[u8]) {
            self.writer.write_all(line).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn connect_pair(handlers: HandlerRegistry, on_update: UpdateCallback) -> (AcpClient, FakeAgent) {
        let (client_io, agent_io) = duplex(64 * 1024);
        let (client_read, client_write) = split(client_io);
        let (agent_read, agent_write) = split(agent_io);
        let client = AcpClient::from_streams(client_read, client_write, handlers, on_update);
        let agent = FakeAgent {
            lines: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };
        (client, agent)
    }

    fn no_updates() -> UpdateCallback {
        Arc::new(|_| {})
    }

    fn collecting() -> (UpdateCallback, Arc<Mutex<Vec<SessionNotification>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: UpdateCallback = Arc::new(move |n| sink.lock().unwrap().push(n));
        (callback, seen)
    }

    mod requests {
        use super::*;

        #[tokio::test]
        async fn response_completes_matching_request() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.request("ping", json!({"a": 1})).await }
            });

            let msg = agent.recv().await;
            assert_eq!(msg["jsonrpc"], "2.0");
            assert_eq!(msg["id"], 1);
            assert_eq!(msg["method"], "ping");
            assert_eq!(msg["params"]["a"], 1);

            agent.send(json!({"jsonrpc":"2.0","id":1,"result":{"pong":true}})).await;
            assert_eq!(task.await.unwrap().unwrap(), json!({"pong": true}));
            assert_eq!(client.pending_count(), 0);
        }

        #[tokio::test]
        async fn ids_increase_and_out_of_order_responses_match() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let first = tokio::spawn({
                let client = client.clone();
                async move { client.request("a", Value::Null).await }
            });
            assert_eq!(agent.recv().await["id"], 1);
            let second = tokio::spawn({
                let client = client.clone();
                async move { client.request("b", Value::Null).await }
            });
            assert_eq!(agent.recv().await["id"], 2);

            agent.send(json!({"id":2,"result":"second"})).await;
            agent.send(json!({"id":1,"result":"first"})).await;
            assert_eq!(first.await.unwrap().unwrap(), json!("first"));
            assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        }

        #[tokio::test]
        async fn error_response_becomes_rpc_error() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.request("session/new", json!({})).await }
            });
            agent.recv().await;
            agent
                .send(json!({"id":1,"error":{"code":-32000,"message":"Authentication required"}}))
                .await;
            match task.await.unwrap() {
                Err(AcpError::Rpc { code, message, .. }) => {
                    assert_eq!(code, -32000);
                    assert_eq!(message, "Authentication required");
                }
                other => panic!("expected Rpc error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn malformed_lines_are_skipped() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.request("x", Value::Null).await }
            });
            agent.recv().await;
            agent.send_raw("this is not json").await;
            agent.send_raw("{\"id\": 99, \"result\": 1}").await;
            agent.send(json!({"id":1,"result":"ok"})).await;
            assert_eq!(task.await.unwrap().unwrap(), json!("ok"));
        }
    }

    mod closing {
        use super::*;

        #[tokio::test]
        async fn invalid_utf8_line_keeps_connection_open() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.request("x", Value::Null).await }
            });
            agent.recv().await;
            agent.send_bytes(b"\xff\xfe garbage").await;
            agent.send(json!({"id":1,"result":"still here"})).await;

            assert_eq!(task.await.unwrap().unwrap(), json!("still here"));
            assert!(!client.is_closed());
        }

        #[tokio::test]
        async fn disconnect_closes_stdin_after_in_flight_write() {
            let (client_io, agent_io) = duplex(64);
            let (client_read, client_write) = split(client_io);
            let client = AcpClient::from_streams(
                client_read,
                client_write,
                HandlerRegistry::new(),
                no_updates(),
            );
            let mut agent_lines = BufReader::new(agent_io).lines();

            let big = "x".repeat(4096);
            let write = tokio::spawn({
                let client = client.clone();
                async move { client.notify("big", json!({ "data": big })).await }
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.disconnect();

            let first = agent_lines.next_line().await.unwrap().unwrap();
            assert!(first.contains("\"method\":\"big\""));
            let eof = tokio::time::timeout(Duration::from_secs(5), agent_lines.next_line())
                .await
                .expect("stdin was never closed");
            assert_eq!(eof.unwrap(), None);
            write.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn eof_rejects_pending() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.request("x", Value::Null).await }
            });
            agent.recv().await;
            drop(agent);
            assert!(matches!(task.await.unwrap(), Err(AcpError::ConnectionClosed)));
            assert!(client.is_closed());
        }

        #[tokio::test]
        async fn disconnect_rejects_pending_synchronously() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.request("x", Value::Null).await }
            });
            agent.recv().await;
            assert_eq!(client.pending_count(), 1);

            client.disconnect();
            assert_eq!(client.pending_count(), 0);
            assert!(matches!(task.await.unwrap(), Err(AcpError::ConnectionClosed)));

            // Idempotent, and later requests fail immediately.
            client.disconnect();
            assert!(matches!(
                client.request("y", Value::Null).await,
                Err(AcpError::ConnectionClosed)
            ));
        }

        #[tokio::test]
        async fn notify_after_disconnect_is_stdin_closed() {
            let (client, _agent) = connect_pair(HandlerRegistry::new(), no_updates());
            client.disconnect();
            assert!(matches!(
                client.notify("session/cancel", json!({})).await,
                Err(AcpError::StdinClosed)
            ));
        }

        #[tokio::test]
        async fn no_process_means_no_exit_code() {
            let (client, _agent) = connect_pair(HandlerRegistry::new(), no_updates());
            assert_eq!(client.wait_for_exit().await, None);
        }
    }

    mod inbound {
        use super::*;

        struct Echo;

        #[async_trait]
        impl RequestHandler for Echo {
            async fn handle(&self, params: Value) -> Result<Value, JsonRpcError> {
                Ok(json!({"echo": params}))
            }
        }

        struct Failing;

        #[async_trait]
        impl RequestHandler for Failing {
            async fn handle(&self, _params: Value) -> Result<Value, JsonRpcError> {
                Err(JsonRpcError::new(-32010, "nope"))
            }
        }

        #[tokio::test]
        async fn unregistered_method_gets_method_not_found() {
            let (_client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            agent
                .send(json!({"jsonrpc":"2.0","id":"r1","method":"fs/read_text_file","params":{}}))
                .await;
            let reply = agent.recv().await;
            assert_eq!(reply["id"], "r1");
            assert_eq!(reply["error"]["code"], -32601);
            assert!(reply.get("result").is_none());
        }

        #[tokio::test]
        async fn registered_handler_answers() {
            let mut handlers = HandlerRegistry::new();
            handlers.register("echo", Arc::new(Echo));
            handlers.register("fail", Arc::new(Failing));
            let (_client, mut agent) = connect_pair(handlers, no_updates());

            agent.send(json!({"id":7,"method":"echo","params":{"x":1}})).await;
            let reply = agent.recv().await;
            assert_eq!(reply["id"], 7);
            assert_eq!(reply["result"], json!({"echo":{"x":1}}));

            agent.send(json!({"id":8,"method":"fail","params":{}})).await;
            let reply = agent.recv().await;
            assert_eq!(reply["error"]["code"], -32010);
        }
    }

    mod updates {
        use super::*;

        #[tokio::test]
        async fn delivered_in_order_before_response() {
            let (on_update, seen) = collecting();
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), on_update);
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.prompt("s1", "hi", &[]).await }
            });

            let msg = agent.recv().await;
            assert_eq!(msg["method"], "session/prompt");
            assert_eq!(msg["params"]["prompt"][0]["text"], "hi");

            for chunk in ["a", "b", "c"] {
                agent
                    .send(json!({"jsonrpc":"2.0","method":"session/update","params":{
                        "sessionId":"s1",
                        "update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":chunk}}
                    }}))
                    .await;
            }
            agent.send(json!({"id":1,"result":{"stopReason":"end_turn"}})).await;

            assert_eq!(task.await.unwrap().unwrap(), StopReason::EndTurn);
            let seen = seen.lock().unwrap();
            let texts: Vec<&str> = seen
                .iter()
                .map(|n| n.update["content"]["text"].as_str().unwrap())
                .collect();
            assert_eq!(texts, ["a", "b", "c"]);
        }

        #[tokio::test]
        async fn other_notifications_are_ignored() {
            let (on_update, seen) = collecting();
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), on_update);
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.request("x", Value::Null).await }
            });
            agent.recv().await;
            agent.send(json!({"method":"$/progress","params":{}})).await;
            agent.send(json!({"id":1,"result":null})).await;
            task.await.unwrap().unwrap();
            assert!(seen.lock().unwrap().is_empty());
        }
    }

    mod session {
        use super::*;

        async fn handshake(client: &AcpClient, agent: &mut FakeAgent, load_session: bool) {
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.initialize().await }
            });
            let msg = agent.recv().await;
            assert_eq!(msg["method"], "initialize");
            assert_eq!(msg["params"]["protocolVersion"], 1);
            assert_eq!(msg["params"]["clientInfo"]["name"], "conduit");
            agent
                .send(json!({"id": msg["id"], "result": {
                    "protocolVersion": 1,
                    "agentCapabilities": {"loadSession": load_session}
                }}))
                .await;
            let descriptor = task.await.unwrap().unwrap();
            assert_eq!(descriptor.capabilities.load_session, load_session);
        }

        #[tokio::test]
        async fn string_protocol_version_completes_handshake() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.initialize().await }
            });
            let msg = agent.recv().await;
            agent
                .send(json!({"id": msg["id"], "result": {"protocolVersion": "1"}}))
                .await;
            let descriptor = task.await.unwrap().unwrap();
            assert!(descriptor.protocol_version.unwrap().is_supported());
            assert!(client.descriptor().is_some());
        }

        #[tokio::test]
        async fn load_session_requires_capability() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            handshake(&client, &mut agent, false).await;
            assert!(matches!(
                client.load_session("old", "/tmp").await,
                Err(AcpError::Unsupported(_))
            ));
        }

        #[tokio::test]
        async fn load_session_when_supported() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            handshake(&client, &mut agent, true).await;
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.load_session("old", "/tmp").await }
            });
            let msg = agent.recv().await;
            assert_eq!(msg["method"], "session/load");
            assert_eq!(msg["params"]["sessionId"], "old");
            agent.send(json!({"id": msg["id"], "result": null})).await;
            task.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn new_session_and_cancel() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.new_session("/work").await }
            });
            let msg = agent.recv().await;
            assert_eq!(msg["params"]["cwd"], "/work");
            assert_eq!(msg["params"]["mcpServers"], json!([]));
            agent.send(json!({"id": msg["id"], "result": {"sessionId": "s-9"}})).await;
            assert_eq!(task.await.unwrap().unwrap(), "s-9");

            client.cancel("s-9").await.unwrap();
            let msg = agent.recv().await;
            assert_eq!(msg["method"], "session/cancel");
            assert!(msg.get("id").is_none());
        }

        #[tokio::test]
        async fn set_mode_sends_request() {
            let (client, mut agent) = connect_pair(HandlerRegistry::new(), no_updates());
            let task = tokio::spawn({
                let client = client.clone();
                async move { client.set_mode("s", "plan").await }
            });
            let msg = agent.recv().await;
            assert_eq!(msg["method"], "session/set_mode");
            assert_eq!(msg["params"]["modeId"], "plan");
            agent.send(json!({"id": msg["id"], "result": {}})).await;
            task.await.unwrap().unwrap();
        }
    }
}
