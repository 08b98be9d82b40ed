//! One ACP agent run behind the [`AgentRun`] contract.
//!
//! [`AcpAgentProcess`] connects to the agent, opens (or resumes) a session,
//! and turns each prompt into a stream of [`RunEvent`]s:
//!
//! ```text
//! session/update ──► adapter ──► TextAccumulator ──► Data(Text delta)
//!                                                └─► Data(ToolUse / System / Init)
//! session/prompt response ─────────────────────────► Data(Result{whole answer})
//! process exit ────────────────────────────────────► Exit(code)
//! ```
//!
//! Agents disagree on whether message chunks are incremental or cumulative,
//! so every text chunk passes through a [`TextAccumulator`] which forwards
//! only what has not been emitted yet.
//!
//! Failures never escape as errors: they become one `AgentError` followed by
//! one `Exit(1)`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::json;

use super::adapter::to_normalized;
use super::client::{AcpClient, AcpConnectConfig, UpdateCallback};
use super::handlers::{
    register_builtin_handlers, AutoApprovePermissions, HandlerRegistry, TerminalRegistry,
};
use super::types::SessionNotification;
use super::AcpError;
use crate::agents::errors::{AgentErrorType, ClassifiedError};
use crate::agents::event::NormalizedEvent;
use crate::agents::AgentKind;
use crate::event_bus::{EventBus, EventReceiver};
use crate::logging::{open_log_file, LogHandle};
use crate::run::{AgentRun, RunError, RunEvent};

/// Configuration for one ACP agent run.
///
/// # Example
///
/// ```rust
/// use conduit_core::acp::AcpAgentConfig;
///
/// let config = AcpAgentConfig::new("gemini")
///     .with_args(vec!["--experimental-acp".to_string()])
///     .with_working_dir("/tmp/project")
///     .with_initial_prompt("Summarize the README");
/// assert_eq!(config.initial_prompt.as_deref(), Some("Summarize the README"));
/// ```
#[derive(Debug, Clone)]
pub struct AcpAgentConfig {
    pub agent: AgentKind,
    pub binary_path: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub initial_prompt: Option<String>,
    /// Resume this session with `session/load` instead of starting a new one.
    pub resume_session_id: Option<String>,
    /// Applied with `session/set_mode` once the session exists.
    pub mode: Option<String>,
    /// Answer permission requests without asking anyone.
    pub auto_approve: bool,
    pub log_dir: Option<PathBuf>,
    pub log_id: Option<String>,
}

impl AcpAgentConfig {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            agent: AgentKind::Acp,
            binary_path: binary_path.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            initial_prompt: None,
            resume_session_id: None,
            mode: None,
            auto_approve: true,
            log_dir: None,
            log_id: None,
        }
    }

    pub fn with_agent(mut self, agent: AgentKind) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_resume_session(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_log(mut self, dir: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self.log_id = Some(id.into());
        self
    }
}

/// Tracks what a turn has already emitted, per channel.
///
/// - a chunk that extends everything emitted so far forwards only the suffix
/// - a chunk identical to everything emitted so far forwards nothing
/// - any other chunk is an increment and is forwarded as-is
///
/// Answer and reasoning text are tracked separately and never mixed.
#[derive(Debug, Default, Clone)]
pub struct TextAccumulator {
    answer: String,
    reasoning: String,
}

impl TextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk and return the part that still needs emitting.
    pub fn push(&mut self, chunk: &str, reasoning: bool) -> Option<String> {
        if chunk.is_empty() {
            return None;
        }
        let emitted = if reasoning {
            &mut self.reasoning
        } else {
            &mut self.answer
        };

        if !emitted.is_empty() && chunk.starts_with(emitted.as_str()) {
            let suffix = &chunk[emitted.len()..];
            if suffix.is_empty() {
                return None;
            }
            let suffix = suffix.to_string();
            emitted.push_str(&suffix);
            return Some(suffix);
        }

        emitted.push_str(chunk);
        Some(chunk.to_string())
    }

    /// Everything emitted on the answer channel this turn.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn reset(&mut self) {
        self.answer.clear();
        self.reasoning.clear();
    }
}

struct Inner {
    config: AcpAgentConfig,
    bus: EventBus,
    log: LogHandle,
    terminals: Arc<TerminalRegistry>,
    client: Mutex<Option<AcpClient>>,
    session_id: Mutex<Option<String>>,
    accumulator: Mutex<TextAccumulator>,
    started: AtomicBool,
    killed: AtomicBool,
    /// Set once `Exit` has gone out.
    finished: AtomicBool,
    turn_in_flight: AtomicBool,
    /// Set while `session/load` replays history; those updates are dropped.
    replaying: AtomicBool,
}

impl Inner {
    fn emit(&self, event: RunEvent) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        self.bus.emit(event);
    }

    fn emit_data(&self, event: NormalizedEvent) {
        self.emit(RunEvent::Data(event));
    }

    /// Emit the terminal pair once: the error if there is one, then `Exit`.
    ///
    /// The exit watcher and a failing turn can race here. Whoever gets in
    /// first decides what the subscriber sees.
    fn finish(&self, error: Option<ClassifiedError>, code: i32) {
        if self.killed.load(Ordering::SeqCst) || self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(error) = error {
            self.bus.emit(RunEvent::AgentError(error));
        }
        self.bus.emit(RunEvent::Exit(code));
    }

    fn fail(&self, message: impl std::fmt::Display) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        // Out of the slot first, so `write` reports NotRunning from here on.
        let client = self.client.lock().ok().and_then(|mut slot| slot.take());
        if !self.finished.load(Ordering::SeqCst) {
            let message = message.to_string();
            log::error!("ACP agent failed: {}", message);
            let error =
                ClassifiedError::new(AgentErrorType::Unknown, message, false, self.config.agent);
            self.finish(Some(error), 1);
        }
        if let Some(client) = client {
            client.disconnect();
        }
    }

    /// The agent process went away on its own.
    fn exited(&self, code: i32) {
        if self.turn_in_flight.load(Ordering::SeqCst) {
            self.fail(format!("ACP agent exited with code {} during a turn", code));
        } else {
            self.finish(None, code);
        }
    }

    fn client(&self) -> Option<AcpClient> {
        self.client.lock().ok()?.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok()?.clone()
    }

    fn handle_update(&self, notification: SessionNotification) {
        if self.killed.load(Ordering::SeqCst) || self.replaying.load(Ordering::SeqCst) {
            return;
        }
        let Some(event) = to_normalized(&notification.update) else {
            return;
        };

        match event {
            NormalizedEvent::Text {
                text, reasoning, ..
            } => {
                let delta = match self.accumulator.lock() {
                    Ok(mut acc) => acc.push(&text, reasoning),
                    Err(_) => Some(text),
                };
                if let Some(delta) = delta {
                    self.emit_data(NormalizedEvent::Text {
                        text: delta,
                        is_partial: true,
                        reasoning,
                    });
                }
            }
            other => self.emit_data(other),
        }
    }
}

/// An ACP agent run. Clones share the same run.
#[derive(Clone)]
pub struct AcpAgentProcess {
    inner: Arc<Inner>,
}

impl AcpAgentProcess {
    pub fn new(config: AcpAgentConfig) -> Self {
        let log_id = config
            .log_id
            .clone()
            .unwrap_or_else(|| config.agent.as_str().to_string());
        let log = open_log_file(config.log_dir.as_deref(), &log_id);
        Self {
            inner: Arc::new(Inner {
                config,
                bus: EventBus::new(),
                log,
                terminals: Arc::new(TerminalRegistry::new()),
                client: Mutex::new(None),
                session_id: Mutex::new(None),
                accumulator: Mutex::new(TextAccumulator::new()),
                started: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                turn_in_flight: AtomicBool::new(false),
                replaying: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &AcpAgentConfig {
        &self.inner.config
    }

    /// The session id once one has been established.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    pub fn is_turn_in_flight(&self) -> bool {
        self.inner.turn_in_flight.load(Ordering::SeqCst)
    }

    /// Handlers this run answers agent requests with.
    pub fn handler_registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry, Arc::clone(&self.inner.terminals));
        if self.inner.config.auto_approve {
            registry.register("session/request_permission", Arc::new(AutoApprovePermissions));
        }
        registry
    }

    /// Callback feeding `session/update` notifications into this run.
    ///
    /// Holds only a weak reference, so the client owning it does not keep
    /// the run alive.
    pub fn update_callback(&self) -> UpdateCallback {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |notification| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_update(notification);
            }
        })
    }

    /// Drive the run over an already connected client.
    ///
    /// Performs `initialize` first. Used with [`AcpClient::from_streams`]
    /// when the agent is not a local process.
    pub async fn start_with_client(&self, client: AcpClient) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            log::warn!("ACP run already started");
            return;
        }
        if let Err(e) = client.initialize().await {
            client.disconnect();
            self.inner.fail(AcpError::HandshakeFailed(e.to_string()));
            return;
        }
        self.establish(client).await;
    }

    /// Install the client, open the session and kick off the initial prompt.
    async fn establish(&self, client: AcpClient) {
        let inner = &self.inner;
        if inner.killed.load(Ordering::SeqCst) {
            client.disconnect();
            return;
        }
        if let Ok(mut slot) = inner.client.lock() {
            *slot = Some(client.clone());
        }

        if let Some(descriptor) = client.descriptor() {
            if let Some(info) = &descriptor.agent_info {
                log::info!("Connected to {} {}", info.name, info.version);
            }
        }

        let watcher = Arc::clone(inner);
        let exit_client = client.clone();
        tokio::spawn(async move {
            if let Some(code) = exit_client.wait_for_exit().await {
                watcher.exited(code);
            }
        });

        let cwd = match &inner.config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| ".".to_string()),
        };

        let session = match self.open_session(&client, &cwd).await {
            Ok(id) => id,
            Err(e) => {
                inner.fail(e);
                return;
            }
        };
        log::info!("ACP session ready: {}", session);
        if let Ok(mut slot) = inner.session_id.lock() {
            *slot = Some(session.clone());
        }
        inner.emit_data(NormalizedEvent::Init {
            session_id: Some(session.clone()),
            slash_commands: None,
        });

        if let Some(mode) = &inner.config.mode {
            if let Err(e) = client.set_mode(&session, mode).await {
                log::warn!("Could not set mode {}: {}", mode, e);
            }
        }

        if let Some(prompt) = inner.config.initial_prompt.clone() {
            if self.begin_turn() {
                let run = self.clone();
                tokio::spawn(async move { run.run_turn(&prompt).await });
            }
        }
    }

    async fn open_session(&self, client: &AcpClient, cwd: &str) -> Result<String, AcpError> {
        let Some(resume) = self.inner.config.resume_session_id.clone() else {
            return client.new_session(cwd).await;
        };

        self.inner.replaying.store(true, Ordering::SeqCst);
        let loaded = client.load_session(&resume, cwd).await;
        self.inner.replaying.store(false, Ordering::SeqCst);

        match loaded {
            Ok(()) => Ok(resume),
            Err(AcpError::Unsupported(_)) => {
                log::warn!(
                    "Agent cannot resume session {}, starting a new one",
                    resume
                );
                client.new_session(cwd).await
            }
            Err(e) => Err(e),
        }
    }

    /// Claim the turn slot. False if a turn is already running.
    fn begin_turn(&self) -> bool {
        !self.inner.turn_in_flight.swap(true, Ordering::SeqCst)
    }

    fn reject_busy(&self, text: &str) {
        log::warn!("Prompt rejected, turn in progress");
        self.inner.emit_data(NormalizedEvent::System {
            raw: json!({"type": "prompt_rejected", "prompt": text}),
            message: Some("A turn is already in progress; prompt ignored".to_string()),
        });
    }

    /// Send one prompt and wait for the turn to finish.
    ///
    /// Emits the streamed deltas as they arrive and a `Result` holding the
    /// whole answer at the end. Rejected with a `System` notice while
    /// another turn is running.
    pub async fn send_prompt(&self, text: &str) {
        if !self.begin_turn() {
            self.reject_busy(text);
            return;
        }
        self.run_turn(text).await;
    }

    async fn run_turn(&self, text: &str) {
        let inner = &self.inner;
        if let Ok(mut acc) = inner.accumulator.lock() {
            acc.reset();
        }

        let (Some(client), Some(session)) = (inner.client(), inner.session_id()) else {
            inner.turn_in_flight.store(false, Ordering::SeqCst);
            inner.fail("No active ACP session");
            return;
        };

        match client.prompt(&session, text, &[]).await {
            Ok(stop_reason) => {
                log::debug!("Turn finished: {:?}", stop_reason);
                let answer = inner
                    .accumulator
                    .lock()
                    .map(|acc| acc.answer().to_string())
                    .unwrap_or_default();
                inner.emit_data(NormalizedEvent::Result {
                    text: answer,
                    usage: None,
                });
            }
            Err(e) => inner.fail(e),
        }
        inner.turn_in_flight.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentRun for AcpAgentProcess {
    async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            log::warn!("ACP run already started");
            return;
        }
        let config = &self.inner.config;
        let mut connect = AcpConnectConfig::new(config.binary_path.clone())
            .with_args(config.args.clone())
            .with_working_dir(config.working_dir.clone())
            .with_log(Arc::clone(&self.inner.log));
        for (key, value) in &config.env {
            connect = connect.with_env(key.clone(), value.clone());
        }

        match AcpClient::connect(connect, self.handler_registry(), self.update_callback()).await {
            Ok((client, _descriptor)) => self.establish(client).await,
            Err(e) => self.inner.fail(e),
        }
    }

    async fn write(&self, text: &str) -> Result<(), RunError> {
        let inner = &self.inner;
        if inner.killed.load(Ordering::SeqCst)
            || inner.finished.load(Ordering::SeqCst)
            || inner.client().is_none()
        {
            return Err(RunError::NotRunning);
        }
        if !self.begin_turn() {
            self.reject_busy(text);
            return Ok(());
        }
        let run = self.clone();
        let text = text.to_string();
        tokio::spawn(async move { run.run_turn(&text).await });
        Ok(())
    }

    async fn cancel(&self) {
        let (Some(client), Some(session)) = (self.inner.client(), self.inner.session_id()) else {
            return;
        };
        if let Err(e) = client.cancel(&session).await {
            log::debug!("Cancel not delivered: {}", e);
        }
    }

    async fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.bus.close();
        let client = self.inner.client.lock().ok().and_then(|mut c| c.take());
        if let Some(client) = client {
            client.disconnect();
        }
        self.inner.terminals.release_all();
        log::info!("ACP agent killed");
    }

    fn subscribe(&self) -> EventReceiver {
        self.inner.bus.subscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::{
        duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
        WriteHalf,
    };

    mod accumulator {
        use super::*;

        #[test]
        fn incremental_chunks_pass_through() {
            let mut acc = TextAccumulator::new();
            assert_eq!(acc.push("Hel", false).as_deref(), Some("Hel"));
            assert_eq!(acc.push("lo", false).as_deref(), Some("lo"));
            assert_eq!(acc.answer(), "Hello");
        }

        #[test]
        fn cumulative_chunks_forward_suffix() {
            let mut acc = TextAccumulator::new();
            assert_eq!(acc.push("Hel", false).as_deref(), Some("Hel"));
            assert_eq!(acc.push("Hello", false).as_deref(), Some("lo"));
            assert_eq!(acc.push("Hello world", false).as_deref(), Some(" world"));
            assert_eq!(acc.answer(), "Hello world");
        }

        #[test]
        fn identical_resend_emits_nothing() {
            let mut acc = TextAccumulator::new();
            acc.push("Hello", false);
            assert_eq!(acc.push("Hello", false), None);
            assert_eq!(acc.push("", false), None);
            assert_eq!(acc.answer(), "Hello");
        }

        #[test]
        fn channels_are_independent() {
            let mut acc = TextAccumulator::new();
            acc.push("thinking", true);
            assert_eq!(acc.push("thinking more", true).as_deref(), Some(" more"));
            assert_eq!(acc.push("answer", false).as_deref(), Some("answer"));
            assert_eq!(acc.answer(), "answer");
            assert_eq!(acc.reasoning(), "thinking more");
        }

        #[test]
        fn reset_starts_a_new_turn() {
            let mut acc = TextAccumulator::new();
            acc.push("Hello", false);
            acc.reset();
            assert_eq!(acc.push("Hello", false).as_deref(), Some("Hello"));
        }
    }

    /// Scripted agent on the other end of an in-memory pipe.
    struct FakeAgent {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeAgent {
        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("agent read timed out")
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn expect_request(&mut self, method: &str) -> Value {
            let msg = self.recv().await;
            assert_eq!(msg["method"], method, "unexpected message {msg}");
            msg
        }

        async fn reply(&mut self, request: &Value, result: Value) {
            self.send(serde_json::json!({"jsonrpc":"2.0","id": request["id"].clone(),"result": result}))
                .await;
        }

        async fn chunk(&mut self, kind: &str, text: &str) {
            self.send(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {"sessionId": "s1", "update": {
                    "sessionUpdate": kind,
                    "content": {"type": "text", "text": text}
                }}
            }))
            .await;
        }

        async fn handshake(&mut self, load_session: bool) {
            let init = self.expect_request("initialize").await;
            assert_eq!(init["params"]["clientCapabilities"]["terminal"], true);
            self.reply(
                &init,
                serde_json::json!({"protocolVersion": 1, "agentCapabilities": {"loadSession": load_session}}),
            )
            .await;
        }
    }

    fn wire(process: &AcpAgentProcess) -> (AcpClient, FakeAgent) {
        let (client_io, agent_io) = duplex(64 * 1024);
        let (client_read, client_write) = split(client_io);
        let (agent_read, agent_write) = split(agent_io);
        let client = AcpClient::from_streams(
            client_read,
            client_write,
            process.handler_registry(),
            process.update_callback(),
        );
        let agent = FakeAgent {
            lines: BufReader::new(agent_read).lines(),
            writer: agent_write,
        };
        (client, agent)
    }

    async fn next_event(rx: &mut EventReceiver) -> RunEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timed out")
            .expect("stream ended")
    }

    /// Nothing further arrives for a while.
    async fn assert_quiet(rx: &mut EventReceiver) {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            panic!("unexpected event {:?}", event);
        }
    }

    /// Start the run and complete the handshake plus `session/new`.
    async fn started(config: AcpAgentConfig) -> (AcpAgentProcess, FakeAgent, EventReceiver) {
        let process = AcpAgentProcess::new(config);
        let mut rx = process.subscribe();
        let (client, mut agent) = wire(&process);
        let run = process.clone();
        let start = tokio::spawn(async move { run.start_with_client(client).await });

        agent.handshake(false).await;
        let new = agent.expect_request("session/new").await;
        agent.reply(&new, serde_json::json!({"sessionId": "s1"})).await;
        start.await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            RunEvent::Data(NormalizedEvent::Init {
                session_id: Some("s1".to_string()),
                slash_commands: None
            })
        );
        (process, agent, rx)
    }

    mod turns {
        use super::*;

        #[tokio::test]
        async fn cumulative_chunks_become_deltas_and_result() {
            let (process, mut agent, mut rx) = started(AcpAgentConfig::new("fake")).await;
            process.write("hi").await.unwrap();

            let prompt = agent.expect_request("session/prompt").await;
            assert_eq!(prompt["params"]["sessionId"], "s1");
            agent.chunk("agent_thought_chunk", "Let me think").await;
            agent.chunk("agent_message_chunk", "Hel").await;
            agent.chunk("agent_message_chunk", "Hello").await;
            agent.chunk("agent_message_chunk", "Hello").await;
            agent.chunk("agent_message_chunk", "!").await;
            agent.reply(&prompt, serde_json::json!({"stopReason": "end_turn"})).await;

            assert_eq!(
                next_event(&mut rx).await,
                RunEvent::Data(NormalizedEvent::reasoning("Let me think", true))
            );
            assert_eq!(next_event(&mut rx).await, RunEvent::Data(NormalizedEvent::text("Hel", true)));
            assert_eq!(next_event(&mut rx).await, RunEvent::Data(NormalizedEvent::text("lo", true)));
            assert_eq!(next_event(&mut rx).await, RunEvent::Data(NormalizedEvent::text("!", true)));
            assert_eq!(
                next_event(&mut rx).await,
                RunEvent::Data(NormalizedEvent::Result {
                    text: "Hello!".to_string(),
                    usage: None
                })
            );
        }

        #[tokio::test]
        async fn second_prompt_while_busy_is_rejected() {
            let (process, mut agent, mut rx) = started(AcpAgentConfig::new("fake")).await;
            process.write("first").await.unwrap();
            let prompt = agent.expect_request("session/prompt").await;

            process.write("second").await.unwrap();
            match next_event(&mut rx).await {
                RunEvent::Data(NormalizedEvent::System { message, .. }) => {
                    assert!(message.unwrap().contains("in progress"));
                }
                other => panic!("expected System notice, got {:?}", other),
            }

            agent.reply(&prompt, serde_json::json!({"stopReason": "end_turn"})).await;
            assert!(matches!(
                next_event(&mut rx).await,
                RunEvent::Data(NormalizedEvent::Result { .. })
            ));
            assert!(!process.is_turn_in_flight());
        }

        #[tokio::test]
        async fn each_turn_starts_fresh() {
            let (process, mut agent, mut rx) = started(AcpAgentConfig::new("fake")).await;
            for _ in 0..2 {
                process.write("again").await.unwrap();
                let prompt = agent.expect_request("session/prompt").await;
                agent.chunk("agent_message_chunk", "same").await;
                agent.reply(&prompt, serde_json::json!({"stopReason": "end_turn"})).await;
                assert_eq!(next_event(&mut rx).await, RunEvent::Data(NormalizedEvent::text("same", true)));
                assert_eq!(
                    next_event(&mut rx).await,
                    RunEvent::Data(NormalizedEvent::Result {
                        text: "same".to_string(),
                        usage: None
                    })
                );
                while process.is_turn_in_flight() {
                    tokio::task::yield_now().await;
                }
            }
        }

        #[tokio::test]
        async fn permission_requests_are_auto_approved() {
            let (process, mut agent, _rx) = started(AcpAgentConfig::new("fake")).await;
            process.write("edit it").await.unwrap();
            let _prompt = agent.expect_request("session/prompt").await;

            agent
                .send(serde_json::json!({
                    "jsonrpc": "2.0", "id": 50, "method": "session/request_permission",
                    "params": {"sessionId": "s1", "toolCall": {"toolCallId": "t"},
                        "options": [{"optionId": "ok", "name": "Allow", "kind": "allow_once"}]}
                }))
                .await;
            let reply = agent.recv().await;
            assert_eq!(reply["id"], 50);
            assert_eq!(reply["result"]["outcome"]["optionId"], "ok");
        }

        #[tokio::test]
        async fn initial_prompt_is_sent_after_session() {
            let process = AcpAgentProcess::new(AcpAgentConfig::new("fake").with_initial_prompt("go"));
            let (client, mut agent) = wire(&process);
            let run = process.clone();
            tokio::spawn(async move { run.start_with_client(client).await });

            agent.handshake(false).await;
            let new = agent.expect_request("session/new").await;
            agent.reply(&new, serde_json::json!({"sessionId": "s1"})).await;
            let prompt = agent.expect_request("session/prompt").await;
            assert_eq!(prompt["params"]["prompt"][0]["text"], "go");
        }
    }

    mod failures {
        use super::*;

        #[tokio::test]
        async fn handshake_error_emits_agent_error_then_exit() {
            let process = AcpAgentProcess::new(AcpAgentConfig::new("fake"));
            let mut rx = process.subscribe();
            let (client, mut agent) = wire(&process);
            let run = process.clone();
            let start = tokio::spawn(async move { run.start_with_client(client).await });

            let init = agent.expect_request("initialize").await;
            agent
                .send(serde_json::json!({"id": init["id"].clone(), "error": {"code": -32000, "message": "bad"}}))
                .await;
            start.await.unwrap();

            match next_event(&mut rx).await {
                RunEvent::AgentError(err) => {
                    assert_eq!(err.error_type, AgentErrorType::Unknown);
                    assert!(!err.recoverable);
                }
                other => panic!("expected AgentError, got {:?}", other),
            }
            assert_eq!(next_event(&mut rx).await, RunEvent::Exit(1));
        }

        #[tokio::test]
        async fn connection_loss_mid_turn_fails_once() {
            let (process, mut agent, mut rx) = started(AcpAgentConfig::new("fake")).await;
            process.write("hi").await.unwrap();
            agent.expect_request("session/prompt").await;
            drop(agent);

            assert!(matches!(next_event(&mut rx).await, RunEvent::AgentError(_)));
            assert_eq!(next_event(&mut rx).await, RunEvent::Exit(1));
            assert_quiet(&mut rx).await;
            assert!(matches!(process.write("again").await, Err(RunError::NotRunning)));
            assert_quiet(&mut rx).await;
        }

        #[tokio::test]
        async fn invalid_utf8_line_does_not_break_the_turn() {
            let (process, mut agent, mut rx) = started(AcpAgentConfig::new("fake")).await;
            process.write("hi").await.unwrap();
            let prompt = agent.expect_request("session/prompt").await;

            agent.writer.write_all(b"\xff\xfe not json\n").await.unwrap();
            agent.chunk("agent_message_chunk", "fine").await;
            agent.reply(&prompt, serde_json::json!({"stopReason": "end_turn"})).await;

            assert_eq!(next_event(&mut rx).await, RunEvent::Data(NormalizedEvent::text("fine", true)));
            assert_eq!(
                next_event(&mut rx).await,
                RunEvent::Data(NormalizedEvent::Result {
                    text: "fine".to_string(),
                    usage: None
                })
            );
        }

        #[cfg(unix)]
        #[tokio::test]
        async fn agent_exit_during_prompt_reports_error_before_exit() {
            // Answers initialize and session/new, then dies on the prompt.
            let script = r#"
                reply() { id=$(printf '%s' "$1" | sed 's/.*"id":\([0-9][0-9]*\).*/\1/'); printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$id" "$2"; }
                read l; reply "$l" '{"protocolVersion":1}'
                read l; reply "$l" '{"sessionId":"s1"}'
                read l; exit 7
            "#;
            let process = AcpAgentProcess::new(
                AcpAgentConfig::new("sh").with_args(vec!["-c".to_string(), script.to_string()]),
            );
            let mut rx = process.subscribe();
            process.start().await;
            assert!(matches!(
                next_event(&mut rx).await,
                RunEvent::Data(NormalizedEvent::Init { .. })
            ));

            process.write("hi").await.unwrap();
            match next_event(&mut rx).await {
                RunEvent::AgentError(err) => assert!(!err.recoverable),
                other => panic!("expected AgentError, got {:?}", other),
            }
            assert_eq!(next_event(&mut rx).await, RunEvent::Exit(1));
            assert_quiet(&mut rx).await;
            assert!(matches!(process.write("again").await, Err(RunError::NotRunning)));
            assert_quiet(&mut rx).await;
        }

        #[tokio::test]
        async fn write_before_start_is_not_running() {
            let process = AcpAgentProcess::new(AcpAgentConfig::new("fake"));
            assert!(matches!(process.write("x").await, Err(RunError::NotRunning)));
        }

        #[tokio::test]
        async fn spawn_failure_is_reported_as_events() {
            let process = AcpAgentProcess::new(AcpAgentConfig::new("/nonexistent/acp-agent-binary"));
            let mut rx = process.subscribe();
            process.start().await;
            assert!(matches!(next_event(&mut rx).await, RunEvent::AgentError(_)));
            assert_eq!(next_event(&mut rx).await, RunEvent::Exit(1));
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn cancel_and_kill_before_session_are_safe() {
            let process = AcpAgentProcess::new(AcpAgentConfig::new("fake"));
            process.cancel().await;
            process.kill().await;
            process.kill().await;
            assert!(matches!(process.write("x").await, Err(RunError::NotRunning)));
        }

        #[tokio::test]
        async fn cancel_sends_notification() {
            let (process, mut agent, _rx) = started(AcpAgentConfig::new("fake")).await;
            process.cancel().await;
            let msg = agent.expect_request("session/cancel").await;
            assert_eq!(msg["params"]["sessionId"], "s1");
            assert!(msg.get("id").is_none());
        }

        #[tokio::test]
        async fn nothing_is_emitted_after_kill() {
            let (process, mut agent, mut rx) = started(AcpAgentConfig::new("fake")).await;
            process.write("hi").await.unwrap();
            agent.expect_request("session/prompt").await;

            process.kill().await;
            agent.chunk("agent_message_chunk", "late").await;

            let rest = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("stream should end");
            assert_eq!(rest, None);
        }

        #[tokio::test]
        async fn resumed_session_drops_replay() {
            let process =
                AcpAgentProcess::new(AcpAgentConfig::new("fake").with_resume_session("old-1"));
            let mut rx = process.subscribe();
            let (client, mut agent) = wire(&process);
            let run = process.clone();
            let start = tokio::spawn(async move { run.start_with_client(client).await });

            agent.handshake(true).await;
            let load = agent.expect_request("session/load").await;
            assert_eq!(load["params"]["sessionId"], "old-1");
            agent.chunk("user_message_chunk", "old question").await;
            agent.chunk("agent_message_chunk", "old answer").await;
            agent.reply(&load, Value::Null).await;
            start.await.unwrap();

            assert_eq!(
                next_event(&mut rx).await,
                RunEvent::Data(NormalizedEvent::Init {
                    session_id: Some("old-1".to_string()),
                    slash_commands: None
                })
            );
            assert_eq!(process.session_id().as_deref(), Some("old-1"));
        }

        #[tokio::test]
        async fn resume_falls_back_when_unsupported() {
            let process =
                AcpAgentProcess::new(AcpAgentConfig::new("fake").with_resume_session("old-1"));
            let (client, mut agent) = wire(&process);
            let run = process.clone();
            let start = tokio::spawn(async move { run.start_with_client(client).await });

            agent.handshake(false).await;
            let new = agent.expect_request("session/new").await;
            agent.reply(&new, serde_json::json!({"sessionId": "fresh"})).await;
            start.await.unwrap();
            assert_eq!(process.session_id().as_deref(), Some("fresh"));
        }
    }
}
