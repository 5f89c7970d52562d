//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::auth::{AgentProbe, AuthMethodChoice, PromptProvider};
use super::error::{Result, SshCoreError};
use super::jump::JumpTunnel;
use super::transport::{CommandRunner, Connector, Transport};
use super::types::{CommandOutput, ExecRequest, HostTarget};

pub(crate) type ExecFn = Arc<dyn Fn(&ExecRequest) -> Result<CommandOutput> + Send + Sync>;

pub(crate) fn output(stdout: &str, stderr: &str, exit_code: i32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

pub(crate) fn lost(host: &str) -> SshCoreError {
    SshCoreError::ConnectionLost {
        host: host.to_string(),
        reason: "Connection reset by peer".to_string(),
    }
}

/// Prompt provider answering from a script and recording what was asked.
#[derive(Default)]
pub(crate) struct ScriptedPrompt {
    secrets: Mutex<VecDeque<Option<String>>>,
    auth_choice: Mutex<Option<AuthMethodChoice>>,
    messages: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_secrets<I, S>(self, answers: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        self.secrets
            .lock()
            .unwrap()
            .extend(answers.into_iter().map(|a| a.map(Into::into)));
        self
    }

    pub(crate) fn with_auth_choice(self, choice: AuthMethodChoice) -> Self {
        *self.auth_choice.lock().unwrap() = Some(choice);
        self
    }

    pub(crate) fn secret_prompts(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl PromptProvider for ScriptedPrompt {
    async fn prompt_secret(&self, message: &str) -> Option<String> {
        self.messages.lock().unwrap().push(message.to_string());
        self.secrets.lock().unwrap().pop_front().flatten()
    }

    async fn prompt_challenge(&self, prompts: &[String]) -> Vec<String> {
        vec![String::new(); prompts.len()]
    }

    async fn prompt_auth_method(&self, _host: &str, _username: &str) -> Option<AuthMethodChoice> {
        self.auth_choice.lock().unwrap().clone()
    }
}

pub(crate) struct FakeAgentProbe {
    has_keys: bool,
}

impl FakeAgentProbe {
    pub(crate) fn new(has_keys: bool) -> Self {
        Self { has_keys }
    }
}

#[async_trait]
impl AgentProbe for FakeAgentProbe {
    async fn has_identities(&self, _socket: &Path) -> bool {
        self.has_keys
    }
}

/// Jump tunnel that counts close calls. `hanging()` never finishes closing.
#[derive(Default)]
pub(crate) struct CountingTunnel {
    hang: bool,
    close_calls: AtomicUsize,
    closes: AtomicUsize,
}

impl CountingTunnel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// Completed closes.
    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JumpTunnel for CountingTunnel {
    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Bookkeeping of one fake connection.
pub(crate) struct TransportState {
    pub(crate) host: String,
    pub(crate) port: u16,
    alive: AtomicBool,
    stalled: AtomicBool,
    closes: AtomicUsize,
    execs: AtomicUsize,
}

impl TransportState {
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Liveness checks never answer, like a half-open TCP session.
    pub(crate) fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closes() > 0
    }

    pub(crate) fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }
}

struct FakeTransport {
    state: Arc<TransportState>,
    exec_results: Arc<Mutex<VecDeque<Result<CommandOutput>>>>,
    handler: ExecFn,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, request: &ExecRequest) -> Result<CommandOutput> {
        self.state.execs.fetch_add(1, Ordering::SeqCst);
        if !self.state.alive.load(Ordering::SeqCst) {
            return Err(lost(&self.state.host));
        }
        let scripted = self.exec_results.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => (self.handler)(request),
        }
    }

    async fn is_alive(&self) -> bool {
        if self.state.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.alive.load(Ordering::SeqCst) && !self.state.is_closed()
    }

    async fn close(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector producing in-memory transports.
///
/// Scripted connect failures are consumed first; scripted exec results are
/// shared by every transport and consumed before the default handler runs.
pub(crate) struct FakeConnector {
    connects: AtomicUsize,
    connect_delay: Duration,
    connect_failures: Mutex<VecDeque<SshCoreError>>,
    exec_results: Arc<Mutex<VecDeque<Result<CommandOutput>>>>,
    handler: ExecFn,
    transports: Mutex<Vec<Arc<TransportState>>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            connect_failures: Mutex::new(VecDeque::new()),
            exec_results: Arc::new(Mutex::new(VecDeque::new())),
            handler: Arc::new(|req: &ExecRequest| Ok(output(&format!("ran: {}", req.command), "", 0))),
            transports: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub(crate) fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub(crate) fn fail_next(&self, err: SshCoreError) {
        self.connect_failures.lock().unwrap().push_back(err);
    }

    pub(crate) fn push_exec(&self, result: Result<CommandOutput>) {
        self.exec_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn transports(&self) -> Vec<Arc<TransportState>> {
        self.transports.lock().unwrap().clone()
    }

    pub(crate) fn transport(&self, index: usize) -> Arc<TransportState> {
        self.transports.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &HostTarget, _timeout: Duration) -> Result<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let failure = self.connect_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let state = Arc::new(TransportState {
            host: target.host.clone(),
            port: target.port,
            alive: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
        });
        self.transports.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeTransport {
            state,
            exec_results: self.exec_results.clone(),
            handler: self.handler.clone(),
        }))
    }
}

/// Remote shell double: of the rules whose pattern occurs in the command, the
/// one with the longest pattern answers it. Unmatched commands exit 127.
#[derive(Default)]
pub(crate) struct ScriptedShell {
    rules: Vec<(String, ExecFn)>,
    calls: Mutex<Vec<ExecRequest>>,
}

impl ScriptedShell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(self, pattern: &str, reply: CommandOutput) -> Self {
        self.on_fn(pattern, move |_| Ok(reply.clone()))
    }

    pub(crate) fn on_fn<F>(mut self, pattern: &str, f: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.rules.push((pattern.to_string(), Arc::new(f)));
        self
    }

    pub(crate) fn calls(&self) -> Vec<ExecRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedShell {
    async fn run(&self, request: &ExecRequest) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(request.clone());
        match self
            .rules
            .iter()
            .filter(|(pattern, _)| request.command.contains(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
        {
            Some((_, reply)) => reply(request),
            None => Ok(output("", "sh: command not found", 127)),
        }
    }
}
