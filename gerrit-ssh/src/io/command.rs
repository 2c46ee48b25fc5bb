//! One-shot remote `gerrit` command over the ssh transport.
//!
//! The transport's own exit code cannot distinguish a transport failure from
//! a remote failure, so each attempt binds the transport's verbose trace to a
//! side-channel pipe and reads the remote exit status from it.
//!
//! Only attempts that fail before the command is confirmed started are
//! retried. Once [`CommandState::Running`] is entered every outcome is final,
//! because the remote command may already have had side effects.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::machine::StateCell;
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::states::CommandState;
use crate::core::tail::{TailBuffer, pick_diagnostics};
use crate::core::trace::{OpenSshTrace, TraceClassifier, TraceEvent};
use crate::error::{GerritError, diagnostic_suffix};
use crate::io::agent::AgentHandle;
use crate::io::config::TransportConfig;
use crate::io::pipe::{SidecarPipe, TRACE_QUIET, TraceChannel};
use crate::io::process::{ChildLines, IO_CAPTURE_TIMEOUT, exit_code, reap};
use crate::io::transport::{Target, command_args, transport_command};

/// Exit code `ssh` uses for its own failures.
const TRANSPORT_FAILURE_CODE: i32 = 255;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub target: Target,
    pub transport: TransportConfig,
    /// Arguments after `gerrit`.
    pub args: Vec<String>,
    /// Written to the command's stdin once it is running.
    pub body: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(target: Target, transport: TransportConfig, args: Vec<String>) -> Self {
        Self {
            target,
            transport,
            args,
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Result of a command that exited 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Every stdout line, newline terminated.
    pub stdout: String,
}

/// Runs one command to a single terminal outcome.
pub struct CommandRunner {
    spec: CommandSpec,
    agent: AgentHandle,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    classifier: Arc<dyn TraceClassifier>,
    state: StateCell<CommandState>,
    stdout_tx: Option<mpsc::UnboundedSender<String>>,
    stderr_tx: Option<mpsc::UnboundedSender<String>>,
}

enum Attempt {
    Done(CommandOutput),
    Fatal(GerritError),
    /// Failed before the command started.
    Retry(GerritError),
    Shutdown,
}

/// Output and trace observed during one attempt.
#[derive(Default)]
struct Observed {
    stdout: String,
    /// Stdout seen before the start marker, forwarded once running.
    held_stdout: Vec<String>,
    running: bool,
    stderr_tail: TailBuffer,
    trace_tail: TailBuffer,
    remote_status: Option<i32>,
    started: bool,
    denied: bool,
}

/// Resources of one spawned attempt; torn down whenever the attempt ends.
struct AttemptScope {
    child: Child,
    /// Taken at spawn; `Child::wait` would otherwise close it.
    stdin: Option<ChildStdin>,
    stdout: ChildLines<ChildStdout>,
    stderr: ChildLines<ChildStderr>,
    trace: TraceChannel,
    trace_ok: bool,
    pipe: SidecarPipe,
}

impl AttemptScope {
    async fn teardown(mut self) {
        reap(&mut self.child).await;
        if let Err(err) = self.pipe.remove() {
            warn!(path = %self.pipe.path().display(), error = %err, "failed to remove trace pipe");
        }
    }
}

impl CommandRunner {
    pub fn new(
        spec: CommandSpec,
        agent: AgentHandle,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            spec,
            agent,
            retry,
            shutdown,
            classifier: Arc::new(OpenSshTrace),
            state: StateCell::new(CommandState::WaitAgent),
            stdout_tx: None,
            stderr_tx: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TraceClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Stdout lines of the running command, as they arrive.
    pub fn stdout_lines(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stdout_tx = Some(tx);
        rx
    }

    /// Stderr lines of every attempt, as they arrive.
    pub fn stderr_lines(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stderr_tx = Some(tx);
        rx
    }

    pub fn subscribe(&self) -> watch::Receiver<CommandState> {
        self.state.subscribe()
    }

    /// Drive the command to completion.
    pub async fn run(mut self) -> Result<CommandOutput, GerritError> {
        let command = self.spec.args.first().cloned().unwrap_or_default();
        let span = info_span!("command", component = "cmd-runner", command = %command);
        self.drive().instrument(span).await
    }

    async fn drive(&mut self) -> Result<CommandOutput, GerritError> {
        let socket = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                self.state.goto(CommandState::Stopped)?;
                return Err(GerritError::Shutdown);
            }
            ready = self.agent.wait_running() => match ready.and_then(|()| self.agent.socket_path()) {
                Ok(socket) => socket,
                Err(err) => {
                    self.state.goto(CommandState::Error)?;
                    return Err(err);
                }
            },
        };

        let mut attempt: u32 = 1;
        loop {
            self.state.goto(CommandState::Spawning)?;
            let outcome = match self.spawn_attempt(&socket, attempt) {
                Ok(scope) => self.attempt(scope).await,
                Err(err) => Attempt::Retry(err),
            };
            match outcome {
                Attempt::Done(output) => {
                    self.state.goto(CommandState::Finished)?;
                    info!(attempt, "command finished");
                    return Ok(output);
                }
                Attempt::Fatal(err) => {
                    self.state.goto(CommandState::Error)?;
                    error!(attempt, error = %err, "command failed");
                    return Err(err);
                }
                Attempt::Shutdown => {
                    self.state.goto(CommandState::Stopped)?;
                    return Err(GerritError::Shutdown);
                }
                Attempt::Retry(err) => {
                    self.state.goto(CommandState::Retry)?;
                    match self.retry.on_failure() {
                        RetryDecision::Retry { delay } => {
                            warn!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                remaining = self.retry.remaining(),
                                error = %err,
                                "command did not start, retrying"
                            );
                            tokio::select! {
                                biased;
                                _ = self.shutdown.cancelled() => {
                                    self.state.goto(CommandState::Stopped)?;
                                    return Err(GerritError::Shutdown);
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                            attempt += 1;
                        }
                        RetryDecision::Exhausted => {
                            self.state.goto(CommandState::Error)?;
                            error!(attempt, error = %err, "command retries exhausted");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn spawn_attempt(
        &self,
        socket: &std::path::Path,
        attempt: u32,
    ) -> Result<AttemptScope, GerritError> {
        let dir = self.spec.transport.pipe_dir();
        let pipe = SidecarPipe::create(&dir).map_err(|err| {
            GerritError::transport(format!("create trace pipe in {}: {err}", dir.display()))
        })?;
        let trace = pipe
            .open_reader()
            .map_err(|err| GerritError::transport(format!("open trace pipe: {err}")))?;

        let args = command_args(
            &self.spec.target,
            &self.spec.transport,
            pipe.path(),
            &self.spec.args,
        );
        let mut cmd = transport_command(&self.spec.transport.ssh_program, &args, socket);
        if self.spec.body.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd.spawn().map_err(|err| {
            GerritError::transport(format!(
                "spawn {}: {err}",
                self.spec.transport.ssh_program.display()
            ))
        })?;
        debug!(attempt, pid = child.id(), "transport spawned");
        Ok(AttemptScope {
            stdin: child.stdin.take(),
            stdout: ChildLines::new(child.stdout.take()),
            stderr: ChildLines::new(child.stderr.take()),
            child,
            trace,
            trace_ok: true,
            pipe,
        })
    }

    async fn attempt(&self, mut scope: AttemptScope) -> Attempt {
        let outcome = self.drive_attempt(&mut scope).await;
        scope.teardown().await;
        outcome
    }

    async fn drive_attempt(&self, scope: &mut AttemptScope) -> Attempt {
        let mut seen = Observed::default();

        let deadline = tokio::time::sleep(self.retry.timeout());
        tokio::pin!(deadline);
        let early_exit = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Attempt::Shutdown,
                line = scope.trace.next_line(), if scope.trace_ok && !scope.trace.is_closed() => {
                    match line {
                        Ok(Some(line)) => self.observe_trace(&mut seen, line),
                        Ok(None) => {}
                        Err(err) => {
                            return Attempt::Retry(GerritError::transport(format!(
                                "read trace pipe: {err}"
                            )));
                        }
                    }
                    if seen.denied {
                        return Attempt::Fatal(GerritError::AuthenticationFailure);
                    }
                    if seen.started {
                        break None;
                    }
                }
                Some(line) = scope.stderr.next_line() => self.observe_stderr(&mut seen, line),
                status = scope.child.wait() => break Some(status),
                _ = &mut deadline => {
                    return Attempt::Retry(GerritError::transport(format!(
                        "timed out after {}ms waiting for the command to start",
                        self.retry.timeout().as_millis()
                    )));
                }
            }
        };

        if let Some(status) = early_exit {
            self.collect_after_exit(scope, &mut seen).await;
            if seen.denied {
                return Attempt::Fatal(GerritError::AuthenticationFailure);
            }
            if !seen.started {
                let status = match status {
                    Ok(status) => exit_code(status).to_string(),
                    Err(err) => format!("unknown ({err})"),
                };
                let diagnostics = pick_diagnostics(&seen.stderr_tail, &seen.trace_tail);
                return Attempt::Retry(GerritError::transport(format!(
                    "ssh exited with status {status} before the command started{}",
                    diagnostic_suffix(&diagnostics)
                )));
            }
            if let Err(err) = self.enter_running(&mut seen) {
                return Attempt::Fatal(err);
            }
            return conclude(status, &seen);
        }

        if let Err(err) = self.enter_running(&mut seen) {
            return Attempt::Fatal(err);
        }
        debug!("command started");
        self.send_body(scope.stdin.take());

        let status = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Attempt::Shutdown,
                line = scope.trace.next_line(), if scope.trace_ok && !scope.trace.is_closed() => {
                    match line {
                        Ok(Some(line)) => self.observe_trace(&mut seen, line),
                        Ok(None) => {}
                        Err(err) => {
                            warn!(error = %err, "trace pipe read failed");
                            scope.trace_ok = false;
                        }
                    }
                    if seen.denied {
                        return Attempt::Fatal(GerritError::AuthenticationFailure);
                    }
                }
                Some(line) = scope.stderr.next_line() => self.observe_stderr(&mut seen, line),
                Some(line) = scope.stdout.next_line() => self.observe_stdout(&mut seen, line),
                status = scope.child.wait() => break status,
            }
        };
        self.collect_after_exit(scope, &mut seen).await;
        if seen.denied {
            return Attempt::Fatal(GerritError::AuthenticationFailure);
        }
        conclude(status, &seen)
    }

    /// Pull whatever the exited transport left in its pipes.
    async fn collect_after_exit(&self, scope: &mut AttemptScope, seen: &mut Observed) {
        for line in scope.stdout.drain(IO_CAPTURE_TIMEOUT).await {
            self.observe_stdout(seen, line);
        }
        for line in scope.stderr.drain(IO_CAPTURE_TIMEOUT).await {
            self.observe_stderr(seen, line);
        }
        if scope.trace_ok {
            match scope.trace.drain(TRACE_QUIET).await {
                Ok(lines) => {
                    for line in lines {
                        self.observe_trace(seen, line);
                    }
                }
                Err(err) => warn!(error = %err, "trace pipe drain failed"),
            }
        }
    }

    fn observe_trace(&self, seen: &mut Observed, line: String) {
        match self.classifier.classify(&line) {
            Some(TraceEvent::AuthenticationDenied) => seen.denied = true,
            Some(TraceEvent::CommandStarted) => seen.started = true,
            Some(TraceEvent::ExitStatus(status)) => seen.remote_status = Some(status),
            Some(TraceEvent::CapabilityRequired(_)) | None => {}
        }
        seen.trace_tail.push(line);
    }

    fn observe_stderr(&self, seen: &mut Observed, line: String) {
        if let Some(tx) = &self.stderr_tx {
            let _ = tx.send(line.clone());
        }
        seen.stderr_tail.push(line);
    }

    fn observe_stdout(&self, seen: &mut Observed, line: String) {
        seen.stdout.push_str(&line);
        seen.stdout.push('\n');
        if seen.running {
            self.forward_stdout(line);
        } else {
            seen.held_stdout.push(line);
        }
    }

    fn forward_stdout(&self, line: String) {
        if let Some(tx) = &self.stdout_tx {
            let _ = tx.send(line);
        }
    }

    fn enter_running(&self, seen: &mut Observed) -> Result<(), GerritError> {
        self.state.goto(CommandState::Running)?;
        seen.running = true;
        for line in std::mem::take(&mut seen.held_stdout) {
            self.forward_stdout(line);
        }
        Ok(())
    }

    /// Write the request body on its own task so a slow reader cannot stall
    /// the output loop; stdin closes when the task ends.
    fn send_body(&self, stdin: Option<ChildStdin>) {
        let (Some(body), Some(mut stdin)) = (self.spec.body.clone(), stdin) else {
            return;
        };
        tokio::spawn(
            async move {
                if let Err(err) = stdin.write_all(&body).await {
                    debug!(error = %err, "request body not fully written");
                    return;
                }
                if let Err(err) = stdin.shutdown().await {
                    debug!(error = %err, "closing stdin failed");
                }
            }
            .in_current_span(),
        );
    }
}

fn conclude(status: std::io::Result<ExitStatus>, seen: &Observed) -> Attempt {
    let code = match status {
        Ok(status) => exit_code(status),
        Err(err) => {
            return Attempt::Fatal(GerritError::transport(format!("wait for ssh: {err}")));
        }
    };
    if code == TRANSPORT_FAILURE_CODE {
        let diagnostics = pick_diagnostics(&seen.stderr_tail, &seen.trace_tail);
        return Attempt::Fatal(GerritError::transport(format!(
            "ssh exited with status {code}{}",
            diagnostic_suffix(&diagnostics)
        )));
    }
    let status = seen.remote_status.unwrap_or(code);
    if status == 0 {
        return Attempt::Done(CommandOutput {
            stdout: seen.stdout.clone(),
        });
    }
    Attempt::Fatal(GerritError::RemoteCommandFailure {
        status,
        diagnostics: pick_diagnostics(&seen.stderr_tail, &seen.trace_tail),
    })
}
