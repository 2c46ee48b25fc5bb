//! Long-lived `gerrit stream-events` subscription with reconnects.
//!
//! The feed is read-only, so unlike [`CommandRunner`](crate::io::command)
//! every failure, including one after the connection was established, goes
//! through the retry budget. The budget is shared by the whole subscription
//! and never refilled.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::machine::StateCell;
use crate::core::record::{FeedItem, classify_feed_line};
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::states::StreamState;
use crate::core::tail::TailBuffer;
use crate::core::trace::{OpenSshTrace, TraceClassifier, TraceEvent};
use crate::error::GerritError;
use crate::io::agent::AgentHandle;
use crate::io::config::TransportConfig;
use crate::io::process::{
    ChildLines, IO_CAPTURE_TIMEOUT, TERM_GRACE, exit_code, reap, terminate,
};
use crate::io::transport::{Target, feed_args, transport_command};

/// Items buffered between the connection task and the consumer.
const FEED_BUFFER: usize = 64;

/// Builder for one feed subscription.
pub struct EventStream {
    target: Target,
    transport: TransportConfig,
    agent: AgentHandle,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    classifier: Arc<dyn TraceClassifier>,
}

impl EventStream {
    pub fn new(
        target: Target,
        transport: TransportConfig,
        agent: AgentHandle,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            transport,
            agent,
            retry,
            shutdown,
            classifier: Arc::new(OpenSshTrace),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TraceClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Start connecting on the current runtime.
    pub fn start(self) -> EventSubscription {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let state = StateCell::new(StreamState::WaitAgent);
        let state_rx = state.subscribe();
        let halt = self.shutdown.child_token();
        let driver = FeedDriver {
            target: self.target,
            transport: self.transport,
            agent: self.agent,
            retry: self.retry,
            halt: halt.clone(),
            classifier: self.classifier,
            state,
            tx,
        };
        let span = info_span!("event_stream", component = "event-stream");
        let task = tokio::spawn(driver.drive().instrument(span));
        EventSubscription {
            rx,
            state: state_rx,
            halt,
            task: Some(task),
        }
    }
}

/// Consumer side of a feed.
///
/// Yields records interleaved with [`FeedItem::Resync`] notices. The
/// sequence ends after at most one `Err`, or once the feed is stopped.
/// Dropping the subscription stops the feed.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::Receiver<Result<FeedItem, GerritError>>,
    state: watch::Receiver<StreamState>,
    halt: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventSubscription {
    pub async fn next(&mut self) -> Option<Result<FeedItem, GerritError>> {
        self.rx.recv().await
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Disconnect. Only valid while the feed is running.
    pub fn stop(&self) -> Result<(), GerritError> {
        let state = self.state();
        if state != StreamState::Running {
            return Err(GerritError::precondition(format!(
                "event stream is {state}, not running"
            )));
        }
        self.halt.cancel();
        Ok(())
    }

    /// Wait until the connection task has released its subprocess.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            error!(error = %err, "event stream task failed");
        }
    }
}

impl Stream for EventSubscription {
    type Item = Result<FeedItem, GerritError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.halt.cancel();
    }
}

enum Leave {
    Stop,
    Failed(GerritError),
}

struct FeedScope {
    child: Child,
    stdout: ChildLines<ChildStdout>,
    stderr: ChildLines<ChildStderr>,
}

struct FeedDriver {
    target: Target,
    transport: TransportConfig,
    agent: AgentHandle,
    retry: RetryPolicy,
    halt: CancellationToken,
    classifier: Arc<dyn TraceClassifier>,
    state: StateCell<StreamState>,
    tx: mpsc::Sender<Result<FeedItem, GerritError>>,
}

impl FeedDriver {
    async fn drive(mut self) {
        if let Err(err) = self.drive_inner().await {
            error!(error = %err, "event stream aborted");
            let _ = self.tx.send(Err(err)).await;
        }
    }

    /// Returns `Err` only for broken transitions; feed failures are sent to
    /// the consumer from here.
    async fn drive_inner(&mut self) -> Result<(), GerritError> {
        let socket = tokio::select! {
            biased;
            _ = self.halt.cancelled() => {
                self.state.goto(StreamState::Stopped)?;
                return Ok(());
            }
            ready = self.agent.wait_running() => match ready.and_then(|()| self.agent.socket_path()) {
                Ok(socket) => socket,
                Err(err) => {
                    self.state.goto(StreamState::Error)?;
                    self.emit_fatal(err).await;
                    return Ok(());
                }
            },
        };

        let mut attempt: u32 = 1;
        loop {
            self.state.goto(StreamState::Spawning)?;
            let mut scope = match self.spawn_connection(&socket, attempt) {
                Ok(scope) => scope,
                Err(err) => {
                    self.state.goto(StreamState::Error)?;
                    if !self.schedule_retry(err, attempt).await? {
                        return Ok(());
                    }
                    attempt += 1;
                    continue;
                }
            };
            match self.connection(&mut scope).await {
                Leave::Stop => {
                    self.state.goto(StreamState::Stopping)?;
                    match terminate(&mut scope.child, TERM_GRACE).await {
                        Ok(status) => debug!(exit_code = exit_code(status), "transport stopped"),
                        Err(err) => warn!(error = %err, "failed to stop transport"),
                    }
                    self.state.goto(StreamState::Stopped)?;
                    info!("event stream stopped");
                    return Ok(());
                }
                Leave::Failed(err) => {
                    self.state.goto(StreamState::Error)?;
                    reap(&mut scope.child).await;
                    drop(scope);
                    if !self.schedule_retry(err, attempt).await? {
                        return Ok(());
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Decide what follows a failure. `Ok(true)` means connect again.
    async fn schedule_retry(
        &mut self,
        err: GerritError,
        attempt: u32,
    ) -> Result<bool, GerritError> {
        if !err.is_retryable() {
            self.emit_fatal(err).await;
            return Ok(false);
        }
        match self.retry.on_failure() {
            RetryDecision::Retry { delay } => {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    remaining = self.retry.remaining(),
                    error = %err,
                    "event stream failed, reconnecting"
                );
                tokio::select! {
                    biased;
                    _ = self.halt.cancelled() => {
                        self.state.goto(StreamState::Stopped)?;
                        Ok(false)
                    }
                    _ = tokio::time::sleep(delay) => Ok(true),
                }
            }
            RetryDecision::Exhausted => {
                error!(attempt, error = %err, "event stream retries exhausted");
                self.emit_fatal(err).await;
                Ok(false)
            }
        }
    }

    fn spawn_connection(
        &self,
        socket: &std::path::Path,
        attempt: u32,
    ) -> Result<FeedScope, GerritError> {
        let args = feed_args(&self.target, &self.transport);
        let mut child = transport_command(&self.transport.ssh_program, &args, socket)
            .spawn()
            .map_err(|err| {
                GerritError::transport(format!(
                    "spawn {}: {err}",
                    self.transport.ssh_program.display()
                ))
            })?;
        debug!(attempt, pid = child.id(), "feed transport spawned");
        Ok(FeedScope {
            stdout: ChildLines::new(child.stdout.take()),
            stderr: ChildLines::new(child.stderr.take()),
            child,
        })
    }

    async fn connection(&self, scope: &mut FeedScope) -> Leave {
        let mut stderr_tail = TailBuffer::default();

        let deadline = tokio::time::sleep(self.retry.timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                _ = self.halt.cancelled() => return Leave::Stop,
                Some(line) = scope.stderr.next_line() => {
                    match self.classify(&line) {
                        Some(TraceEvent::CommandStarted) => break,
                        Some(event) => {
                            if let Some(err) = self.failure_for(event, &stderr_tail) {
                                return Leave::Failed(err);
                            }
                        }
                        None => {}
                    }
                    stderr_tail.push(line);
                }
                status = scope.child.wait() => {
                    for line in scope.stderr.drain(IO_CAPTURE_TIMEOUT).await {
                        if let Some(event) = self.classify(&line)
                            && let Some(err) = self.failure_for(event, &stderr_tail)
                        {
                            return Leave::Failed(err);
                        }
                        stderr_tail.push(line);
                    }
                    return Leave::Failed(exited("before the feed started", status));
                }
                _ = &mut deadline => {
                    return Leave::Failed(GerritError::transport(format!(
                        "timed out after {}ms waiting for the feed to start",
                        self.retry.timeout().as_millis()
                    )));
                }
            }
        }

        if let Err(err) = self.state.goto(StreamState::Running) {
            return Leave::Failed(err.into());
        }
        info!("event stream connected");
        // A fresh connection is itself a gap in the feed.
        if !self.emit(Ok(FeedItem::Resync)).await {
            return Leave::Stop;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.halt.cancelled() => return Leave::Stop,
                _ = self.tx.closed() => return Leave::Stop,
                Some(line) = scope.stderr.next_line() => {
                    if let Some(event) = self.classify(&line)
                        && let Some(err) = self.failure_for(event, &stderr_tail)
                    {
                        return Leave::Failed(err);
                    }
                    stderr_tail.push(line);
                }
                Some(line) = scope.stdout.next_line() => {
                    match self.deliver(&line).await {
                        Ok(true) => {}
                        Ok(false) => return Leave::Stop,
                        Err(err) => return Leave::Failed(err),
                    }
                }
                status = scope.child.wait() => {
                    for line in scope.stdout.drain(IO_CAPTURE_TIMEOUT).await {
                        match self.deliver(&line).await {
                            Ok(true) => {}
                            Ok(false) => return Leave::Stop,
                            Err(err) => return Leave::Failed(err),
                        }
                    }
                    for line in scope.stderr.drain(IO_CAPTURE_TIMEOUT).await {
                        if let Some(event) = self.classify(&line)
                            && let Some(err) = self.failure_for(event, &stderr_tail)
                        {
                            return Leave::Failed(err);
                        }
                        stderr_tail.push(line);
                    }
                    return Leave::Failed(exited("while streaming", status));
                }
            }
        }
    }

    fn classify(&self, line: &str) -> Option<TraceEvent> {
        self.classifier.classify(line)
    }

    /// The failure a trace milestone implies, if any.
    fn failure_for(&self, event: TraceEvent, stderr_tail: &TailBuffer) -> Option<GerritError> {
        match event {
            TraceEvent::AuthenticationDenied => Some(GerritError::AuthenticationFailure),
            TraceEvent::CapabilityRequired(capability) => Some(GerritError::MissingCapability {
                user: self.target.user.clone(),
                capability,
            }),
            TraceEvent::ExitStatus(status) => Some(GerritError::RemoteCommandFailure {
                status,
                diagnostics: stderr_tail.to_vec(),
            }),
            TraceEvent::CommandStarted => None,
        }
    }

    /// Hand one stdout line to the consumer. `Ok(false)` means nobody is
    /// listening any more.
    async fn deliver(&self, line: &str) -> Result<bool, GerritError> {
        match classify_feed_line(line) {
            Ok(None) => Ok(true),
            Ok(Some(item)) => {
                if matches!(item, FeedItem::Resync) {
                    warn!("server dropped buffered events");
                }
                Ok(self.emit(Ok(item)).await)
            }
            Err(message) => Err(GerritError::protocol(format!(
                "unparseable feed line: {message}"
            ))),
        }
    }

    async fn emit(&self, item: Result<FeedItem, GerritError>) -> bool {
        tokio::select! {
            biased;
            _ = self.halt.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    async fn emit_fatal(&self, err: GerritError) {
        if !self.emit(Err(err)).await {
            debug!("feed consumer gone before the fatal error");
        }
    }
}

fn exited(when: &str, status: std::io::Result<std::process::ExitStatus>) -> GerritError {
    match status {
        Ok(status) => GerritError::transport(format!(
            "ssh exited with status {} {when}",
            exit_code(status)
        )),
        Err(err) => GerritError::transport(format!("wait for ssh {when}: {err}")),
    }
}
