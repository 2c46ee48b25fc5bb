//! Lifecycle of the `ssh-agent` process that holds the signing key.
//!
//! The supervisor owns exactly one agent for its whole lifetime. Dependents
//! hold an [`AgentHandle`] and wait for it to reach
//! [`AgentState::Running`] before reading the socket path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use tokio::net::UnixStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::agent_output::{AgentEnv, parse_agent_line};
use crate::core::machine::StateCell;
use crate::core::states::AgentState;
use crate::error::GerritError;
use crate::io::config::TransportConfig;
use crate::io::process::{ChildLines, exit_code, reap};
use crate::io::transport::transport_command;

/// Starts the agent and supervises it until shutdown or failure.
pub struct AgentSupervisor;

impl AgentSupervisor {
    /// Spawn `ssh-agent -Ds` on the current runtime.
    ///
    /// The join handle resolves once the agent is stopped: `Ok(())` after a
    /// shutdown, or the fatal [`GerritError::AgentFailure`].
    pub fn start(
        config: TransportConfig,
        shutdown: CancellationToken,
    ) -> (AgentHandle, JoinHandle<Result<(), GerritError>>) {
        let shared = Arc::new(Shared {
            state: StateCell::new(AgentState::Starting),
            env: OnceLock::new(),
            reported_pid: OnceLock::new(),
            failure: OnceLock::new(),
            ssh_add_program: config.ssh_add_program.clone(),
        });
        let handle = AgentHandle {
            shared: Arc::clone(&shared),
        };
        let span = info_span!("agent", component = "ssh-agent");
        let task = tokio::spawn(supervise(shared, config, shutdown).instrument(span));
        (handle, task)
    }
}

#[derive(Debug)]
struct Shared {
    state: StateCell<AgentState>,
    env: OnceLock<AgentEnv>,
    reported_pid: OnceLock<u32>,
    failure: OnceLock<GerritError>,
    ssh_add_program: PathBuf,
}

/// Cheap, cloneable view of a supervised agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    shared: Arc<Shared>,
}

impl AgentHandle {
    pub fn state(&self) -> AgentState {
        self.shared.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the agent is running, or with its failure once it is
    /// gone.
    pub async fn wait_running(&self) -> Result<(), GerritError> {
        let mut rx = self.subscribe();
        let state = *rx
            .wait_for(|state| *state == AgentState::Running || state.is_gone())
            .await
            .map_err(|_| GerritError::agent("agent supervisor went away"))?;
        if state == AgentState::Running {
            return Ok(());
        }
        Err(self
            .failure()
            .unwrap_or_else(|| GerritError::agent(format!("agent is {state}"))))
    }

    /// Socket advertised through `SSH_AUTH_SOCK`.
    pub fn socket_path(&self) -> Result<PathBuf, GerritError> {
        self.require_running()?;
        self.shared
            .env
            .get()
            .and_then(AgentEnv::auth_sock)
            .map(PathBuf::from)
            .ok_or_else(|| GerritError::protocol("agent did not advertise SSH_AUTH_SOCK"))
    }

    pub fn signing_client(&self) -> Result<SigningClient, GerritError> {
        let socket = self.socket_path()?;
        Ok(SigningClient {
            socket,
            ssh_add_program: self.shared.ssh_add_program.clone(),
        })
    }

    /// Pid the agent printed about itself, once known.
    pub fn reported_pid(&self) -> Option<u32> {
        self.shared.reported_pid.get().copied()
    }

    /// The fatal error, if the agent failed.
    pub fn failure(&self) -> Option<GerritError> {
        self.shared.failure.get().cloned()
    }

    fn require_running(&self) -> Result<(), GerritError> {
        let state = self.state();
        if state != AgentState::Running {
            return Err(GerritError::precondition(format!(
                "ssh-agent is {state}, not running"
            )));
        }
        Ok(())
    }
}

/// Access to the agent's signing capability through its socket.
#[derive(Debug, Clone)]
pub struct SigningClient {
    socket: PathBuf,
    ssh_add_program: PathBuf,
}

impl SigningClient {
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Open a raw connection to the agent socket.
    pub async fn connect(&self) -> Result<UnixStream, GerritError> {
        UnixStream::connect(&self.socket).await.map_err(|err| {
            GerritError::agent(format!("connect {}: {err}", self.socket.display()))
        })
    }

    /// Load a private key into the agent with `ssh-add`.
    pub async fn add_key(&self, key: &Path) -> Result<(), GerritError> {
        let output = transport_command(&self.ssh_add_program, &[key.into()], &self.socket)
            .output()
            .await
            .map_err(|err| {
                GerritError::agent(format!(
                    "spawn {}: {err}",
                    self.ssh_add_program.display()
                ))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GerritError::agent(format!(
                "ssh-add {} exited with status {}: {}",
                key.display(),
                exit_code(output.status),
                stderr.trim()
            )));
        }
        info!(key = %key.display(), "key added to agent");
        Ok(())
    }
}

/// Live agent process and its output readers.
struct AgentScope {
    child: Child,
    stdout: ChildLines<ChildStdout>,
    stderr: ChildLines<ChildStderr>,
}

enum Leave {
    Failed(GerritError),
    Shutdown,
}

async fn supervise(
    shared: Arc<Shared>,
    config: TransportConfig,
    shutdown: CancellationToken,
) -> Result<(), GerritError> {
    let mut cmd = Command::new(&config.agent_program);
    cmd.arg("-Ds")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let err = GerritError::agent(format!(
                "spawn {}: {err}",
                config.agent_program.display()
            ));
            return fail(&shared, None, err).await;
        }
    };
    debug!(pid = child.id(), "ssh-agent spawned");
    let mut scope = AgentScope {
        stdout: ChildLines::new(child.stdout.take()),
        stderr: ChildLines::new(child.stderr.take()),
        child,
    };

    let leave = match starting(&shared, &mut scope, &shutdown).await {
        Ok(()) => match shared.state.goto(AgentState::Running) {
            Ok(()) => running(&mut scope, &shutdown).await,
            Err(err) => Leave::Failed(err.into()),
        },
        Err(leave) => leave,
    };

    match leave {
        Leave::Failed(err) => fail(&shared, Some(&mut scope.child), err).await,
        Leave::Shutdown => {
            shared.state.goto(AgentState::Killing)?;
            reap(&mut scope.child).await;
            shared.state.goto(AgentState::Stopped)?;
            info!("ssh-agent stopped");
            Ok(())
        }
    }
}

/// Read the agent's announcement until the pid line.
async fn starting(
    shared: &Shared,
    scope: &mut AgentScope,
    shutdown: &CancellationToken,
) -> Result<(), Leave> {
    let mut env = AgentEnv::default();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Leave::Shutdown),
            Some(line) = scope.stdout.next_line() => {
                let parsed = parse_agent_line(&line);
                env.absorb(&parsed);
                let Some(pid) = parsed.pid else {
                    continue;
                };
                let spawned = scope.child.id();
                if spawned != Some(pid) {
                    warn!(reported = pid, spawned, "ssh-agent reported a different pid");
                }
                let _ = shared.reported_pid.set(pid);
                let _ = shared.env.set(env);
                return Ok(());
            }
            Some(line) = scope.stderr.next_line() => {
                error!(line = %line, "ssh-agent stderr");
            }
            status = scope.child.wait() => {
                let message = match status {
                    Ok(status) => format!(
                        "exited with status {} before announcing its pid",
                        exit_code(status)
                    ),
                    Err(err) => format!("wait failed: {err}"),
                };
                return Err(Leave::Failed(GerritError::agent(message)));
            }
        }
    }
}

async fn running(scope: &mut AgentScope, shutdown: &CancellationToken) -> Leave {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Leave::Shutdown,
            Some(line) = scope.stdout.next_line() => {
                debug!(line = %line, "ssh-agent stdout");
            }
            Some(line) = scope.stderr.next_line() => {
                error!(line = %line, "ssh-agent stderr");
            }
            status = scope.child.wait() => {
                let message = match status {
                    Ok(status) => format!("exited unexpectedly with status {}", exit_code(status)),
                    Err(err) => format!("wait failed: {err}"),
                };
                return Leave::Failed(GerritError::agent(message));
            }
        }
    }
}

async fn fail(
    shared: &Shared,
    child: Option<&mut Child>,
    err: GerritError,
) -> Result<(), GerritError> {
    error!(error = %err, "ssh-agent failed");
    // Recorded first so waiters woken by the transition can read it.
    let _ = shared.failure.set(err.clone());
    shared.state.goto(AgentState::Error)?;
    if let Some(child) = child {
        reap(child).await;
    }
    shared.state.goto(AgentState::Stopped)?;
    Err(err)
}
