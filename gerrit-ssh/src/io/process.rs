//! Helpers for supervising child processes from inside a `select!` loop.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::Child;
use tracing::{debug, warn};

/// How long buffered stdout/stderr may take to reach EOF after the child
/// has exited.
pub const IO_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// Time a child gets between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// Line reader over one child pipe.
///
/// Once the pipe reaches EOF (or fails) the reader is dropped and
/// [`next_line`](Self::next_line) keeps returning `None` immediately, so a
/// `Some(line) = reader.next_line()` branch simply disables itself.
#[derive(Debug)]
pub struct ChildLines<R> {
    lines: Option<Lines<BufReader<R>>>,
}

impl<R: AsyncRead + Unpin> ChildLines<R> {
    pub fn new(reader: Option<R>) -> Self {
        Self {
            lines: reader.map(|r| BufReader::new(r).lines()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lines.is_none()
    }

    /// Cancel safe.
    pub async fn next_line(&mut self) -> Option<String> {
        let lines = self.lines.as_mut()?;
        match lines.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) => {
                self.lines = None;
                None
            }
            Err(err) => {
                debug!(error = %err, "child pipe read failed");
                self.lines = None;
                None
            }
        }
    }

    /// Remaining lines up to EOF, giving up after `limit`.
    pub async fn drain(&mut self, limit: Duration) -> Vec<String> {
        let mut out = Vec::new();
        let read_all = async {
            while let Some(line) = self.next_line().await {
                out.push(line);
            }
        };
        if tokio::time::timeout(limit, read_all).await.is_err() {
            warn!(
                timeout_ms = limit.as_millis() as u64,
                "child output still open after exit"
            );
        }
        out
    }
}

/// Exit code, or `128 + signal` for a child killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn send_signal(pid: u32, sig: Signal) -> io::Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    signal::kill(Pid::from_raw(raw), sig).map_err(io::Error::from)
}

/// Ask the child to exit, then force it after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    if let Some(pid) = child.id()
        && let Err(err) = send_signal(pid, Signal::SIGTERM)
    {
        warn!(pid, error = %err, "SIGTERM failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                pid = child.id(),
                grace_ms = grace.as_millis() as u64,
                "child ignored SIGTERM, killing"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Kill the child if it is still running and wait for it.
pub async fn reap(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(err) => warn!(error = %err, "failed to poll child"),
    }
    let pid = child.id();
    if let Err(err) = child.kill().await {
        warn!(pid, error = %err, "failed to kill child");
    } else {
        debug!(pid, "child killed");
    }
}
