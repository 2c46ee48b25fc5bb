//! Side-channel named pipe that receives the transport's verbose trace.
//!
//! One pipe exists per command attempt. The reader end is opened read-write
//! so that it never reports EOF while the transport has not opened (or has
//! already closed) its end; after the transport exits, [`TraceChannel::drain`]
//! collects whatever is still buffered.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;
use tokio::net::unix::pipe;
use tracing::{debug, warn};

const PIPE_PREFIX: &str = "gerrit-ssh.debug.";

/// Silence that ends [`TraceChannel::drain`] once the writer has exited.
pub const TRACE_QUIET: Duration = Duration::from_millis(50);

/// A uniquely named FIFO, unlinked on [`remove`](Self::remove) or drop.
#[derive(Debug)]
pub struct SidecarPipe {
    path: PathBuf,
    removed: bool,
}

impl SidecarPipe {
    pub fn create(dir: &Path) -> io::Result<Self> {
        let seed: [u8; 8] = rand::random();
        let path = dir.join(format!("{PIPE_PREFIX}{}", hex::encode(seed)));
        nix::unistd::mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(io::Error::from)?;
        debug!(path = %path.display(), "created trace pipe");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Must be called from within a tokio runtime.
    pub fn open_reader(&self) -> io::Result<TraceChannel> {
        let rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&self.path)?;
        Ok(TraceChannel::new(rx))
    }

    pub fn remove(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for SidecarPipe {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            warn!(path = %self.path.display(), error = %err, "failed to remove trace pipe");
        }
    }
}

/// Whether `path` names a trace pipe created by [`SidecarPipe::create`].
pub fn is_trace_pipe(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(PIPE_PREFIX))
}

/// Line reader over the read end of a trace pipe.
#[derive(Debug)]
pub struct TraceChannel {
    rx: pipe::Receiver,
    pending: Vec<u8>,
    eof: bool,
}

impl TraceChannel {
    fn new(rx: pipe::Receiver) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            eof: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    /// Next complete line, or `None` once the pipe is closed.
    ///
    /// Cancel safe: bytes are buffered before any await point.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(self.take_rest());
            }
            self.rx.readable().await?;
            self.fill()?;
        }
    }

    /// Every line that arrives before the pipe goes quiet for `quiet`,
    /// including a trailing partial line.
    pub async fn drain(&mut self, quiet: Duration) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout(quiet, self.next_line()).await {
                Ok(Ok(Some(line))) => lines.push(line),
                Ok(Ok(None)) | Err(_) => break,
                Ok(Err(err)) => return Err(err),
            }
        }
        lines.extend(self.take_rest());
        Ok(lines)
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        match self.rx.try_read(&mut chunk) {
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
