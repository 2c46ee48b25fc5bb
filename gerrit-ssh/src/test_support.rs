//! Test-only stand-ins for `ssh`, `ssh-agent` and `ssh-add`.
//!
//! [`FakeHost`] writes POSIX shell scripts into a temp dir. Each script body
//! is a scenario; the preambles give it helpers that mimic what the real
//! programs print.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use crate::core::retry::RetryPolicy;
use crate::io::config::TransportConfig;
use crate::io::pipe::is_trace_pipe;
use crate::io::transport::Target;

/// Agent that announces itself and stays up.
pub const READY_AGENT: &str = "announce\nexec sleep 600\n";

/// Agent preamble. `announce [PID]` prints the socket and pid lines.
const AGENT_PREAMBLE: &str = r#"
announce() {
  echo "SSH_AUTH_SOCK=$HOST/agent.sock; export SSH_AUTH_SOCK;"
  echo "echo Agent pid ${1:-$$};"
}
"#;

/// Transport preamble. Records the attempt, then parses the ssh options so
/// the body sees `gerrit <args...>` in `$@`. Helpers:
///
/// - `trace LINE`: write to the `-E` file, or stderr without `-E`
/// - `started`: the command-accepted trace line
/// - `finish N`: the exit-status trace line, then exit N
const SSH_PREAMBLE: &str = r#"
echo "$*" >> "$HOST/attempts"
ATTEMPT=$(wc -l < "$HOST/attempts" | tr -d ' ')
TRACE=
while [ $# -gt 0 ]; do
  case "$1" in
    -E) TRACE="$2"; shift 2 ;;
    -p|-o) shift 2 ;;
    -v) shift ;;
    *) break ;;
  esac
done
DEST="$1"
shift
CMD="$*"
if [ -n "$TRACE" ]; then exec 3>>"$TRACE"; else exec 3>&2; fi
echo "$SSH_AUTH_SOCK" > "$HOST/auth_sock"
trace() { echo "$*" >&3; }
started() { trace "debug1: Sending command: $CMD"; }
finish() { trace "debug1: Exit status $1"; exit "$1"; }
"#;

const SSH_ADD: &str = r#"
echo "$@" >> "$HOST/added_keys"
echo "$SSH_AUTH_SOCK" > "$HOST/add_auth_sock"
"#;

/// Temp dir holding scripted programs and what they recorded.
pub struct FakeHost {
    dir: TempDir,
}

impl FakeHost {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("pipes"))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn pipe_dir(&self) -> PathBuf {
        self.path().join("pipes")
    }

    /// Socket path the fake agent advertises.
    pub fn socket_path(&self) -> PathBuf {
        self.path().join("agent.sock")
    }

    /// Transport config pointing at the three scripts.
    pub fn transport(&self, agent_body: &str, ssh_body: &str) -> io::Result<TransportConfig> {
        Ok(TransportConfig {
            ssh_program: self.script("ssh", SSH_PREAMBLE, ssh_body)?,
            agent_program: self.script("ssh-agent", AGENT_PREAMBLE, agent_body)?,
            ssh_add_program: self.script("ssh-add", SSH_ADD, "")?,
            pipe_dir: Some(self.pipe_dir()),
            ..TransportConfig::default()
        })
    }

    /// Number of transport invocations so far.
    pub fn attempts(&self) -> usize {
        self.read("attempts")
            .map(|raw| raw.lines().count())
            .unwrap_or(0)
    }

    /// Trace pipes still present in the pipe dir.
    pub fn leftover_pipes(&self) -> Vec<PathBuf> {
        fs::read_dir(self.pipe_dir())
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| is_trace_pipe(path))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn read(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.path().join(name))
    }

    fn script(&self, name: &str, preamble: &str, body: &str) -> io::Result<PathBuf> {
        let path = self.path().join(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o755)
            .open(&path)?;
        writeln!(file, "#!/bin/sh")?;
        writeln!(file, "HOST='{}'", self.path().display())?;
        file.write_all(preamble.as_bytes())?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }
}

pub fn target() -> Target {
    Target {
        user: "ci-bot".to_string(),
        host: "review.example.org".to_string(),
        port: 29418,
    }
}

/// Small delays so retry tests stay fast: 10ms doubling to 40ms.
pub fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy::new(retries, Duration::from_millis(10), Duration::from_secs(5))
        .with_max_delay(Duration::from_millis(40))
}
