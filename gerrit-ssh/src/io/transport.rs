//! Argument vectors and environment for the `ssh` transport.
//!
//! The exact argument shape is a compatibility contract with OpenSSH and
//! Gerrit; tests below pin it.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::core::agent_output::AUTH_SOCK_VAR;
use crate::io::config::{ClientConfig, TransportConfig};

/// Remote account the transport logs into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            user: cfg.user.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

fn base_args(target: &Target, options: &TransportConfig, trace: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-v".into(), "-p".into(), target.port.to_string().into()];
    if let Some(trace) = trace {
        args.push("-E".into());
        args.push(trace.as_os_str().to_owned());
    }
    args.push("-o".into());
    args.push(format!("ServerAliveInterval={}", options.server_alive_interval).into());
    args.push("-o".into());
    args.push(format!("ServerAliveCountMax={}", options.server_alive_count_max).into());
    args.push(target.destination().into());
    args.push("gerrit".into());
    args
}

/// `ssh` arguments for a one-shot `gerrit <args...>` whose verbose trace goes
/// to `trace`.
pub fn command_args(
    target: &Target,
    options: &TransportConfig,
    trace: &Path,
    gerrit_args: &[String],
) -> Vec<OsString> {
    let mut args = base_args(target, options, Some(trace));
    args.extend(gerrit_args.iter().map(OsString::from));
    args
}

/// `ssh` arguments for `gerrit stream-events`; the trace stays on stderr.
pub fn feed_args(target: &Target, options: &TransportConfig) -> Vec<OsString> {
    let mut args = base_args(target, options, None);
    args.push("stream-events".into());
    args
}

/// A transport process with a minimal environment: the inherited `PATH` and
/// the agent socket.
pub fn transport_command(program: &Path, args: &[OsString], auth_sock: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).env_clear().env(AUTH_SOCK_VAR, auth_sock);
    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}
