//! Stable exit codes for the `gerrit-ssh` CLI.

use crate::error::GerritError;

/// The command succeeded.
pub const OK: i32 = 0;
/// Invalid usage, configuration or request.
pub const INVALID: i32 = 1;
/// The remote command ran and exited nonzero.
pub const REMOTE: i32 = 2;
/// The transport or the agent failed, or output was malformed.
pub const TRANSPORT: i32 = 3;
/// The server rejected our key or the user lacks a capability.
pub const AUTH: i32 = 4;

/// Exit code reported for a terminal library error.
pub fn for_error(err: &GerritError) -> i32 {
    match err {
        GerritError::AuthenticationFailure | GerritError::MissingCapability { .. } => AUTH,
        GerritError::RemoteCommandFailure { .. } => REMOTE,
        GerritError::TransportFailure { .. }
        | GerritError::AgentFailure { .. }
        | GerritError::ProtocolViolation { .. }
        | GerritError::Shutdown => TRANSPORT,
        GerritError::Precondition { .. } | GerritError::InvalidRequest { .. } => INVALID,
    }
}
