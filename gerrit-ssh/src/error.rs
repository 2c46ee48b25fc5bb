//! Typed terminal errors surfaced by the transport layer.

use crate::core::machine::{MachineState, TransitionError};

/// Terminal error reported by the agent manager, command runners and the
/// event feed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GerritError {
    /// The server rejected our credentials.
    #[error("failed to authenticate to gerrit ssh")]
    AuthenticationFailure,

    #[error("gerrit refused access: the user {user:?} does not have capability {capability:?}")]
    MissingCapability { user: String, capability: String },

    /// The transport died or timed out before the remote command was
    /// confirmed started, or failed with its generic error status.
    #[error("ssh transport failed: {message}")]
    TransportFailure { message: String },

    /// The remote command ran and exited nonzero.
    #[error("gerrit command exited with status {status}{}", diagnostic_suffix(.diagnostics))]
    RemoteCommandFailure {
        status: i32,
        diagnostics: Vec<String>,
    },

    #[error("ssh-agent failed: {message}")]
    AgentFailure { message: String },

    /// Output did not match the expected shape.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// An operation was invoked in a state that does not allow it.
    #[error("precondition failed: {message}")]
    Precondition { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The shutdown context fired before a terminal outcome.
    #[error("interrupted by shutdown")]
    Shutdown,
}

impl GerritError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::AgentFailure {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Whether a long-lived subscription may reconnect after this error.
    ///
    /// Missing capabilities are retried like transport errors; only errors
    /// that are fixed for the lifetime of the process are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailure
                | Self::AgentFailure { .. }
                | Self::Precondition { .. }
                | Self::InvalidRequest { .. }
                | Self::Shutdown
        )
    }
}

impl<S: MachineState> From<TransitionError<S>> for GerritError {
    fn from(err: TransitionError<S>) -> Self {
        Self::protocol(err.to_string())
    }
}

pub(crate) fn diagnostic_suffix(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\n\t\t{}", lines.join("\n\t\t"))
    }
}
