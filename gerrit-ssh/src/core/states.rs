//! States and transition tables for the agent manager, command runner and
//! event feed.

use std::fmt;

use crate::core::machine::MachineState;

/// Lifecycle of the `ssh-agent` process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Starting,
    Running,
    Error,
    Killing,
    Stopped,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Killing => "killing",
            Self::Stopped => "stopped",
        }
    }

    /// The agent can no longer become ready.
    pub fn is_gone(self) -> bool {
        matches!(self, Self::Error | Self::Killing | Self::Stopped)
    }
}

impl MachineState for AgentState {
    const MACHINE: &'static str = "ssh-agent";

    fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Starting, Self::Running)
                | (Self::Starting, Self::Error)
                // Shutdown racing startup.
                | (Self::Starting, Self::Killing)
                | (Self::Running, Self::Error)
                | (Self::Running, Self::Killing)
                | (Self::Error, Self::Stopped)
                | (Self::Killing, Self::Stopped)
        )
    }
}

/// Lifecycle of a single remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    WaitAgent,
    Spawning,
    Running,
    Retry,
    Finished,
    Error,
    Stopped,
}

impl CommandState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitAgent => "waitagent",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Stopped)
    }
}

impl MachineState for CommandState {
    const MACHINE: &'static str = "cmd-runner";

    fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::WaitAgent, Self::Spawning)
                | (Self::WaitAgent, Self::Error)
                | (Self::WaitAgent, Self::Stopped)
                | (Self::Spawning, Self::Running)
                | (Self::Spawning, Self::Retry)
                | (Self::Spawning, Self::Error)
                | (Self::Spawning, Self::Stopped)
                // Once running, every outcome is terminal.
                | (Self::Running, Self::Finished)
                | (Self::Running, Self::Error)
                | (Self::Running, Self::Stopped)
                | (Self::Retry, Self::Spawning)
                | (Self::Retry, Self::Error)
                | (Self::Retry, Self::Stopped)
        )
    }
}

/// Lifecycle of the `stream-events` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    WaitAgent,
    Spawning,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitAgent => "waitagent",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl MachineState for StreamState {
    const MACHINE: &'static str = "event-stream";

    fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::WaitAgent, Self::Spawning)
                | (Self::WaitAgent, Self::Error)
                | (Self::WaitAgent, Self::Stopped)
                | (Self::Spawning, Self::Running)
                | (Self::Spawning, Self::Error)
                | (Self::Spawning, Self::Stopping)
                | (Self::Running, Self::Error)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Error, Self::Spawning)
                | (Self::Error, Self::Stopped)
        )
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

display_as_str!(AgentState, CommandState, StreamState);
