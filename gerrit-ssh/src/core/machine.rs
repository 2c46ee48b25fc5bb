//! Observable finite-state cell shared by the three transport machines.
//!
//! Each machine declares its states and transition table through
//! [`MachineState`]. [`StateCell`] holds the current state, refuses moves
//! that are not in the table, and publishes every accepted move through a
//! `watch` channel so dependents can wait on it.

use std::fmt;

use tokio::sync::watch;

/// A state enum with a closed transition table.
pub trait MachineState: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Machine name used in logs and errors.
    const MACHINE: &'static str;

    fn can_transition(self, to: Self) -> bool;
}

/// A rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError<S> {
    pub from: S,
    pub to: S,
}

impl<S: MachineState> fmt::Display for TransitionError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cannot move from {} to {}",
            S::MACHINE,
            self.from,
            self.to
        )
    }
}

impl<S: MachineState> std::error::Error for TransitionError<S> {}

/// Current state of one machine instance.
#[derive(Debug)]
pub struct StateCell<S: MachineState> {
    tx: watch::Sender<S>,
}

impl<S: MachineState> StateCell<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> S {
        *self.tx.borrow()
    }

    pub fn is(&self, state: S) -> bool {
        self.get() == state
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    /// Move to `to` if the table allows it.
    pub fn goto(&self, to: S) -> Result<(), TransitionError<S>> {
        let from = self.get();
        if !from.can_transition(to) {
            tracing::error!(machine = S::MACHINE, %from, %to, "rejected state transition");
            return Err(TransitionError { from, to });
        }
        self.tx.send_replace(to);
        tracing::debug!(machine = S::MACHINE, %from, %to, "state transition");
        Ok(())
    }
}
