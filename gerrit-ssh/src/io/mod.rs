//! Side-effecting halves of the transport: processes, pipes and config.

pub mod agent;
pub mod command;
pub mod config;
pub mod event_stream;
pub mod pipe;
pub mod process;
pub mod transport;
