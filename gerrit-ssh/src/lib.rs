//! Gerrit's ssh command surface and event feed, driven through the OpenSSH
//! client.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure logic (retry budgets, trace classification, state
//!   tables). No I/O, tested in isolation.
//! - **[`io`]**: The three process-supervising machines (agent, command
//!   runner, event feed) plus configuration and transport plumbing.
//!
//! [`client::GerritClient`] ties them together into request builders.

pub mod client;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use client::{GerritClient, ReviewComment, ReviewInput};
pub use error::GerritError;
