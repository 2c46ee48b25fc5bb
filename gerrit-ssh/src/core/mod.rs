//! Deterministic, pure logic shared by the transport machines.
//!
//! Core modules must be free of I/O side effects. They parse text, keep
//! budgets and enforce transition tables, and are tested in isolation.

pub mod agent_output;
pub mod machine;
pub mod record;
pub mod retry;
pub mod states;
pub mod tail;
pub mod trace;
