//! Side-effecting operations: filesystem, subprocesses, HTTP and templates.

pub mod artifacts;
pub mod config;
pub mod llm;
pub mod metadata;
pub mod process;
pub mod prompt;
pub mod run_index;
pub mod script;
