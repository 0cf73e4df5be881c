//! LLM agent orchestration for geospatial scripting tasks.
//!
//! A natural-language task is routed through file lookup, documentation
//! retrieval and a generate-execute-validate loop that produces and runs a
//! script, with a debug loop that re-routes failed rounds and an evaluation
//! step that scores the result. The crate is split into:
//!
//! - **[`core`]**: Pure, deterministic logic (stage machine, reply parsing,
//!   outcome classification, similarity). No I/O.
//! - **[`io`]**: Side effects (subprocesses, HTTP, templates, config, run
//!   artifacts), isolated behind traits so tests can script them.
//! - **[`agents`]**: One module per agent role.
//!
//! [`supervisor`] drives a single run; [`session`] wraps runs into an
//! interactive session and persists their artifacts.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
