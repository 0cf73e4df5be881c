//! Stable exit codes for geoagent CLI commands.

/// Command succeeded; for `run`, the task reached `DONE`.
pub const OK: i32 = 0;
/// Invalid configuration, unreadable inputs or another harness error.
pub const INVALID: i32 = 1;
/// `geoagent run` finished in `ABORTED`.
pub const ABORTED: i32 = 2;
