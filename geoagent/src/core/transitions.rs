//! Supervisor finite-state machine.
//!
//! The allowed-transition table is explicit: every routing decision the
//! supervisor makes goes through [`Machine::advance`], and anything outside the
//! table (for example evaluation triggering a retry) is rejected with
//! [`InvalidTransition`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    SelectFiles,
    RetrieveContext,
    GenerateCode,
    Debug,
    Evaluate,
    Done,
    Aborted,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "START",
            Stage::SelectFiles => "SELECT_FILES",
            Stage::RetrieveContext => "RETRIEVE_CONTEXT",
            Stage::GenerateCode => "GENERATE_CODE",
            Stage::Debug => "DEBUG",
            Stage::Evaluate => "EVALUATE",
            Stage::Done => "DONE",
            Stage::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Aborted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition outside the allowed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid supervisor transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

/// Targets reachable from `from`.
///
/// Every non-terminal stage may abort (adapter-contract violation or
/// cancellation); terminal stages have no exits.
pub fn allowed_transitions(from: Stage) -> &'static [Stage] {
    use Stage::{Aborted, Debug, Done, Evaluate, GenerateCode, RetrieveContext, SelectFiles, Start};
    match from {
        Start => &[SelectFiles, Aborted],
        SelectFiles => &[RetrieveContext, Aborted],
        RetrieveContext => &[GenerateCode, Aborted],
        GenerateCode => &[Evaluate, Debug, Aborted],
        Debug => &[SelectFiles, RetrieveContext, GenerateCode, Aborted],
        Evaluate => &[Done, Aborted],
        Done => &[],
        Aborted => &[],
    }
}

pub fn validate_transition(from: Stage, to: Stage) -> Result<(), InvalidTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Current stage plus the path of visited stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    current: Stage,
    path: Vec<Stage>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            current: Stage::Start,
            path: vec![Stage::Start],
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    pub fn path(&self) -> &[Stage] {
        &self.path
    }

    /// Move to `to`, or reject without changing state.
    pub fn advance(&mut self, to: Stage) -> Result<Stage, InvalidTransition> {
        let from = self.current;
        validate_transition(from, to)?;
        self.current = to;
        self.path.push(to);
        Ok(from)
    }
}
