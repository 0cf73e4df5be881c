//! The terminal result of one supervisor run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::transcript::Message;
use crate::core::transitions::Stage;
use crate::core::types::{
    Attempt, ContextBundle, DebugAdvice, Evaluation, FileDescriptor, LoopResult, Task,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Aborted,
}

/// Why a run did not succeed: last error plus the attempts that led there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub last_error: String,
    pub attempts: Vec<Attempt>,
}

/// Emitted once at a terminal stage and never mutated afterwards.
///
/// The transcript is not part of the serialized document; it is persisted on
/// its own as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub session_id: String,
    pub run_id: String,
    pub task: Task,
    pub status: RunStatus,
    pub abort_reason: Option<String>,
    pub files: Vec<FileDescriptor>,
    pub context: ContextBundle,
    pub final_code: String,
    pub output_file: Option<PathBuf>,
    /// Only present after a successful code loop.
    pub evaluation: Option<Evaluation>,
    /// One entry per code loop invocation.
    pub rounds: Vec<LoopResult>,
    pub advices: Vec<DebugAdvice>,
    pub path: Vec<Stage>,
    pub failure: Option<FailureSummary>,
    pub started_at: String,
    pub ended_at: String,
    #[serde(skip)]
    pub transcript: Vec<Message>,
}

impl RunResult {
    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }

    pub fn attempt_count(&self) -> usize {
        self.rounds.iter().map(|round| round.attempts.len()).sum()
    }
}
