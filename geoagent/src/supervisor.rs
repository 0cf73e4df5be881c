//! Supervisor: drives one task through the stage machine.
//!
//! Each routing decision goes through [`Machine::advance`], so the supervisor
//! cannot take a transition outside the table. Adapter failures and
//! cancellation end the run in `ABORTED` with a partial [`RunResult`]; the only
//! `Err` this module returns is an [`InvalidTransition`](crate::core::transitions::InvalidTransition),
//! which indicates a bug in the routing code itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Error, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::coder::{CodeLoop, LoopInput};
use crate::agents::debugger::{DiagnoseInput, Debugger};
use crate::agents::{AdapterContractError, EvaluationInput, Evaluator, FileLookup, Retriever};
use crate::core::run::{FailureSummary, RunResult, RunStatus};
use crate::core::transcript::{Message, Transcript};
use crate::core::transitions::{Machine, Stage};
use crate::core::types::{
    ContextBundle, DebugAdvice, Evaluation, FileDescriptor, LoopResult, NextAgent, Task,
};

pub const REASON_CANCELLED: &str = "cancelled";
pub const REASON_DEBUG_BUDGET: &str = "debug budget exhausted";
pub const REASON_MALFORMED_ADVICE: &str = "malformed debug advice after re-query";

/// The adapters a run is wired to.
pub struct Adapters<'a> {
    pub file_lookup: &'a dyn FileLookup,
    pub retriever: &'a dyn Retriever,
    pub code_loop: &'a CodeLoop<'a>,
    pub debugger: &'a Debugger<'a>,
    pub evaluator: &'a dyn Evaluator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub max_debug_rounds: u32,
    pub top_k: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_debug_rounds: 3,
            top_k: 5,
        }
    }
}

/// Caller-held flag checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Intermediate steps streamed to the caller while a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Transition { from: Stage, to: Stage },
    FilesSelected { paths: Vec<String> },
    ContextRetrieved { chunks: usize },
    LoopFinished { round: usize, success: bool, attempts: usize },
    Advice { next_agent: NextAgent, malformed: bool },
    Evaluated { code_accuracy: f64 },
    Aborted { reason: String },
}

/// Identity of one run within a session.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: String,
    pub run_id: String,
    pub task: Task,
}

pub struct Supervisor<'a> {
    adapters: Adapters<'a>,
    limits: RunLimits,
    cancel: CancelToken,
}

/// Mutable bookkeeping for one run.
struct RunState {
    machine: Machine,
    transcript: Transcript,
    files: Vec<FileDescriptor>,
    context: ContextBundle,
    rounds: Vec<LoopResult>,
    advices: Vec<DebugAdvice>,
    evaluation: Option<Evaluation>,
    abort_reason: Option<String>,
    debug_rounds: u32,
}

impl<'a> Supervisor<'a> {
    pub fn new(adapters: Adapters<'a>, limits: RunLimits) -> Self {
        Self {
            adapters,
            limits,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[instrument(skip_all, fields(run_id = %request.run_id))]
    pub fn run<F: FnMut(&SupervisorEvent)>(
        &self,
        request: RunRequest,
        mut on_event: F,
    ) -> Result<RunResult> {
        let started_at = Utc::now().to_rfc3339();
        let task = request.task;
        let mut state = RunState {
            machine: Machine::new(),
            transcript: Transcript::new(),
            files: Vec::new(),
            context: ContextBundle::default(),
            rounds: Vec::new(),
            advices: Vec::new(),
            evaluation: None,
            abort_reason: None,
            debug_rounds: 0,
        };
        state.transcript.push(Message::user(task.query.clone()));

        let mut next = Stage::SelectFiles;
        while !state.machine.current().is_terminal() {
            if self.cancel.is_cancelled() && !matches!(next, Stage::Aborted | Stage::Done) {
                next = Stage::Aborted;
                state.abort_reason = Some(REASON_CANCELLED.to_string());
            }
            let from = state.machine.advance(next)?;
            info!(%from, to = %next, "stage transition");
            on_event(&SupervisorEvent::Transition { from, to: next });

            next = match next {
                Stage::SelectFiles => self.select_files(&task, &mut state, &mut on_event),
                Stage::RetrieveContext => self.retrieve_context(&task, &mut state, &mut on_event),
                Stage::GenerateCode => self.generate_code(&task, &mut state, &mut on_event),
                Stage::Debug => self.debug(&task, &mut state, &mut on_event),
                Stage::Evaluate => self.evaluate(&task, &mut state, &mut on_event),
                Stage::Aborted => {
                    let reason = state.abort_reason.clone().unwrap_or_default();
                    warn!(%reason, "run aborted");
                    on_event(&SupervisorEvent::Aborted { reason });
                    Stage::Aborted
                }
                Stage::Start | Stage::Done => Stage::Done,
            };
        }

        Ok(assemble(request.session_id, request.run_id, task, state, started_at))
    }

    fn select_files<F: FnMut(&SupervisorEvent)>(
        &self,
        task: &Task,
        state: &mut RunState,
        on_event: &mut F,
    ) -> Stage {
        match self.adapters.file_lookup.lookup(&task.query, &mut state.transcript) {
            Ok(files) => {
                on_event(&SupervisorEvent::FilesSelected {
                    paths: files.iter().map(|f| f.path.clone()).collect(),
                });
                state.files = files;
                Stage::RetrieveContext
            }
            Err(err) => abort_with(state, describe_failure("file lookup", &err)),
        }
    }

    fn retrieve_context<F: FnMut(&SupervisorEvent)>(
        &self,
        task: &Task,
        state: &mut RunState,
        on_event: &mut F,
    ) -> Stage {
        match self
            .adapters
            .retriever
            .retrieve(&task.query, self.limits.top_k, &mut state.transcript)
        {
            Ok(context) => {
                if context.is_empty() {
                    info!("retrieval returned no context");
                }
                on_event(&SupervisorEvent::ContextRetrieved {
                    chunks: context.len(),
                });
                state.context = context;
                Stage::GenerateCode
            }
            Err(err) => abort_with(state, describe_failure("retrieval", &err)),
        }
    }

    fn generate_code<F: FnMut(&SupervisorEvent)>(
        &self,
        task: &Task,
        state: &mut RunState,
        on_event: &mut F,
    ) -> Stage {
        let round = state.rounds.len() + 1;
        let input = LoopInput {
            task,
            files: &state.files,
            context: &state.context,
            // Only the previous round's attempts condition the next prompt.
            prior: state
                .rounds
                .last()
                .map(|prev| prev.attempts.as_slice())
                .unwrap_or_default(),
            advice: state.advices.last(),
            round,
        };
        let result = self.adapters.code_loop.run(&input, &mut state.transcript);
        on_event(&SupervisorEvent::LoopFinished {
            round,
            success: result.success,
            attempts: result.attempts.len(),
        });
        let success = result.success;
        state.rounds.push(result);
        if success { Stage::Evaluate } else { Stage::Debug }
    }

    fn debug<F: FnMut(&SupervisorEvent)>(
        &self,
        task: &Task,
        state: &mut RunState,
        on_event: &mut F,
    ) -> Stage {
        if state.debug_rounds >= self.limits.max_debug_rounds {
            return abort_with(state, REASON_DEBUG_BUDGET.to_string());
        }
        state.debug_rounds += 1;

        let (last_code, last_error) = state
            .rounds
            .last()
            .and_then(LoopResult::final_attempt)
            .map(|a| (a.code.clone(), a.error.clone()))
            .unwrap_or_default();

        let mut routed = None;
        // One query plus at most one re-query for malformed advice.
        for query in 0..2 {
            let received = self.adapters.debugger.diagnose(
                &DiagnoseInput {
                    task,
                    files: &state.files,
                    context: &state.context,
                    last_code: &last_code,
                    last_error: &last_error,
                },
                &mut state.transcript,
            );
            on_event(&SupervisorEvent::Advice {
                next_agent: received.next_agent,
                malformed: received.is_malformed(),
            });
            let malformed = received.is_malformed();
            let next_agent = received.next_agent;
            state.advices.push(received);
            if !malformed {
                routed = Some(next_agent);
                break;
            }
            warn!(query, "debug advice malformed");
        }

        match routed {
            Some(NextAgent::File) => Stage::SelectFiles,
            Some(NextAgent::Retrieval) => Stage::RetrieveContext,
            Some(NextAgent::Code | NextAgent::None) => Stage::GenerateCode,
            None => abort_with(state, REASON_MALFORMED_ADVICE.to_string()),
        }
    }

    fn evaluate<F: FnMut(&SupervisorEvent)>(
        &self,
        task: &Task,
        state: &mut RunState,
        on_event: &mut F,
    ) -> Stage {
        let code = state
            .rounds
            .last()
            .map(|round| round.final_code().to_string())
            .unwrap_or_default();
        let input = EvaluationInput {
            query: &task.query,
            files: &state.files,
            context: &state.context,
            code: &code,
        };
        match self.adapters.evaluator.evaluate(&input, &mut state.transcript) {
            Ok(evaluation) => {
                on_event(&SupervisorEvent::Evaluated {
                    code_accuracy: evaluation.code_accuracy.score,
                });
                state.evaluation = Some(evaluation);
                Stage::Done
            }
            Err(err) => abort_with(state, describe_failure("evaluation", &err)),
        }
    }
}

fn abort_with(state: &mut RunState, reason: String) -> Stage {
    state.abort_reason = Some(reason);
    Stage::Aborted
}

fn describe_failure(stage: &str, err: &Error) -> String {
    match err.downcast_ref::<AdapterContractError>() {
        Some(contract) => format!("adapter contract violation: {contract}"),
        None => format!("{stage} failed: {err:#}"),
    }
}

fn assemble(
    session_id: String,
    run_id: String,
    task: Task,
    state: RunState,
    started_at: String,
) -> RunResult {
    let status = if state.machine.current() == Stage::Done {
        RunStatus::Done
    } else {
        RunStatus::Aborted
    };
    let last_round = state.rounds.last();
    let final_code = last_round.map(|r| r.final_code().to_string()).unwrap_or_default();
    let output_file = last_round.and_then(|r| r.output_file()).map(|p| p.to_path_buf());
    let failure = match status {
        RunStatus::Done => None,
        RunStatus::Aborted => Some(FailureSummary {
            last_error: last_round
                .and_then(|r| r.error_summary.clone())
                .or_else(|| state.abort_reason.clone())
                .unwrap_or_default(),
            attempts: last_round.map(|r| r.attempts.clone()).unwrap_or_default(),
        }),
    };

    RunResult {
        session_id,
        run_id,
        task,
        status,
        abort_reason: state.abort_reason,
        files: state.files,
        context: state.context,
        final_code,
        output_file,
        evaluation: state.evaluation,
        rounds: state.rounds,
        advices: state.advices,
        path: state.machine.path().to_vec(),
        failure,
        started_at,
        ended_at: Utc::now().to_rfc3339(),
        transcript: state.transcript.into_messages(),
    }
}
