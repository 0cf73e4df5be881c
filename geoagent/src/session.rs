//! Session harness: turns user lines into supervisor runs and persists them.

use std::fs;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};

use crate::agents::coder::{CodeLoop, CodeLoopConfig};
use crate::agents::debugger::Debugger;
use crate::agents::evaluator::LlmEvaluator;
use crate::agents::file_search::LlmFileLookup;
use crate::agents::retrieval::CorpusRetriever;
use crate::core::run::RunResult;
use crate::core::types::{FileDescriptor, Task};
use crate::io::artifacts::{RunPaths, write_run};
use crate::io::config::GeoagentConfig;
use crate::io::llm::Llm;
use crate::io::metadata::CorpusEntry;
use crate::io::run_index::RunIndex;
use crate::io::script::ScriptRunner;
use crate::supervisor::{
    Adapters, CancelToken, RunLimits, RunRequest, Supervisor, SupervisorEvent,
};

/// A parsed REPL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `new` / `reset`: start a fresh session.
    Reset,
    /// `exit` / `quit`.
    Exit,
    Query(String),
    Empty,
}

pub fn parse_line(line: &str) -> Input {
    let trimmed = line.trim();
    match trimmed.to_lowercase().as_str() {
        "" => Input::Empty,
        "new" | "reset" => Input::Reset,
        "exit" | "quit" => Input::Exit,
        _ => Input::Query(trimmed.to_string()),
    }
}

fn new_session_id(generation: u32) -> String {
    format!("session-{}-{generation}", Utc::now().format("%Y%m%dT%H%M%S"))
}

/// A finished, persisted run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: RunResult,
    pub paths: RunPaths,
}

/// Owns the agents for a session and persists every run it executes.
pub struct Harness<'a> {
    file_lookup: LlmFileLookup<'a>,
    retriever: CorpusRetriever<'a>,
    code_loop: CodeLoop<'a>,
    debugger: Debugger<'a>,
    evaluator: LlmEvaluator<'a>,
    limits: RunLimits,
    index: RunIndex,
    script_suffix: String,
    cancel: CancelToken,
    session_id: String,
    generation: u32,
    /// Run ids executed in the current session.
    history: Vec<String>,
}

impl<'a> Harness<'a> {
    pub fn new(
        config: &GeoagentConfig,
        llm: &'a dyn Llm,
        runner: &'a dyn ScriptRunner,
        catalog: Vec<FileDescriptor>,
        corpus: Vec<CorpusEntry>,
    ) -> Result<Self> {
        let mut retriever = CorpusRetriever::new(corpus);
        if config.retrieval.rewrite_query {
            retriever = retriever.with_rewriter(llm);
        }
        Ok(Self {
            file_lookup: LlmFileLookup::new(llm, catalog),
            retriever,
            code_loop: CodeLoop::new(
                llm,
                runner,
                CodeLoopConfig::from_execution(&config.execution),
            ),
            debugger: Debugger::new(llm),
            evaluator: LlmEvaluator::new(llm)?,
            limits: RunLimits {
                max_debug_rounds: config.supervisor.max_debug_rounds,
                top_k: config.retrieval.top_k,
            },
            index: RunIndex::new(&config.output.root),
            script_suffix: config.execution.script_suffix.clone(),
            cancel: CancelToken::new(),
            session_id: new_session_id(0),
            generation: 0,
            history: Vec::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Token that aborts the current run at its next stage boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start a fresh session: new id, empty history.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.session_id = new_session_id(self.generation);
        self.history.clear();
        self.cancel = CancelToken::new();
        info!(session = %self.session_id, "session reset");
    }

    /// Run one query end to end and persist its artifacts.
    pub fn run_query<F: FnMut(&SupervisorEvent)>(
        &mut self,
        query: &str,
        on_event: F,
    ) -> Result<RunOutcome> {
        let slot = self.index.allocate()?;
        let paths = RunPaths::new(&slot.dir);
        fs::create_dir_all(&paths.output_dir)
            .with_context(|| format!("create {}", paths.output_dir.display()))?;
        let run_id = slot.run_id();
        info!(%run_id, session = %self.session_id, "starting run");

        let supervisor = Supervisor::new(
            Adapters {
                file_lookup: &self.file_lookup,
                retriever: &self.retriever,
                code_loop: &self.code_loop,
                debugger: &self.debugger,
                evaluator: &self.evaluator,
            },
            self.limits,
        )
        .with_cancel(self.cancel.clone());

        let result = supervisor.run(
            RunRequest {
                session_id: self.session_id.clone(),
                run_id: run_id.clone(),
                task: Task::new(run_id.clone(), query, paths.output_dir.clone()),
            },
            on_event,
        )?;
        write_run(&paths, &result, &self.script_suffix)
            .with_context(|| format!("persist {run_id}"))?;
        self.history.push(run_id);
        Ok(RunOutcome { result, paths })
    }
}

/// Human-readable line for one supervisor event.
pub fn describe_event(event: &SupervisorEvent) -> String {
    match event {
        SupervisorEvent::Transition { from, to } => format!("[stage] {from} -> {to}"),
        SupervisorEvent::FilesSelected { paths } if paths.is_empty() => {
            "[files] no input files selected".to_string()
        }
        SupervisorEvent::FilesSelected { paths } => format!("[files] {}", paths.join(", ")),
        SupervisorEvent::ContextRetrieved { chunks: 0 } => {
            "[context] no documentation context retrieved".to_string()
        }
        SupervisorEvent::ContextRetrieved { chunks } => format!("[context] {chunks} chunk(s)"),
        SupervisorEvent::LoopFinished {
            round,
            success,
            attempts,
        } => format!(
            "[code] round {round}: {} after {attempts} attempt(s)",
            if *success { "succeeded" } else { "failed" }
        ),
        SupervisorEvent::Advice {
            next_agent,
            malformed,
        } => format!(
            "[debug] next agent: {}{}",
            next_agent.as_str(),
            if *malformed { " (malformed advice)" } else { "" }
        ),
        SupervisorEvent::Evaluated { code_accuracy } => {
            format!("[eval] code accuracy {code_accuracy:.2}")
        }
        SupervisorEvent::Aborted { reason } => format!("[abort] {reason}"),
    }
}

/// One-line summary printed after a run.
pub fn summarize(outcome: &RunOutcome) -> String {
    let result = &outcome.result;
    match (&result.output_file, result.is_done()) {
        (Some(path), true) => format!(
            "{} done: output {} (artifacts in {})",
            result.run_id,
            path.display(),
            outcome.paths.dir.display()
        ),
        _ if result.is_done() => format!("{} done", result.run_id),
        _ => format!(
            "{} aborted: {} (artifacts in {})",
            result.run_id,
            result.abort_reason.as_deref().unwrap_or("unknown"),
            outcome.paths.dir.display()
        ),
    }
}

/// Interactive loop. A failing run is reported and the loop continues.
pub fn run_repl<R: BufRead, W: Write>(
    harness: &mut Harness<'_>,
    input: R,
    out: &mut W,
) -> Result<()> {
    writeln!(
        out,
        "geoagent session {} (type `new` to reset, `exit` to quit)",
        harness.session_id()
    )?;
    let mut lines = input.lines();
    loop {
        write!(out, "> ")?;
        out.flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("read input line")?;
        match parse_line(&line) {
            Input::Empty => continue,
            Input::Exit => break,
            Input::Reset => {
                harness.reset();
                writeln!(out, "new session {}", harness.session_id())?;
            }
            Input::Query(query) => {
                let mut write_err = None;
                let outcome = harness.run_query(&query, |event| {
                    if let Err(err) = writeln!(out, "{}", describe_event(event)) {
                        write_err.get_or_insert(err);
                    }
                });
                if let Some(err) = write_err {
                    return Err(err).context("write step output");
                }
                match outcome {
                    Ok(outcome) => writeln!(out, "{}", summarize(&outcome))?,
                    Err(err) => {
                        error!(err = %format!("{err:#}"), "run failed");
                        writeln!(out, "error: {err:#}")?;
                    }
                }
            }
        }
    }
    writeln!(out, "bye")?;
    Ok(())
}
