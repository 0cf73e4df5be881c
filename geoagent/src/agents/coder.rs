//! Code execution loop: generate, run, validate, retry.
//!
//! One invocation makes at most [`MAX_ATTEMPTS`] attempts. Each attempt writes
//! the candidate script to a fresh temporary file owned by that attempt, runs
//! it through the [`ScriptRunner`] and classifies the outcome. Harness failures
//! (prompt rendering, LLM call, temp file, spawn) become failed attempts and
//! count against the budget.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::agents::{CODE_AGENT, ask};
use crate::core::extract::{extract_code, has_sentinel, parse_sentinel};
use crate::core::transcript::{Message, Transcript};
use crate::core::types::{
    Attempt, ContextBundle, DebugAdvice, FileDescriptor, LoopResult, MAX_ATTEMPTS, Task,
};
use crate::core::validation::{Observation, OutputStatus, attempt_error, classify};
use crate::io::config::ExecutionConfig;
use crate::io::llm::Llm;
use crate::io::prompt::{CodePromptInput, PromptEngine};
use crate::io::script::{ScriptOutput, ScriptRequest, ScriptRunner};

#[derive(Debug, Clone)]
pub struct CodeLoopConfig {
    pub script_suffix: String,
    /// Where temporary scripts are created. `None` uses the system temp dir.
    pub temp_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CodeLoopConfig {
    pub fn from_execution(cfg: &ExecutionConfig) -> Self {
        Self {
            script_suffix: cfg.script_suffix.clone(),
            temp_dir: cfg.temp_dir.clone(),
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

impl Default for CodeLoopConfig {
    fn default() -> Self {
        Self::from_execution(&ExecutionConfig::default())
    }
}

/// Inputs for one loop invocation.
#[derive(Debug, Clone, Copy)]
pub struct LoopInput<'a> {
    pub task: &'a Task,
    pub files: &'a [FileDescriptor],
    pub context: &'a ContextBundle,
    /// Failures from earlier rounds. They shape the prompt but are not part of
    /// the returned history.
    pub prior: &'a [Attempt],
    pub advice: Option<&'a DebugAdvice>,
    /// 1-based round number, used to label transcript entries.
    pub round: usize,
}

pub struct CodeLoop<'a> {
    llm: &'a dyn Llm,
    runner: &'a dyn ScriptRunner,
    config: CodeLoopConfig,
    prompts: PromptEngine,
}

#[derive(Debug, Serialize)]
struct ToolReport<'a> {
    class: &'static str,
    exit_code: Option<i32>,
    output_file: Option<&'a Path>,
    stdout: &'a str,
    stderr: &'a str,
}

impl<'a> CodeLoop<'a> {
    pub fn new(llm: &'a dyn Llm, runner: &'a dyn ScriptRunner, config: CodeLoopConfig) -> Self {
        Self {
            llm,
            runner,
            config,
            prompts: PromptEngine::new(),
        }
    }

    #[instrument(skip_all, fields(task = %input.task.id, round = input.round))]
    pub fn run(&self, input: &LoopInput<'_>, transcript: &mut Transcript) -> LoopResult {
        let mut attempts: Vec<Attempt> = Vec::new();

        for ordinal in 1..=MAX_ATTEMPTS {
            let attempt = self.attempt(ordinal, input, &attempts, transcript);
            info!(
                ordinal,
                class = attempt.class.as_str(),
                "code attempt finished"
            );
            transcript.push(Message::tool(
                CODE_AGENT,
                format!("round-{}-attempt-{ordinal}", input.round),
                tool_report(&attempt),
            ));

            let succeeded = attempt.succeeded();
            attempts.push(attempt);
            if succeeded {
                return LoopResult {
                    success: true,
                    attempts,
                    error_summary: None,
                };
            }
        }

        let error_summary = attempts.last().map(|a| a.error.clone());
        warn!(attempts = attempts.len(), "code loop exhausted its attempts");
        LoopResult {
            success: false,
            attempts,
            error_summary,
        }
    }

    fn attempt(
        &self,
        ordinal: u32,
        input: &LoopInput<'_>,
        so_far: &[Attempt],
        transcript: &mut Transcript,
    ) -> Attempt {
        let code = match self.generate(input, so_far, transcript) {
            Ok(code) => code,
            Err(err) => {
                warn!(ordinal, err = %format!("{err:#}"), "code generation failed");
                return Attempt::harness_failure(ordinal, String::new(), format!("{err:?}"));
            }
        };
        match self.execute(ordinal, &code, input.task) {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!(ordinal, err = %format!("{err:#}"), "script execution failed in harness");
                Attempt::harness_failure(ordinal, code, format!("{err:?}"))
            }
        }
    }

    fn generate(
        &self,
        input: &LoopInput<'_>,
        so_far: &[Attempt],
        transcript: &mut Transcript,
    ) -> Result<String> {
        let history: Vec<Attempt> = input.prior.iter().chain(so_far).cloned().collect();
        let prompt = self.prompts.render_code_generation(&CodePromptInput {
            query: &input.task.query,
            files: input.files,
            output_dir: &input.task.output_dir,
            context: input.context,
            advice: input.advice,
            history: &history,
        })?;
        let reply = ask(self.llm, CODE_AGENT, prompt, transcript)?;
        Ok(extract_code(&reply))
    }

    fn execute(&self, ordinal: u32, code: &str, task: &Task) -> Result<Attempt> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("geoagent-").suffix(&self.config.script_suffix);
        let mut script = match &self.config.temp_dir {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create temp dir {}", dir.display()))?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        }
        .context("create temp script")?;
        script
            .write_all(code.as_bytes())
            .and_then(|()| script.flush())
            .context("write temp script")?;
        debug!(script = %script.path().display(), "wrote temp script");

        let output = self.runner.run(&ScriptRequest {
            script_path: script.path().to_path_buf(),
            workdir: task.output_dir.clone(),
            timeout: self.config.timeout,
            output_limit_bytes: self.config.output_limit_bytes,
        });
        // The script is removed here on success and by drop on the error path.
        let removed = script.close();
        let output = output?;
        if let Err(err) = removed {
            warn!(err = %err, "failed to remove temp script");
        }

        Ok(evaluate_output(ordinal, code, output, &task.output_dir))
    }
}

/// Classify a finished subprocess into an [`Attempt`].
pub fn evaluate_output(ordinal: u32, code: &str, output: ScriptOutput, workdir: &Path) -> Attempt {
    let claimed = match parse_sentinel(&output.stdout) {
        Some(path) => Some(resolve_claimed(workdir, &path)),
        None => {
            if has_sentinel(&output.stdout) {
                warn!(ordinal, "result line present but not parseable");
            }
            None
        }
    };
    let status = match &claimed {
        None => OutputStatus::NotClaimed,
        Some(path) => check_output(path),
    };
    let class = classify(&Observation {
        timed_out: output.timed_out,
        stderr: &output.stderr,
        traceback_seen: output.traceback_seen,
        output: status,
    });
    Attempt {
        ordinal,
        code: code.to_string(),
        error: attempt_error(class, &output.stderr),
        stdout: output.stdout,
        stderr: output.stderr,
        class,
        output_file: claimed,
        exit_code: output.exit_code,
    }
}

/// Relative claims resolve against the script's working directory.
fn resolve_claimed(workdir: &Path, claimed: &str) -> PathBuf {
    let path = Path::new(claimed);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn check_output(path: &Path) -> OutputStatus {
    match fs::metadata(path) {
        Ok(meta) if !meta.is_file() => OutputStatus::Missing,
        Ok(meta) if meta.len() == 0 => OutputStatus::Empty,
        Ok(_) => OutputStatus::Present,
        Err(_) => OutputStatus::Missing,
    }
}

fn tool_report(attempt: &Attempt) -> String {
    let report = ToolReport {
        class: attempt.class.as_str(),
        exit_code: attempt.exit_code,
        output_file: attempt.output_file.as_deref(),
        stdout: &attempt.stdout,
        stderr: &attempt.stderr,
    };
    serde_json::to_string(&report).unwrap_or_else(|_| attempt.class.as_str().to_string())
}
