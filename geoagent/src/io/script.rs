//! Script execution backend.
//!
//! The [`ScriptRunner`] trait decouples the code loop from the real interpreter
//! process. Tests use scripted runners that return predetermined outputs.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one script execution.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub script_path: PathBuf,
    /// Working directory; relative output paths resolve against it.
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What the subprocess produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Traceback marker seen on the full stderr stream, not only the captured part.
    pub traceback_seen: bool,
}

pub trait ScriptRunner {
    /// Run the script. `Err` means the harness could not run it at all.
    fn run(&self, request: &ScriptRequest) -> Result<ScriptOutput>;
}

/// Runs scripts with an interpreter in an isolated child process with a
/// headless display and unbuffered output.
#[derive(Debug, Clone)]
pub struct InterpreterRunner {
    program: String,
    args: Vec<String>,
}

impl InterpreterRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a `["python3", "-X", "dev"]` style command.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("interpreter command must not be empty")?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

impl ScriptRunner for InterpreterRunner {
    #[instrument(skip_all, fields(program = %self.program, script = %request.script_path.display()))]
    fn run(&self, request: &ScriptRequest) -> Result<ScriptOutput> {
        std::fs::create_dir_all(&request.workdir)
            .with_context(|| format!("create workdir {}", request.workdir.display()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&request.script_path)
            .current_dir(&request.workdir)
            .env("QT_QPA_PLATFORM", "offscreen")
            .env("PYTHONUNBUFFERED", "1");

        info!("running generated script");
        let output =
            run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
                .context("run generated script")?;
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "generated script timed out");
        }

        Ok(ScriptOutput {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            traceback_seen: output.stderr_traceback,
        })
    }
}
