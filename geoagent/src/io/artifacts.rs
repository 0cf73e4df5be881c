//! Per-run artifacts under `<output.root>/runs/run-NNNN/`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::run::RunResult;
use crate::core::transcript::Message;
use crate::core::types::{Attempt, AttemptClass};
use crate::io::config::write_atomic;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub result_path: PathBuf,
    pub transcript_path: PathBuf,
    /// Working directory handed to generated scripts.
    pub output_dir: PathBuf,
    pub rounds_dir: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            dir: run_dir.to_path_buf(),
            result_path: run_dir.join("result.json"),
            transcript_path: run_dir.join("transcript.jsonl"),
            output_dir: run_dir.join("output"),
            rounds_dir: run_dir.join("rounds"),
        }
    }

    pub fn attempt_dir(&self, round: usize, ordinal: u32) -> PathBuf {
        self.rounds_dir
            .join(round.to_string())
            .join(format!("attempt-{ordinal}"))
    }
}

#[derive(Debug, Serialize)]
struct AttemptMeta<'a> {
    round: usize,
    ordinal: u32,
    class: AttemptClass,
    error: &'a str,
    output_file: Option<&'a Path>,
    exit_code: Option<i32>,
}

/// Persist the result document, the transcript and a copy of every attempt.
pub fn write_run(paths: &RunPaths, result: &RunResult, script_suffix: &str) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run dir {}", paths.dir.display()))?;

    for (index, round) in result.rounds.iter().enumerate() {
        for attempt in &round.attempts {
            write_attempt(paths, index + 1, attempt, script_suffix)?;
        }
    }
    write_transcript(&paths.transcript_path, &result.transcript)?;

    let mut buf = serde_json::to_string_pretty(result).context("serialize run result")?;
    buf.push('\n');
    write_atomic(&paths.result_path, &buf)?;

    debug!(dir = %paths.dir.display(), "wrote run artifacts");
    Ok(())
}

fn write_attempt(paths: &RunPaths, round: usize, attempt: &Attempt, suffix: &str) -> Result<()> {
    let dir = paths.attempt_dir(round, attempt.ordinal);
    fs::create_dir_all(&dir).with_context(|| format!("create attempt dir {}", dir.display()))?;

    write_text(&dir.join(format!("script{suffix}")), &attempt.code)?;
    write_text(&dir.join("stdout.log"), &attempt.stdout)?;
    write_text(&dir.join("stderr.log"), &attempt.stderr)?;
    write_json(
        &dir.join("meta.json"),
        &AttemptMeta {
            round,
            ordinal: attempt.ordinal,
            class: attempt.class,
            error: &attempt.error,
            output_file: attempt.output_file.as_deref(),
            exit_code: attempt.exit_code,
        },
    )
}

/// One JSON object per line.
pub fn write_transcript(path: &Path, messages: &[Message]) -> Result<()> {
    let mut file =
        fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    for message in messages {
        let line = serde_json::to_string(message).context("serialize transcript message")?;
        writeln!(file, "{line}").with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

pub fn read_transcript(path: &Path) -> Result<Vec<Message>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("parse transcript line"))
        .collect()
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
