//! Scripted fakes and fixtures for driving agents without a model or interpreter.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::core::types::FileDescriptor;
use crate::io::llm::Llm;
use crate::io::metadata::CorpusEntry;
use crate::io::script::{ScriptOutput, ScriptRequest, ScriptRunner};

/// Returns queued replies in order and records every prompt.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    replies: RefCell<VecDeque<Result<String, String>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    /// `Err(message)` entries make the corresponding call fail.
    pub fn from_results<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, String>>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl Llm for ScriptedLlm {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.borrow_mut().push(prompt.to_string());
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted LLM has no reply left")),
        }
    }
}

/// Fails every call with the same message.
#[derive(Debug)]
pub struct FailingLlm {
    message: String,
}

impl FailingLlm {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Llm for FailingLlm {
    fn complete(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!(self.message.clone()))
    }
}

/// One queued subprocess outcome for [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Output {
        output: ScriptOutput,
        /// Files (relative to the workdir) created before returning.
        writes: Vec<(String, String)>,
    },
    HarnessError(String),
}

impl ScriptStep {
    /// Writes `file` and reports it through the sentinel.
    pub fn success(file: &str, contents: &str) -> Self {
        ScriptStep::Output {
            output: ScriptOutput {
                stdout: format!("##RESULT## {{\"output_file\": \"{file}\"}}\n"),
                exit_code: Some(0),
                ..ScriptOutput::default()
            },
            writes: vec![(file.to_string(), contents.to_string())],
        }
    }

    pub fn traceback(message: &str) -> Self {
        ScriptStep::Output {
            output: ScriptOutput {
                stderr: format!("Traceback (most recent call last):\n  {message}\n"),
                exit_code: Some(1),
                traceback_seen: true,
                ..ScriptOutput::default()
            },
            writes: Vec::new(),
        }
    }

    pub fn no_sentinel(stdout: &str) -> Self {
        ScriptStep::Output {
            output: ScriptOutput {
                stdout: stdout.to_string(),
                exit_code: Some(0),
                ..ScriptOutput::default()
            },
            writes: Vec::new(),
        }
    }

    pub fn timeout() -> Self {
        ScriptStep::Output {
            output: ScriptOutput {
                timed_out: true,
                ..ScriptOutput::default()
            },
            writes: Vec::new(),
        }
    }

    pub fn harness_error(message: &str) -> Self {
        ScriptStep::HarnessError(message.to_string())
    }
}

/// Script observed by [`ScriptedRunner`] at run time.
#[derive(Debug, Clone)]
pub struct SeenScript {
    pub path: PathBuf,
    pub existed: bool,
    pub contents: String,
}

/// Replays queued outcomes instead of spawning an interpreter.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    steps: RefCell<VecDeque<ScriptStep>>,
    seen: RefCell<Vec<SeenScript>>,
}

impl ScriptedRunner {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into_iter().collect()),
            seen: RefCell::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<SeenScript> {
        self.seen.borrow().clone()
    }
}

impl ScriptRunner for ScriptedRunner {
    fn run(&self, request: &ScriptRequest) -> Result<ScriptOutput> {
        let contents = fs::read_to_string(&request.script_path).unwrap_or_default();
        self.seen.borrow_mut().push(SeenScript {
            path: request.script_path.clone(),
            existed: request.script_path.exists(),
            contents,
        });
        match self.steps.borrow_mut().pop_front() {
            Some(ScriptStep::Output { output, writes }) => {
                for (name, body) in writes {
                    let path = request.workdir.join(name);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, body)?;
                }
                Ok(output)
            }
            Some(ScriptStep::HarnessError(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted runner has no step left")),
        }
    }
}

/// Code-generation reply wrapping `code` in a python block.
pub fn code_reply(code: &str) -> String {
    format!("Here is the script:\n```python\n{code}\n```\n")
}

pub fn advice_reply(code_advice: &str, routing: &str) -> String {
    format!("```CODE_ADVICE\n{code_advice}\n```\n\n```AGENT_CALLING_ADVICE\n{routing}\n```\n")
}

pub fn filepaths_reply(paths: &[&str]) -> String {
    let json = serde_json::to_string(paths).unwrap_or_else(|_| "[]".to_string());
    format!("```Filepaths\n{json}\n```")
}

/// Evaluation reply with every dimension at `score`.
pub fn evaluation_reply(score: f64) -> String {
    let dim = serde_json::json!({"score": score, "reasoning": "scripted"});
    let body = serde_json::json!({
        "context_relevance": dim,
        "context_coverage": dim,
        "code_accuracy": dim,
        "code_context_consistency": dim,
    });
    format!("```json\n{body}\n```")
}

pub fn sample_catalog() -> Vec<FileDescriptor> {
    vec![
        FileDescriptor {
            path: "/data/roads.shp".to_string(),
            kind: "vector".to_string(),
            geometry: Some("LineString".to_string()),
            fields: vec!["name".to_string(), "lanes".to_string()],
            feature_count: Some(1200),
            crs: Some("EPSG:4326".to_string()),
            description: "Road network".to_string(),
        },
        FileDescriptor {
            path: "/data/dem.tif".to_string(),
            kind: "raster".to_string(),
            geometry: None,
            fields: Vec::new(),
            feature_count: None,
            crs: Some("EPSG:3857".to_string()),
            description: "Elevation model".to_string(),
        },
    ]
}

pub fn sample_corpus() -> Vec<CorpusEntry> {
    vec![
        CorpusEntry {
            file: "vector_writer.md".to_string(),
            title: "Writing vector layers".to_string(),
            text: "Use QgsVectorFileWriter.writeAsVectorFormatV3 to save roads or any vector layer."
                .to_string(),
        },
        CorpusEntry {
            file: "raster_calc.md".to_string(),
            title: "Raster calculator".to_string(),
            text: "QgsRasterCalculator evaluates expressions over raster bands.".to_string(),
        },
    ]
}
