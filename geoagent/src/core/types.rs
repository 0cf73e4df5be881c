//! Shared deterministic types for the geoagent core.
//!
//! These types define the contracts handed between the supervisor, the code
//! execution loop, the debug loop and the tool adapters. They carry no I/O and
//! serialize to stable JSON for run artifacts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Hard cap on attempts per code execution loop invocation.
pub const MAX_ATTEMPTS: u32 = 5;

/// One user task, created at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub query: String,
    /// Directory generated scripts write their outputs into.
    pub output_dir: PathBuf,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        query: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            output_dir: output_dir.into(),
        }
    }
}

/// Descriptor of one geospatial data file available to the agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub geometry: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, alias = "features")]
    pub feature_count: Option<u64>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl FileDescriptor {
    /// Descriptor carrying only a path (used by tests and fixtures).
    pub fn bare(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: String::new(),
            geometry: None,
            fields: Vec::new(),
            feature_count: None,
            crs: None,
            description: String::new(),
        }
    }
}

/// Render descriptors in the block layout used by every prompt.
pub fn render_file_metadata(files: &[FileDescriptor]) -> String {
    if files.is_empty() {
        return "No input files were selected.".to_string();
    }
    let mut buf = String::new();
    for file in files {
        buf.push_str(&format!("- File: {}\n", file.path));
        buf.push_str(&format!(
            "  Type: {} ({})\n",
            file.kind,
            file.geometry.as_deref().unwrap_or("")
        ));
        buf.push_str(&format!("  Fields: {}\n", file.fields.join(", ")));
        match file.feature_count {
            Some(count) => buf.push_str(&format!("  Features: {count}\n")),
            None => buf.push_str("  Features: unknown\n"),
        }
        buf.push_str(&format!(
            "  CRS: {}\n",
            file.crs.as_deref().unwrap_or("Unknown")
        ));
        buf.push_str(&format!("  Description: {}\n", file.description));
    }
    buf
}

/// A retrieved documentation chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub source: String,
    pub title: String,
    pub content: String,
}

/// Ordered retrieval result. Replaced wholesale on re-retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub chunks: Vec<ContextChunk>,
}

impl ContextBundle {
    pub fn new(chunks: Vec<ContextChunk>) -> Self {
        Self { chunks }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Render for prompts. An empty bundle renders an explicit absence notice
    /// rather than an empty string.
    pub fn render(&self) -> String {
        if self.chunks.is_empty() {
            return "No documentation context was retrieved for this task.".to_string();
        }
        self.chunks
            .iter()
            .map(|chunk| {
                format!(
                    "# Source: {}\nTitle: {}\nContent:\n{}\n---",
                    chunk.source, chunk.title, chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Classification of one attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptClass {
    Success,
    Timeout,
    Traceback,
    MissingSentinel,
    OutputMissing,
    OutputEmpty,
    HarnessError,
}

impl AttemptClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptClass::Success => "success",
            AttemptClass::Timeout => "timeout",
            AttemptClass::Traceback => "traceback",
            AttemptClass::MissingSentinel => "missing_sentinel",
            AttemptClass::OutputMissing => "output_missing",
            AttemptClass::OutputEmpty => "output_empty",
            AttemptClass::HarnessError => "harness_error",
        }
    }

    /// Message used as the attempt error when the subprocess left stderr empty.
    pub fn synthesized_error(self) -> &'static str {
        match self {
            AttemptClass::Success => "",
            AttemptClass::Timeout => "Script execution timed out before completing.",
            AttemptClass::Traceback => "Script raised an exception (traceback on stderr).",
            AttemptClass::MissingSentinel => {
                "Script did not print a ##RESULT## line with the output file path."
            }
            AttemptClass::OutputMissing => "Generated code failed to save a valid output file.",
            AttemptClass::OutputEmpty => "Generated code saved an empty output file.",
            AttemptClass::HarnessError => "Attempt failed inside the harness.",
        }
    }
}

/// One generate-execute-validate cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based position within its loop invocation.
    pub ordinal: u32,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub class: AttemptClass,
    /// Empty on success.
    pub error: String,
    /// Path claimed by the `##RESULT##` sentinel, if any.
    pub output_file: Option<PathBuf>,
    pub exit_code: Option<i32>,
}

impl Attempt {
    pub fn succeeded(&self) -> bool {
        self.class == AttemptClass::Success
    }

    /// Attempt recorded when the harness itself failed before a script could run.
    pub fn harness_failure(ordinal: u32, code: String, trace: String) -> Self {
        Self {
            ordinal,
            code,
            stdout: String::new(),
            stderr: String::new(),
            class: AttemptClass::HarnessError,
            error: trace,
            output_file: None,
            exit_code: None,
        }
    }
}

/// Outcome of one code execution loop invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopResult {
    pub success: bool,
    pub attempts: Vec<Attempt>,
    /// Last known error when the loop did not succeed.
    pub error_summary: Option<String>,
}

impl LoopResult {
    pub fn final_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn final_code(&self) -> &str {
        self.final_attempt().map(|a| a.code.as_str()).unwrap_or("")
    }

    pub fn output_file(&self) -> Option<&Path> {
        if !self.success {
            return None;
        }
        self.final_attempt().and_then(|a| a.output_file.as_deref())
    }
}

/// Routing recommendation produced by the debug loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextAgent {
    File,
    Retrieval,
    Code,
    None,
}

impl NextAgent {
    pub fn as_str(self) -> &'static str {
        match self {
            NextAgent::File => "file",
            NextAgent::Retrieval => "retrieval",
            NextAgent::Code => "code",
            NextAgent::None => "none",
        }
    }
}

/// Corrective advice and routing returned by the debug loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugAdvice {
    pub code_advice: String,
    /// Raw routing text before normalization.
    pub routing_advice: String,
    pub next_agent: NextAgent,
    pub code_block_found: bool,
    pub routing_block_found: bool,
}

impl DebugAdvice {
    /// Advice counts as malformed when neither tagged block was present.
    pub fn is_malformed(&self) -> bool {
        !self.code_block_found && !self.routing_block_found
    }
}

/// Score and reasoning for one evaluation dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub score: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub context_to_code: f64,
    pub full_task_to_code: f64,
}

/// Quality report produced after a successful loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub context_relevance: DimensionScore,
    pub context_coverage: DimensionScore,
    pub code_accuracy: DimensionScore,
    pub code_context_consistency: DimensionScore,
    pub similarity: Similarity,
}
