//! Configuration stored in `geoagent.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "geoagent.toml";

/// Bounds on the per-attempt script timeout, in seconds.
pub const MIN_SCRIPT_TIMEOUT_SECS: u64 = 60;
pub const MAX_SCRIPT_TIMEOUT_SECS: u64 = 120;

/// Top-level configuration (TOML). Missing fields take defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeoagentConfig {
    pub llm: LlmConfig,
    pub execution: ExecutionConfig,
    pub retrieval: RetrievalConfig,
    pub files: FilesConfig,
    pub supervisor: SupervisorConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// OpenAI-compatible `/v1/chat/completions` over HTTP.
    Openai,
    /// External command: prompt on stdin, reply on stdout.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    /// Explicit endpoint, e.g. `http://10.0.0.5:8000`. Wins over `endpoint_file`.
    pub base_url: Option<String>,
    /// File holding the endpoint host, written by whatever launches the model server.
    pub endpoint_file: Option<PathBuf>,
    /// How long to wait for `endpoint_file` to appear and be non-empty.
    pub endpoint_wait_secs: u64,
    /// Port used when the endpoint file holds a bare host.
    pub port: u16,
    pub model: String,
    /// Name of the environment variable holding a bearer token, if any.
    pub api_key_env: Option<String>,
    pub temperature: f64,
    pub request_timeout_secs: u64,
    /// Command for the `command` backend (e.g. `["ollama","run","llama3"]`).
    pub command: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Openai,
            base_url: None,
            endpoint_file: None,
            endpoint_wait_secs: 30,
            port: 8000,
            model: "default".to_string(),
            api_key_env: None,
            temperature: 0.0,
            request_timeout_secs: 300,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Interpreter program plus leading args; the script path is appended.
    pub interpreter: Vec<String>,
    pub script_suffix: String,
    /// Wall-clock limit per attempt.
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Directory for temporary scripts. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            script_suffix: ".py".to_string(),
            timeout_secs: MIN_SCRIPT_TIMEOUT_SECS,
            output_limit_bytes: 100_000,
            temp_dir: None,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// JSON corpus of `{file, title, text}` chunks. No corpus means empty context.
    pub corpus: Option<PathBuf>,
    pub top_k: usize,
    pub rewrite_query: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            corpus: None,
            top_k: 5,
            rewrite_query: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilesConfig {
    /// JSON array of file descriptors.
    pub metadata: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_debug_rounds: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_debug_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    /// Root for run directories (`<root>/runs/run-NNNN`).
    pub root: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("geoagent-runs"),
        }
    }
}

impl GeoagentConfig {
    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        if !(MIN_SCRIPT_TIMEOUT_SECS..=MAX_SCRIPT_TIMEOUT_SECS).contains(&exec.timeout_secs) {
            return Err(anyhow!(
                "execution.timeout_secs must be within {MIN_SCRIPT_TIMEOUT_SECS}..={MAX_SCRIPT_TIMEOUT_SECS}"
            ));
        }
        if exec.output_limit_bytes == 0 {
            return Err(anyhow!("execution.output_limit_bytes must be > 0"));
        }
        if exec.interpreter.is_empty() || exec.interpreter[0].trim().is_empty() {
            return Err(anyhow!("execution.interpreter must be a non-empty array"));
        }
        if self.retrieval.top_k == 0 {
            return Err(anyhow!("retrieval.top_k must be > 0"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(anyhow!("llm.request_timeout_secs must be > 0"));
        }
        if self.llm.backend == LlmBackend::Command
            && self.llm.command.first().is_none_or(|c| c.trim().is_empty())
        {
            return Err(anyhow!("llm.command must be a non-empty array for the command backend"));
        }
        if self.output.root.as_os_str().is_empty() {
            return Err(anyhow!("output.root must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GeoagentConfig::default()`.
pub fn load_config(path: &Path) -> Result<GeoagentConfig> {
    if !path.exists() {
        let cfg = GeoagentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GeoagentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GeoagentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
