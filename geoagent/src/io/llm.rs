//! Language-model backends.
//!
//! The [`Llm`] trait is the only LLM surface the agents see. Tests use scripted
//! implementations from `test_support`; the binary picks one of the backends
//! below from configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{LlmBackend, LlmConfig};
use crate::io::process::run_command_with_timeout;

/// Prompt text in, free text out.
pub trait Llm {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Failures of an LLM backend.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("LLM command failed with status {status:?}: {stderr}")]
    CommandFailed { status: Option<i32>, stderr: String },

    #[error("LLM command timed out after {0:?}")]
    CommandTimedOut(Duration),

    #[error("missing API key: environment variable {0} is not set")]
    MissingApiKey(String),
}

/// Endpoint discovery failures.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("service unavailable: no endpoint in {path} after {waited:?}")]
    ServiceUnavailable { path: PathBuf, waited: Duration },

    #[error("no LLM endpoint configured: set llm.base_url or llm.endpoint_file")]
    NotConfigured,
}

const ENDPOINT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Resolve the chat endpoint base URL.
///
/// `base_url` wins. Otherwise `endpoint_file` is polled until it exists and is
/// non-empty, or `wait` elapses.
pub fn resolve_endpoint(
    base_url: Option<&str>,
    endpoint_file: Option<&Path>,
    port: u16,
    wait: Duration,
) -> Result<String, EndpointError> {
    if let Some(url) = base_url.map(str::trim).filter(|u| !u.is_empty()) {
        return Ok(url.trim_end_matches('/').to_string());
    }
    let path = endpoint_file.ok_or(EndpointError::NotConfigured)?;

    let started = Instant::now();
    loop {
        if let Ok(contents) = fs::read_to_string(path) {
            let host = contents.trim();
            if !host.is_empty() {
                let url = endpoint_from_host(host, port);
                info!(%url, "resolved LLM endpoint from file");
                return Ok(url);
            }
        }
        let waited = started.elapsed();
        if waited >= wait {
            warn!(path = %path.display(), ?waited, "LLM endpoint file never became ready");
            return Err(EndpointError::ServiceUnavailable {
                path: path.to_path_buf(),
                waited,
            });
        }
        thread::sleep(ENDPOINT_POLL_INTERVAL.min(wait - waited));
    }
}

/// `10.0.0.5` becomes `http://10.0.0.5:<port>`; full URLs pass through.
pub fn endpoint_from_host(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else if host.contains(':') {
        format!("http://{host}")
    } else {
        format!("http://{host}:{port}")
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client (vLLM, llama.cpp server, ...).
#[derive(Debug)]
pub struct OpenAiCompatLlm {
    http: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
}

impl OpenAiCompatLlm {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        temperature: f64,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            temperature,
        })
    }
}

impl Llm for OpenAiCompatLlm {
    #[instrument(skip_all, fields(model = %self.model, prompt_len = prompt.len()))]
    fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(LlmError::from)?;

        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().unwrap_or_else(|_| "(no body)".into());
            return Err(LlmError::Api { status, message }.into());
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("failed to parse response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response has no message content".into()))?;
        debug!(reply_len = content.len(), "LLM replied");
        Ok(content)
    }
}

/// Runs an external command per prompt: prompt on stdin, reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandLlm {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandLlm {
    pub fn new(command: &[String], timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("LLM command must not be empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            output_limit_bytes,
        })
    }
}

impl Llm for CommandLlm {
    #[instrument(skip_all, fields(program = %self.program, prompt_len = prompt.len()))]
    fn complete(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run LLM command")?;

        if output.timed_out {
            return Err(LlmError::CommandTimedOut(self.timeout).into());
        }
        if !output.status.success() {
            return Err(LlmError::CommandFailed {
                status: output.status.code(),
                stderr: output.stderr_text().trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout_text())
    }
}

/// Build the configured backend.
pub fn build_llm(cfg: &LlmConfig) -> Result<Box<dyn Llm>> {
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    match cfg.backend {
        LlmBackend::Command => Ok(Box::new(CommandLlm::new(&cfg.command, timeout, 1_000_000)?)),
        LlmBackend::Openai => {
            let base_url = resolve_endpoint(
                cfg.base_url.as_deref(),
                cfg.endpoint_file.as_deref(),
                cfg.port,
                Duration::from_secs(cfg.endpoint_wait_secs),
            )?;
            let api_key = match &cfg.api_key_env {
                Some(var) => Some(
                    std::env::var(var).map_err(|_| LlmError::MissingApiKey(var.clone()))?,
                ),
                None => None,
            };
            Ok(Box::new(OpenAiCompatLlm::new(
                base_url,
                &cfg.model,
                api_key,
                cfg.temperature,
                timeout,
            )?))
        }
    }
}
