//! Role-specific agents over the shared LLM.
//!
//! File lookup, retrieval and evaluation sit behind traits so the supervisor
//! can be driven by fakes. The code loop and the debugger are concrete: their
//! only external seams are [`Llm`] and [`ScriptRunner`](crate::io::script::ScriptRunner).

pub mod coder;
pub mod debugger;
pub mod evaluator;
pub mod file_search;
pub mod retrieval;

use anyhow::Result;

use crate::core::transcript::{Message, Transcript};
use crate::core::types::{ContextBundle, Evaluation, FileDescriptor};
use crate::io::llm::Llm;

pub const FILE_SEARCH_AGENT: &str = "file_search_expert";
pub const RETRIEVAL_AGENT: &str = "rag_expert";
pub const CODE_AGENT: &str = "code_generation_expert";
pub const DEBUG_AGENT: &str = "debug_expert";
pub const EVALUATION_AGENT: &str = "evaluation_expert";

/// A tool returned a response outside its contract. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{adapter} returned a malformed response: {detail}")]
pub struct AdapterContractError {
    pub adapter: &'static str,
    pub detail: String,
}

impl AdapterContractError {
    pub fn new(adapter: &'static str, detail: impl Into<String>) -> Self {
        Self {
            adapter,
            detail: detail.into(),
        }
    }
}

/// `(query) -> ordered matched descriptors`, possibly empty.
pub trait FileLookup {
    fn lookup(&self, query: &str, transcript: &mut Transcript) -> Result<Vec<FileDescriptor>>;
}

/// `(query, k) -> ContextBundle`, possibly empty. Zero matches is not an error.
pub trait Retriever {
    fn retrieve(&self, query: &str, k: usize, transcript: &mut Transcript)
    -> Result<ContextBundle>;
}

pub struct EvaluationInput<'a> {
    pub query: &'a str,
    pub files: &'a [FileDescriptor],
    pub context: &'a ContextBundle,
    pub code: &'a str,
}

pub trait Evaluator {
    fn evaluate(&self, input: &EvaluationInput<'_>, transcript: &mut Transcript)
    -> Result<Evaluation>;
}

/// Send `prompt` on behalf of `agent`, recording both sides in the transcript.
pub(crate) fn ask(
    llm: &dyn Llm,
    agent: &str,
    prompt: String,
    transcript: &mut Transcript,
) -> Result<String> {
    let reply = llm.complete(&prompt);
    transcript.push(Message::agent_prompt(agent, prompt));
    let reply = reply?;
    transcript.push(Message::assistant(agent, reply.clone()));
    Ok(reply)
}
