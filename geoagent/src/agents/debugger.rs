//! Debug loop: turns a failed round into correction advice and a routing hint.

use tracing::{info, instrument, warn};

use crate::agents::{DEBUG_AGENT, ask};
use crate::core::extract::{
    AGENT_CALLING_ADVICE_TAG, CODE_ADVICE_TAG, normalize_next_agent, tagged_block,
};
use crate::core::transcript::Transcript;
use crate::core::types::{ContextBundle, DebugAdvice, FileDescriptor, NextAgent, Task};
use crate::io::llm::Llm;
use crate::io::prompt::{DebugPromptInput, PromptEngine};

pub const NO_CODE_ADVICE: &str = "No correction advice found.";
pub const NO_ROUTING_ADVICE: &str = "No agent calling advice found.";

#[derive(Debug, Clone, Copy)]
pub struct DiagnoseInput<'a> {
    pub task: &'a Task,
    pub files: &'a [FileDescriptor],
    pub context: &'a ContextBundle,
    pub last_code: &'a str,
    pub last_error: &'a str,
}

pub struct Debugger<'a> {
    llm: &'a dyn Llm,
    prompts: PromptEngine,
}

impl<'a> Debugger<'a> {
    pub fn new(llm: &'a dyn Llm) -> Self {
        Self {
            llm,
            prompts: PromptEngine::new(),
        }
    }

    /// One LLM call. Never fails: a missing block yields a placeholder, and a
    /// failed call yields advice with neither block found.
    #[instrument(skip_all, fields(task = %input.task.id))]
    pub fn diagnose(&self, input: &DiagnoseInput<'_>, transcript: &mut Transcript) -> DebugAdvice {
        let reply = self
            .prompts
            .render_debug(&DebugPromptInput {
                query: &input.task.query,
                files: input.files,
                context: input.context,
                code: input.last_code,
                error: input.last_error,
            })
            .and_then(|prompt| ask(self.llm, DEBUG_AGENT, prompt, transcript));

        match reply {
            Ok(reply) => {
                let advice = parse_advice(&reply);
                info!(
                    next_agent = advice.next_agent.as_str(),
                    malformed = advice.is_malformed(),
                    "debug advice parsed"
                );
                advice
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "debug LLM call failed");
                placeholder_advice()
            }
        }
    }
}

/// Parse the two tagged blocks out of a debug reply.
pub fn parse_advice(reply: &str) -> DebugAdvice {
    let code_block = tagged_block(reply, CODE_ADVICE_TAG);
    let routing_block = tagged_block(reply, AGENT_CALLING_ADVICE_TAG);
    let next_agent = routing_block.map_or(NextAgent::None, normalize_next_agent);
    DebugAdvice {
        code_advice: code_block.unwrap_or(NO_CODE_ADVICE).to_string(),
        routing_advice: routing_block.unwrap_or(NO_ROUTING_ADVICE).to_string(),
        next_agent,
        code_block_found: code_block.is_some(),
        routing_block_found: routing_block.is_some(),
    }
}

fn placeholder_advice() -> DebugAdvice {
    DebugAdvice {
        code_advice: NO_CODE_ADVICE.to_string(),
        routing_advice: NO_ROUTING_ADVICE.to_string(),
        next_agent: NextAgent::None,
        code_block_found: false,
        routing_block_found: false,
    }
}
