//! Quality evaluation of a finished run.

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::agents::{AdapterContractError, EVALUATION_AGENT, EvaluationInput, Evaluator, ask};
use crate::core::extract::block_or_whole;
use crate::core::similarity::cosine;
use crate::core::transcript::Transcript;
use crate::core::types::{DimensionScore, Evaluation, Similarity, render_file_metadata};
use crate::io::llm::Llm;
use crate::io::prompt::PromptEngine;

const EVALUATION_SCHEMA: &str = include_str!("../../schemas/evaluation.schema.json");

#[derive(Debug, Deserialize)]
struct ScoredReply {
    context_relevance: DimensionScore,
    context_coverage: DimensionScore,
    code_accuracy: DimensionScore,
    code_context_consistency: DimensionScore,
}

pub struct LlmEvaluator<'a> {
    llm: &'a dyn Llm,
    prompts: PromptEngine,
    validator: Validator,
}

impl<'a> LlmEvaluator<'a> {
    pub fn new(llm: &'a dyn Llm) -> Result<Self> {
        let schema: Value =
            serde_json::from_str(EVALUATION_SCHEMA).context("parse evaluation schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile evaluation schema")?;
        Ok(Self {
            llm,
            prompts: PromptEngine::new(),
            validator,
        })
    }

    fn parse_scores(&self, reply: &str) -> Result<ScoredReply, AdapterContractError> {
        let payload = block_or_whole(reply, "json");
        let value: Value = serde_json::from_str(payload).map_err(|err| {
            AdapterContractError::new(EVALUATION_AGENT, format!("reply is not JSON: {err}"))
        })?;
        let violations: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !violations.is_empty() {
            return Err(AdapterContractError::new(
                EVALUATION_AGENT,
                format!("schema validation failed: {}", violations.join("; ")),
            ));
        }
        serde_json::from_value(value)
            .map_err(|err| AdapterContractError::new(EVALUATION_AGENT, err.to_string()))
    }
}

impl Evaluator for LlmEvaluator<'_> {
    #[instrument(skip_all)]
    fn evaluate(
        &self,
        input: &EvaluationInput<'_>,
        transcript: &mut Transcript,
    ) -> Result<Evaluation> {
        let prompt =
            self.prompts
                .render_evaluation(input.query, input.files, input.context, input.code)?;
        let reply = ask(self.llm, EVALUATION_AGENT, prompt, transcript)?;
        let scores = self.parse_scores(&reply)?;
        let similarity = similarity_metrics(input);
        info!(
            code_accuracy = scores.code_accuracy.score,
            context_to_code = similarity.context_to_code,
            "evaluation finished"
        );
        Ok(Evaluation {
            context_relevance: scores.context_relevance,
            context_coverage: scores.context_coverage,
            code_accuracy: scores.code_accuracy,
            code_context_consistency: scores.code_context_consistency,
            similarity,
        })
    }
}

/// Context-to-code and full-task-to-code cosine similarity.
pub fn similarity_metrics(input: &EvaluationInput<'_>) -> Similarity {
    let context_text: String = input
        .context
        .chunks
        .iter()
        .map(|chunk| format!("{}\n{}", chunk.title, chunk.content))
        .collect::<Vec<_>>()
        .join("\n");
    let full_task = format!(
        "{}\n{}\n{}",
        input.query,
        render_file_metadata(input.files),
        context_text
    );
    Similarity {
        context_to_code: cosine(&context_text, input.code),
        full_task_to_code: cosine(&full_task, input.code),
    }
}
