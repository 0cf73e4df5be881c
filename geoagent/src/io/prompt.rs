//! Prompt rendering for every agent.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{Attempt, ContextBundle, DebugAdvice, FileDescriptor, render_file_metadata};

const CODE_GENERATION_TEMPLATE: &str = include_str!("prompts/code_generation.md");
const DEBUG_TEMPLATE: &str = include_str!("prompts/debug.md");
const EVALUATION_TEMPLATE: &str = include_str!("prompts/evaluation.md");
const FILE_SEARCH_TEMPLATE: &str = include_str!("prompts/file_search.md");
const QUERY_REWRITE_TEMPLATE: &str = include_str!("prompts/query_rewrite.md");

/// Prior attempt as shown in the code-generation prompt.
#[derive(Debug, Clone, Serialize)]
struct AttemptContext<'a> {
    class: &'static str,
    code: &'a str,
    error: &'a str,
}

impl<'a> AttemptContext<'a> {
    fn from_attempt(attempt: &'a Attempt) -> Self {
        Self {
            class: attempt.class.as_str(),
            code: attempt.code.trim(),
            error: attempt.error.trim(),
        }
    }
}

/// Inputs for one code-generation prompt.
#[derive(Debug, Clone, Copy)]
pub struct CodePromptInput<'a> {
    pub query: &'a str,
    pub files: &'a [FileDescriptor],
    pub output_dir: &'a Path,
    pub context: &'a ContextBundle,
    pub advice: Option<&'a DebugAdvice>,
    /// Every failed attempt so far, oldest first.
    pub history: &'a [Attempt],
}

/// Inputs for one debug prompt.
#[derive(Debug, Clone, Copy)]
pub struct DebugPromptInput<'a> {
    pub query: &'a str,
    pub files: &'a [FileDescriptor],
    pub context: &'a ContextBundle,
    pub code: &'a str,
    pub error: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("code_generation", CODE_GENERATION_TEMPLATE)
            .expect("code_generation template should be valid");
        env.add_template("debug", DEBUG_TEMPLATE)
            .expect("debug template should be valid");
        env.add_template("evaluation", EVALUATION_TEMPLATE)
            .expect("evaluation template should be valid");
        env.add_template("file_search", FILE_SEARCH_TEMPLATE)
            .expect("file_search template should be valid");
        env.add_template("query_rewrite", QUERY_REWRITE_TEMPLATE)
            .expect("query_rewrite template should be valid");
        Self { env }
    }

    pub fn render_code_generation(&self, input: &CodePromptInput<'_>) -> Result<String> {
        let history: Vec<AttemptContext<'_>> = input
            .history
            .iter()
            .map(AttemptContext::from_attempt)
            .collect();
        let advice = input.advice.map(|a| a.code_advice.trim()).filter(|s| !s.is_empty());
        let template = self.env.get_template("code_generation")?;
        let rendered = template.render(context! {
            query => input.query.trim(),
            file_metadata => render_file_metadata(input.files),
            output_dir => input.output_dir.display().to_string(),
            context => input.context.render(),
            advice => advice,
            history => history,
        })?;
        Ok(rendered)
    }

    pub fn render_debug(&self, input: &DebugPromptInput<'_>) -> Result<String> {
        let template = self.env.get_template("debug")?;
        let rendered = template.render(context! {
            query => input.query.trim(),
            file_metadata => render_file_metadata(input.files),
            context => input.context.render(),
            code => input.code,
            error => input.error.trim(),
        })?;
        Ok(rendered)
    }

    pub fn render_evaluation(
        &self,
        query: &str,
        files: &[FileDescriptor],
        context: &ContextBundle,
        code: &str,
    ) -> Result<String> {
        let template = self.env.get_template("evaluation")?;
        let rendered = template.render(context! {
            query => query.trim(),
            file_metadata => render_file_metadata(files),
            context => context.render(),
            code => code,
        })?;
        Ok(rendered)
    }

    pub fn render_file_search(&self, query: &str, files: &[FileDescriptor]) -> Result<String> {
        let template = self.env.get_template("file_search")?;
        let rendered = template.render(context! {
            query => query.trim(),
            file_metadata => render_file_metadata(files),
        })?;
        Ok(rendered)
    }

    pub fn render_query_rewrite(&self, query: &str) -> Result<String> {
        let template = self.env.get_template("query_rewrite")?;
        Ok(template.render(context! { query => query.trim() })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AttemptClass, ContextChunk, NextAgent};

    fn failed_attempt(ordinal: u32, error: &str) -> Attempt {
        Attempt {
            ordinal,
            code: format!("print({ordinal})"),
            stdout: String::new(),
            stderr: error.to_string(),
            class: AttemptClass::Traceback,
            error: error.to_string(),
            output_file: None,
            exit_code: Some(1),
        }
    }

    #[test]
    fn code_prompt_lists_every_prior_failure() {
        let engine = PromptEngine::new();
        let history = vec![failed_attempt(1, "first boom"), failed_attempt(2, "second boom")];
        let context = ContextBundle::default();
        let prompt = engine
            .render_code_generation(&CodePromptInput {
                query: "buffer roads",
                files: &[FileDescriptor::bare("/d/roads.shp")],
                output_dir: Path::new("/tmp/out"),
                context: &context,
                advice: None,
                history: &history,
            })
            .expect("render");
        assert!(prompt.contains("first boom"));
        assert!(prompt.contains("second boom"));
        assert!(prompt.contains("Attempt 2 (traceback)"));
        assert!(prompt.contains("/tmp/out"));
        assert!(prompt.contains("No documentation context was retrieved"));
        assert!(!prompt.contains("## Debugging advice"));
    }

    #[test]
    fn code_prompt_includes_advice() {
        let engine = PromptEngine::new();
        let context = ContextBundle::new(vec![ContextChunk {
            source: "api.md".to_string(),
            title: "Writer".to_string(),
            content: "writeAsVectorFormatV3".to_string(),
        }]);
        let advice = DebugAdvice {
            code_advice: "Use the V3 writer.".to_string(),
            routing_advice: "code_generation_expert".to_string(),
            next_agent: NextAgent::Code,
            code_block_found: true,
            routing_block_found: true,
        };
        let prompt = engine
            .render_code_generation(&CodePromptInput {
                query: "export",
                files: &[],
                output_dir: Path::new("/tmp/out"),
                context: &context,
                advice: Some(&advice),
                history: &[],
            })
            .expect("render");
        assert!(prompt.contains("## Debugging advice\nUse the V3 writer."));
        assert!(prompt.contains("# Source: api.md"));
        assert!(!prompt.contains("## Previous failed attempts"));
    }

    #[test]
    fn debug_prompt_has_all_five_fields() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_debug(&DebugPromptInput {
                query: "clip raster",
                files: &[FileDescriptor::bare("/d/dem.tif")],
                context: &ContextBundle::default(),
                code: "import qgis",
                error: "NameError: x",
            })
            .expect("render");
        for needle in ["clip raster", "/d/dem.tif", "No documentation", "import qgis", "NameError: x"] {
            assert!(prompt.contains(needle), "missing {needle}");
        }
        assert!(prompt.contains("```CODE_ADVICE"));
    }

    #[test]
    fn file_search_and_rewrite_render() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_file_search("roads", &[FileDescriptor::bare("/d/roads.shp")])
            .expect("render");
        assert!(prompt.contains("- File: /d/roads.shp"));
        let rewrite = engine.render_query_rewrite("  roads  ").expect("render");
        assert!(rewrite.contains("## Task\nroads"));
    }
}
