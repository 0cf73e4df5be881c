//! File lookup: the LLM picks input files from the metadata set.

use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::agents::{AdapterContractError, FILE_SEARCH_AGENT, FileLookup, ask};
use crate::core::extract::{FILEPATHS_TAG, block_or_whole};
use crate::core::transcript::Transcript;
use crate::core::types::FileDescriptor;
use crate::io::llm::Llm;
use crate::io::prompt::PromptEngine;

pub struct LlmFileLookup<'a> {
    llm: &'a dyn Llm,
    catalog: Vec<FileDescriptor>,
    prompts: PromptEngine,
}

impl<'a> LlmFileLookup<'a> {
    pub fn new(llm: &'a dyn Llm, catalog: Vec<FileDescriptor>) -> Self {
        Self {
            llm,
            catalog,
            prompts: PromptEngine::new(),
        }
    }
}

impl FileLookup for LlmFileLookup<'_> {
    #[instrument(skip_all, fields(catalog = self.catalog.len()))]
    fn lookup(&self, query: &str, transcript: &mut Transcript) -> Result<Vec<FileDescriptor>> {
        if self.catalog.is_empty() {
            debug!("no file metadata loaded, skipping lookup");
            return Ok(Vec::new());
        }
        let prompt = self.prompts.render_file_search(query, &self.catalog)?;
        let reply = ask(self.llm, FILE_SEARCH_AGENT, prompt, transcript)?;
        let paths = parse_filepaths(&reply)?;
        Ok(match_catalog(&self.catalog, &paths))
    }
}

/// JSON string array from the ```` ```Filepaths ```` block, or from the whole reply.
pub fn parse_filepaths(reply: &str) -> Result<Vec<String>, AdapterContractError> {
    let payload = block_or_whole(reply, FILEPATHS_TAG);
    serde_json::from_str::<Vec<String>>(payload).map_err(|err| {
        AdapterContractError::new(
            FILE_SEARCH_AGENT,
            format!("expected a JSON array of paths: {err}"),
        )
    })
}

/// Map selected paths back to their descriptors, keeping reply order.
///
/// Unknown paths are dropped; repeated paths keep their first occurrence.
pub fn match_catalog(catalog: &[FileDescriptor], paths: &[String]) -> Vec<FileDescriptor> {
    let mut seen = HashSet::new();
    let mut matched = Vec::new();
    for path in paths {
        let path = path.trim();
        if !seen.insert(path.to_string()) {
            continue;
        }
        match catalog.iter().find(|file| file.path == path) {
            Some(file) => matched.push(file.clone()),
            None => warn!(path, "selected path is not in the file metadata set"),
        }
    }
    matched
}
