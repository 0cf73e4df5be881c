//! Loading of the file metadata set and the documentation corpus.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::FileDescriptor;

/// One documentation chunk as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub file: String,
    #[serde(default)]
    pub title: String,
    pub text: String,
}

/// Read the JSON array of file descriptors. A missing path yields an empty set.
pub fn load_file_metadata(path: Option<&Path>) -> Result<Vec<FileDescriptor>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let files: Vec<FileDescriptor> =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(count = files.len(), path = %path.display(), "loaded file metadata");
    Ok(files)
}

/// Read the JSON corpus. A missing path yields an empty corpus.
pub fn load_corpus(path: Option<&Path>) -> Result<Vec<CorpusEntry>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let entries: Vec<CorpusEntry> =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(count = entries.len(), path = %path.display(), "loaded corpus");
    Ok(entries)
}
