//! Documentation retrieval over a JSON chunk corpus.
//!
//! Ranking is lexical: a chunk scores one point per distinct query term found
//! in its title or text. Only chunks with a positive score are returned, best
//! first, ties kept in corpus order.

use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::agents::{RETRIEVAL_AGENT, Retriever, ask};
use crate::core::similarity::tokenize;
use crate::core::transcript::Transcript;
use crate::core::types::{ContextBundle, ContextChunk};
use crate::io::llm::Llm;
use crate::io::metadata::CorpusEntry;
use crate::io::prompt::PromptEngine;

/// Terms too common to carry ranking signal.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "the", "of", "to", "in", "on", "for", "by", "with", "from", "is", "it",
    "as", "at", "or", "be", "that", "this", "all", "into",
];

pub struct CorpusRetriever<'a> {
    corpus: Vec<CorpusEntry>,
    /// When set, the query is rewritten by the LLM before ranking.
    rewriter: Option<&'a dyn Llm>,
    prompts: PromptEngine,
}

impl<'a> CorpusRetriever<'a> {
    pub fn new(corpus: Vec<CorpusEntry>) -> Self {
        Self {
            corpus,
            rewriter: None,
            prompts: PromptEngine::new(),
        }
    }

    pub fn with_rewriter(mut self, llm: &'a dyn Llm) -> Self {
        self.rewriter = Some(llm);
        self
    }

    fn search_query(&self, query: &str, transcript: &mut Transcript) -> Result<String> {
        let Some(llm) = self.rewriter else {
            return Ok(query.to_string());
        };
        let prompt = self.prompts.render_query_rewrite(query)?;
        match ask(llm, RETRIEVAL_AGENT, prompt, transcript) {
            Ok(rewritten) if !rewritten.trim().is_empty() => {
                debug!(rewritten = rewritten.trim(), "rewrote retrieval query");
                Ok(rewritten.trim().to_string())
            }
            Ok(_) => Ok(query.to_string()),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "query rewrite failed, using original query");
                Ok(query.to_string())
            }
        }
    }
}

impl Retriever for CorpusRetriever<'_> {
    #[instrument(skip_all, fields(k, corpus = self.corpus.len()))]
    fn retrieve(
        &self,
        query: &str,
        k: usize,
        transcript: &mut Transcript,
    ) -> Result<ContextBundle> {
        let search = self.search_query(query, transcript)?;
        let bundle = rank(&self.corpus, &search, k);
        if bundle.is_empty() {
            debug!("no documentation chunk matched the query");
        }
        Ok(bundle)
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|term| !STOPWORDS.contains(&term.as_str()))
        .filter(|term| seen.insert(term.clone()))
        .collect()
}

/// Top `k` chunks by distinct-term overlap.
pub fn rank(corpus: &[CorpusEntry], query: &str, k: usize) -> ContextBundle {
    let terms = query_terms(query);
    if terms.is_empty() || k == 0 {
        return ContextBundle::default();
    }

    let mut scored: Vec<(usize, &CorpusEntry)> = corpus
        .iter()
        .filter_map(|entry| {
            let words: HashSet<String> = tokenize(&entry.title)
                .into_iter()
                .chain(tokenize(&entry.text))
                .collect();
            let score = terms.iter().filter(|term| words.contains(*term)).count();
            (score > 0).then_some((score, entry))
        })
        .collect();
    // sort_by is stable, so equal scores keep corpus order.
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    ContextBundle::new(
        scored
            .into_iter()
            .take(k)
            .map(|(_, entry)| ContextChunk {
                source: entry.file.clone(),
                title: entry.title.clone(),
                content: entry.text.clone(),
            })
            .collect(),
    )
}
