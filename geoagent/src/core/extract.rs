//! Parsing of LLM replies and script output.
//!
//! Every parser here has a defined fallback: a missing block is never an
//! error, it yields the whole reply, a placeholder or `None`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::types::NextAgent;

pub const CODE_ADVICE_TAG: &str = "CODE_ADVICE";
pub const AGENT_CALLING_ADVICE_TAG: &str = "AGENT_CALLING_ADVICE";
pub const FILEPATHS_TAG: &str = "Filepaths";

static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z_]+)[ \t]*\r?\n?(.*?)```").expect("fenced block regex")
});

static SENTINEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"##RESULT##\s*(\{.*\})").expect("sentinel regex"));

/// Return the trimmed body of the first fenced block labelled `tag`.
pub fn tagged_block<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    FENCED_RE
        .captures_iter(text)
        .find(|caps| caps.get(1).is_some_and(|m| m.as_str() == tag))
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().trim())
}

/// Candidate script from a code-generation reply: the ```` ```python ```` block, or
/// the whole reply when no block is present.
pub fn extract_code(reply: &str) -> String {
    tagged_block(reply, "python")
        .unwrap_or_else(|| reply.trim())
        .to_string()
}

/// Payload of the block labelled `tag`, or the whole reply.
pub fn block_or_whole<'a>(reply: &'a str, tag: &str) -> &'a str {
    tagged_block(reply, tag).unwrap_or_else(|| reply.trim())
}

/// Path claimed by the first `##RESULT## {"output_file": ...}` line.
///
/// Missing sentinel, malformed JSON, a missing key or an empty value all yield
/// `None`.
pub fn parse_sentinel(stdout: &str) -> Option<String> {
    let caps = SENTINEL_RE.captures(stdout)?;
    let payload: Value = serde_json::from_str(caps.get(1)?.as_str()).ok()?;
    payload
        .get("output_file")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string)
}

/// Whether stdout carries any sentinel line at all.
pub fn has_sentinel(stdout: &str) -> bool {
    stdout.contains("##RESULT##")
}

/// Case-insensitive traceback marker check on stderr.
pub fn has_traceback(stderr: &str) -> bool {
    stderr.to_lowercase().contains("traceback")
}

const AGENT_ALIASES: [(&str, NextAgent); 3] = [
    ("file_search_expert", NextAgent::File),
    ("rag_expert", NextAgent::Retrieval),
    ("code_generation_expert", NextAgent::Code),
];

/// Normalize free routing text to one of the four recognized tokens.
///
/// Exact tokens and agent names map directly. Prose that names exactly one
/// agent maps to that agent. Everything else maps to [`NextAgent::None`].
pub fn normalize_next_agent(raw: &str) -> NextAgent {
    let token = raw
        .trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '.')
        .trim()
        .to_lowercase();

    match token.as_str() {
        "file" | "files" | "file_search" | "file_search_expert" => return NextAgent::File,
        "retrieval" | "rag" | "rag_expert" | "context" => return NextAgent::Retrieval,
        "code" | "code_generation" | "code_generation_expert" => return NextAgent::Code,
        "none" => return NextAgent::None,
        _ => {}
    }

    let mut named = AGENT_ALIASES
        .iter()
        .filter(|(alias, _)| token.contains(alias))
        .map(|(_, agent)| *agent);
    match (named.next(), named.next()) {
        (Some(agent), None) => agent,
        _ => NextAgent::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_block() {
        let reply = "Here you go:\n```python\nprint('hi')\n```\nthanks";
        assert_eq!(extract_code(reply), "print('hi')");
    }

    #[test]
    fn whole_reply_is_code_without_block() {
        let reply = "  import os\nprint(os.getcwd())\n";
        assert_eq!(extract_code(reply), "import os\nprint(os.getcwd())");
    }

    #[test]
    fn ignores_blocks_with_other_labels() {
        let reply = "```bash\nls\n```\n```python\nx = 1\n```";
        assert_eq!(extract_code(reply), "x = 1");
    }

    #[test]
    fn reads_tagged_advice_blocks() {
        let reply = "```CODE_ADVICE\nUse writeAsVectorFormatV3.\n```\n\n```AGENT_CALLING_ADVICE\nrag_expert\n```";
        assert_eq!(
            tagged_block(reply, CODE_ADVICE_TAG),
            Some("Use writeAsVectorFormatV3.")
        );
        assert_eq!(tagged_block(reply, AGENT_CALLING_ADVICE_TAG), Some("rag_expert"));
    }

    #[test]
    fn sentinel_parses_output_file() {
        let stdout = "loading\n##RESULT## {\"output_file\": \"/tmp/out.geojson\"}\n";
        assert_eq!(parse_sentinel(stdout), Some("/tmp/out.geojson".to_string()));
    }

    #[test]
    fn sentinel_missing_or_malformed_is_none() {
        assert_eq!(parse_sentinel("no marker here"), None);
        assert_eq!(parse_sentinel("##RESULT## {not json}"), None);
        assert_eq!(parse_sentinel("##RESULT## {\"other\": 1}"), None);
        assert_eq!(parse_sentinel("##RESULT## {\"output_file\": \"\"}"), None);
        assert!(has_sentinel("##RESULT## {not json}"));
    }

    #[test]
    fn traceback_check_ignores_case() {
        assert!(has_traceback("Traceback (most recent call last):"));
        assert!(has_traceback("TRACEBACK"));
        assert!(!has_traceback("warning: deprecated"));
    }

    #[test]
    fn routing_tokens_normalize() {
        assert_eq!(normalize_next_agent("file"), NextAgent::File);
        assert_eq!(normalize_next_agent(" `rag_expert` "), NextAgent::Retrieval);
        assert_eq!(normalize_next_agent("Retrieval"), NextAgent::Retrieval);
        assert_eq!(normalize_next_agent("code."), NextAgent::Code);
        assert_eq!(normalize_next_agent("none"), NextAgent::None);
    }

    #[test]
    fn routing_prose_naming_one_agent_maps_to_it() {
        let raw = "Documentation was insufficient; recommend `rag_expert` to fetch writer docs.";
        assert_eq!(normalize_next_agent(raw), NextAgent::Retrieval);
    }

    #[test]
    fn routing_unrecognized_or_ambiguous_maps_to_none() {
        assert_eq!(normalize_next_agent("No agent calling advice found."), NextAgent::None);
        assert_eq!(normalize_next_agent("try harder"), NextAgent::None);
        assert_eq!(
            normalize_next_agent("either file_search_expert or rag_expert"),
            NextAgent::None
        );
    }
}
