//! Bag-of-words cosine similarity used for the evaluation similarity metrics.

use std::collections::HashMap;

/// Lowercased alphanumeric/underscore tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn term_counts(text: &str) -> HashMap<String, f64> {
    let mut counts = HashMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    counts
}

/// Cosine similarity in `[0, 1]`. Either side empty yields `0.0`.
pub fn cosine(a: &str, b: &str) -> f64 {
    let left = term_counts(a);
    let right = term_counts(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let dot: f64 = left
        .iter()
        .filter_map(|(term, x)| right.get(term).map(|y| x * y))
        .sum();
    let norm = |m: &HashMap<String, f64>| m.values().map(|v| v * v).sum::<f64>().sqrt();
    let score = dot / (norm(&left) * norm(&right));
    score.clamp(0.0, 1.0)
}
