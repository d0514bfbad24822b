//! Default keyword extraction (SPEC_FULL §11 supplement).
//!
//! A stopword-filtered tokenizer, not a search engine: it exists so
//! records get a reasonable `keywords` field when extraction doesn't
//! already supply one, feeding the connection graph's Jaccard fallback
//! and the predicate grammar's `keywords.includes(...)`. Non-goal in the
//! spec is full-text search; this stays well short of that.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with", "i", "you", "he", "she", "we",
    "do", "does", "did", "have", "has", "had", "can", "could", "would", "should", "its",
];

/// Extracts up to `max_keywords` distinct lowercase tokens from `text`,
/// longer than three characters and not in the stopword list, in order of
/// first appearance.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let stopwords: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if keywords.len() >= max_keywords {
            break;
        }
        let token = raw.to_lowercase();
        if token.len() <= 3 || stopwords.contains(token.as_str()) {
            continue;
        }
        if seen.insert(token.clone()) {
            keywords.push(token);
        }
    }

    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_stopwords_and_short_tokens() {
        let keywords = extract_keywords("The quick fox and the lazy dog sat at a mat", 10);
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"and".to_string()));
        assert!(keywords.contains(&"quick".to_string()));
    }

    #[test]
    fn deduplicates_and_respects_max() {
        let keywords = extract_keywords("rust rust rust async async tokio futures channels", 3);
        assert_eq!(keywords.len(), 3);
        assert_eq!(keywords[0], "rust");
    }
}
