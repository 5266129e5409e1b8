use std::{collections::HashSet, sync::OnceLock};

use regex::Regex;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "before", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "his", "how", "if", "in", "into", "is", "it", "its", "more", "most",
    "no", "not", "of", "on", "or", "our", "she", "so", "such", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "those", "to", "was", "we", "were", "what",
    "when", "which", "who", "will", "with", "would", "you",
];

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}'\-]*").unwrap_or_else(|_| unreachable!())
    })
}

/// Lower-cased tokens of `text`, in order.
#[must_use]
pub fn tokens(text: &str) -> Vec<String> {
    word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().trim_matches(|c: char| c == '\'' || c == '-').to_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Distinct non-stopword tokens longer than two characters (or numeric), in first-seen order.
#[must_use]
pub fn significant_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens(text)
        .into_iter()
        .filter(|token| {
            (token.chars().count() > 2 || token.chars().all(char::is_numeric))
                && !STOPWORDS.contains(&token.as_str())
        })
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

/// Collapses runs of whitespace into single spaces.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_significant_terms() {
        let terms = significant_terms("The Eiffel Tower is 330 metres tall, and the tower is in Paris.");
        assert_eq!(terms, vec!["eiffel", "tower", "330", "metres", "tall", "paris"]);
    }

    #[test]
    fn normalizes_whitespace() {
        assert_eq!(normalize_whitespace("  a \n b\t c "), "a b c");
    }
}
