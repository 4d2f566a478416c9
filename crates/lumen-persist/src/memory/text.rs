// Minimal full-text scoring used by the in-memory stores

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "for", "from", "how", "in", "is", "it",
    "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where", "which", "who",
    "why", "with", "you",
];

/// Lowercased alphanumeric terms, stopwords removed
pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Fraction of distinct query terms present in `doc`, in `[0, 1]`
pub fn match_score(query_terms: &[String], doc: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let doc_terms: HashSet<String> = terms(doc).into_iter().collect();
    let distinct: HashSet<&String> = query_terms.iter().collect();
    let hits = distinct.iter().filter(|t| doc_terms.contains(**t)).count();
    hits as f32 / distinct.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms_drop_stopwords_and_punctuation() {
        assert_eq!(terms("What is the Fourier transform?"), vec!["fourier", "transform"]);
    }

    #[test]
    fn test_match_score_fraction() {
        let q = terms("fourier transform basics");
        assert!((match_score(&q, "The Fourier transform of a signal") - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(match_score(&q, "unrelated"), 0.0);
        assert_eq!(match_score(&[], "anything"), 0.0);
    }
}
