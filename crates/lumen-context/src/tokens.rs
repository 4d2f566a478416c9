use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::error::{ContextError, Result};

/// Approximate token counting for budget enforcement
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Longest prefix of `text` that fits in `budget` tokens, cut on a char boundary
    fn trim_to(&self, text: &str, budget: usize) -> String {
        if self.count(text) <= budget {
            return text.to_string();
        }
        let chars: Vec<char> = text.chars().collect();
        let (mut lo, mut hi) = (0usize, chars.len());
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let candidate: String = chars[..mid].iter().collect();
            if self.count(&candidate) <= budget {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        chars[..lo].iter().collect()
    }
}

/// About four characters per token
#[derive(Debug, Clone, Copy, Default)]
pub struct CharsEstimator;

impl TokenEstimator for CharsEstimator {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    fn trim_to(&self, text: &str, budget: usize) -> String {
        text.chars().take(budget.saturating_mul(4)).collect()
    }
}

/// Exact counts with the `cl100k_base` encoding
pub struct Cl100kEstimator {
    bpe: CoreBPE,
}

impl Cl100kEstimator {
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base().map_err(|e| ContextError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenEstimator for Cl100kEstimator {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    #[default]
    Chars,
    Cl100k,
}

impl TokenizerKind {
    pub fn build(self) -> Result<Arc<dyn TokenEstimator>> {
        Ok(match self {
            TokenizerKind::Chars => Arc::new(CharsEstimator),
            TokenizerKind::Cl100k => Arc::new(Cl100kEstimator::new()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chars_estimator_rounds_up() {
        assert_eq!(CharsEstimator.count(""), 0);
        assert_eq!(CharsEstimator.count("abc"), 1);
        assert_eq!(CharsEstimator.count("abcdefghi"), 3);
    }

    #[test]
    fn test_trim_respects_budget() {
        let text = "x".repeat(100);
        let trimmed = CharsEstimator.trim_to(&text, 5);
        assert_eq!(trimmed.len(), 20);
        assert_eq!(CharsEstimator.trim_to("short", 5), "short");
    }

    #[test]
    fn test_cl100k_counts_words() {
        let est = Cl100kEstimator::new().unwrap();
        let n = est.count("hello world");
        assert!(n >= 2 && n <= 3);
        let trimmed = est.trim_to("one two three four five six", 3);
        assert!(est.count(&trimmed) <= 3);
    }
}
