//! Citation markers and verbatim-quote verification for assistant replies

use std::collections::HashSet;

use lazy_static::lazy_static;
use lumen_types::{EvidenceCitation, EvidenceSource};
use regex::Regex;

lazy_static! {
    static ref SOURCE_MARKER: Regex =
        Regex::new(r"\[\[?source:\s*([^\s\[\]]+)\s*\]\]?").unwrap();
    static ref QUOTED: Regex = Regex::new(r#""([^"]+)"|“([^”]+)”"#).unwrap();
}

/// Cited ids in first-seen order
pub fn parse_markers(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    SOURCE_MARKER
        .captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Citations for markers that name a selected evidence source; unknown ids are dropped
pub fn build_citations(content: &str, sources: &[EvidenceSource]) -> Vec<EvidenceCitation> {
    parse_markers(content)
        .iter()
        .filter_map(|id| sources.iter().find(|s| &s.id == id))
        .map(EvidenceCitation::from)
        .collect()
}

fn tag(source: &EvidenceSource) -> String {
    match (&source.file_name, source.page, source.start_sec) {
        (Some(file), Some(page), _) => format!("[{}, p. {}]", file, page),
        (Some(file), None, Some(sec)) => format!("[{} @ {}]", file, format_timestamp(sec)),
        _ => format!("[{}]", source.label),
    }
}

fn format_timestamp(sec: f64) -> String {
    let total = sec.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

/// Replace markers with readable tags; markers naming unknown sources are removed
pub fn rewrite_markers(content: &str, sources: &[EvidenceSource]) -> String {
    let rewritten = SOURCE_MARKER.replace_all(content, |caps: &regex::Captures| {
        let id = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        sources
            .iter()
            .find(|s| s.id == id)
            .map(tag)
            .unwrap_or_default()
    });
    collapse_spaces(&rewritten)
}

fn strip_markers(content: &str) -> String {
    SOURCE_MARKER.replace_all(content, "").into_owned()
}

fn collapse_spaces(text: &str) -> String {
    text.lines()
        .map(|line| {
            let mut out = String::with_capacity(line.len());
            let mut prev_space = false;
            for ch in line.chars() {
                if ch == ' ' {
                    if !prev_space {
                        out.push(ch);
                    }
                    prev_space = true;
                } else {
                    out.push(ch);
                    prev_space = false;
                }
            }
            out.trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Case-folded, whitespace-collapsed form used for quote matching
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Quoted spans whose normalized length is at least `min_chars`
pub fn extract_quotes(content: &str, min_chars: usize) -> Vec<String> {
    let content = strip_markers(content);
    QUOTED
        .captures_iter(&content)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| normalize(q).chars().count() >= min_chars)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteCheck {
    pub quotes: usize,
    pub unverified: Vec<String>,
}

impl QuoteCheck {
    pub fn verified(&self) -> bool {
        self.unverified.is_empty()
    }
}

/// Every quote must appear, normalized, inside at least one source text
pub fn verify_quotes(content: &str, sources: &[EvidenceSource], min_chars: usize) -> QuoteCheck {
    let haystacks: Vec<String> = sources.iter().map(|s| normalize(&s.text)).collect();
    let quotes = extract_quotes(content, min_chars);
    let unverified = quotes
        .iter()
        .filter(|q| {
            let needle = normalize(q);
            !haystacks.iter().any(|h| h.contains(&needle))
        })
        .cloned()
        .collect();
    QuoteCheck {
        quotes: quotes.len(),
        unverified,
    }
}

/// The stored reply: markers rewritten to tags, and the quote check run on those exact bytes
pub fn finalize_reply(content: &str, sources: &[EvidenceSource], min_chars: usize) -> (String, QuoteCheck) {
    let rewritten = rewrite_markers(content, sources);
    let check = verify_quotes(&rewritten, sources, min_chars);
    (rewritten, check)
}

/// Sources rendered for the quote repair prompt
pub fn render_sources(sources: &[EvidenceSource]) -> String {
    let mut out = String::new();
    for source in sources {
        out.push_str(&format!("[source:{}] {}\n{}\n\n", source.id, source.label, source.text.trim()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_types::EvidenceKind;

    fn sources() -> Vec<EvidenceSource> {
        let mut chunk = EvidenceSource::new(
            "chunk:1",
            EvidenceKind::MaterialChunk,
            "notes.pdf",
            "A monad is a monoid in the category of endofunctors.",
        );
        chunk.file_name = Some("notes.pdf".into());
        chunk.page = Some(4);
        vec![
            EvidenceSource::new("doc:a", EvidenceKind::Doc, "Path overview", "Units: Ownership, Borrowing"),
            chunk,
        ]
    }

    #[test]
    fn test_parse_markers_dedups_in_order() {
        let ids = parse_markers("x [[source:doc:a]] y [[source:chunk:1]] z [[source:doc:a]]");
        assert_eq!(ids, vec!["doc:a".to_string(), "chunk:1".to_string()]);
    }

    #[test]
    fn test_markers_accept_dotted_block_ids() {
        let ids = parse_markers("see [[source:block:7f3a:intro.v2]] and [source:chunk:1].");
        assert_eq!(ids, vec!["block:7f3a:intro.v2".to_string(), "chunk:1".to_string()]);

        let dotted = EvidenceSource::new("block:7f3a:intro.v2", EvidenceKind::UnitBlock, "Intro block", "Welcome.");
        let out = rewrite_markers("Start here [[source:block:7f3a:intro.v2]].", &[dotted]);
        assert_eq!(out, "Start here [Intro block].");
    }

    #[test]
    fn test_citations_limited_to_known_sources() {
        let cites = build_citations("see [[source:doc:a]] and [[source:doc:zzz]]", &sources());
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].source_id, "doc:a");
    }

    #[test]
    fn test_rewrite_uses_file_and_page() {
        let out = rewrite_markers("Defined here [[source:chunk:1]] and [[source:nope]].", &sources());
        assert_eq!(out, "Defined here [notes.pdf, p. 4] and .");
    }

    #[test]
    fn test_quote_verification_normalizes() {
        let content = r#"The file says "a MONAD is a monoid   in the category" [[source:chunk:1]]."#;
        let check = verify_quotes(content, &sources(), 6);
        assert_eq!(check.quotes, 1);
        assert!(check.verified());
    }

    #[test]
    fn test_unmatched_quote_fails() {
        let check = verify_quotes(r#"It says "monads are burritos""#, &sources(), 6);
        assert!(!check.verified());
        assert_eq!(check.unverified, vec!["monads are burritos".to_string()]);
    }

    #[test]
    fn test_quote_split_by_a_marker_is_checked_after_rewrite() {
        let mut all = sources();
        all.push(EvidenceSource::new(
            "doc:b",
            EvidenceKind::Doc,
            "Moves",
            "Ownership moves the value into the callee.",
        ));
        let content = r#"It says "Ownership moves [[source:doc:b]] the value into the callee"."#;
        assert!(verify_quotes(content, &all, 6).verified());

        let (stored, check) = finalize_reply(content, &all, 6);
        assert_eq!(stored, r#"It says "Ownership moves [Moves] the value into the callee"."#);
        assert!(!check.verified());
    }

    #[test]
    fn test_short_quotes_ignored() {
        assert!(extract_quotes(r#"the "key" word"#, 6).is_empty());
        assert_eq!(extract_quotes("“Ownership, Borrowing”", 6).len(), 1);
    }
}
