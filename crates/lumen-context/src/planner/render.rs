use std::collections::HashSet;

use lumen_types::{ChatMessage, EvidenceSource, MessageRole};
use serde::Serialize;

use crate::planner::budget::Lane;
use crate::tokens::TokenEstimator;

/// One renderable entry of a lane, with the evidence it contributes
pub(crate) struct LaneItem {
    pub text: String,
    pub evidence: Option<EvidenceSource>,
}

impl LaneItem {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            evidence: None,
        }
    }

    pub fn sourced(text: impl Into<String>, evidence: EvidenceSource) -> Self {
        Self {
            text: text.into(),
            evidence: Some(evidence),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneUsage {
    pub lane: Lane,
    pub budget: usize,
    pub used: usize,
    pub items: usize,
}

/// Accumulates labeled context sections within per-lane token budgets
pub(crate) struct PromptBuilder<'a> {
    tokens: &'a dyn TokenEstimator,
    sections: Vec<String>,
    evidence: Vec<EvidenceSource>,
    seen: HashSet<String>,
    usage: Vec<LaneUsage>,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(tokens: &'a dyn TokenEstimator) -> Self {
        Self {
            tokens,
            sections: Vec::new(),
            evidence: Vec::new(),
            seen: HashSet::new(),
            usage: Vec::new(),
        }
    }

    /// Render `items` in order until the budget runs out; the last item may be cut.
    /// Returns how many items made it in.
    pub fn section(&mut self, lane: Lane, title: &str, items: Vec<LaneItem>, budget: usize) -> usize {
        if budget == 0 || items.is_empty() {
            return 0;
        }
        let header = format!("## {}\n", title);
        let mut remaining = budget.saturating_sub(self.tokens.count(&header));
        let mut body = String::new();
        let mut included = 0;

        for item in items {
            let text = item.text.trim();
            if text.is_empty() {
                continue;
            }
            if remaining == 0 {
                break;
            }
            let cost = self.tokens.count(text) + 1;
            let rendered = if cost <= remaining {
                remaining -= cost;
                text.to_string()
            } else {
                let cut = self.tokens.trim_to(text, remaining.saturating_sub(1));
                remaining = 0;
                if cut.trim().is_empty() {
                    break;
                }
                format!("{} [...]", cut.trim_end())
            };
            body.push_str(&rendered);
            body.push_str("\n\n");
            included += 1;
            if let Some(source) = item.evidence {
                if self.seen.insert(source.id.clone()) {
                    self.evidence.push(source);
                }
            }
        }

        if included > 0 {
            let section = format!("{}{}", header, body.trim_end());
            self.usage.push(LaneUsage {
                lane,
                budget,
                used: self.tokens.count(&section),
                items: included,
            });
            self.sections.push(section);
        }
        included
    }

    pub fn finish(self) -> (String, Vec<EvidenceSource>, Vec<LaneUsage>) {
        (self.sections.join("\n\n"), self.evidence, self.usage)
    }
}

fn speaker(message: &ChatMessage) -> &'static str {
    match message.role {
        MessageRole::User => "User",
        MessageRole::Assistant => "Assistant",
    }
}

/// Most recent messages that fit in `budget`, oldest first
pub(crate) fn hot_window_items(
    messages: &[ChatMessage],
    tokens: &dyn TokenEstimator,
    budget: usize,
) -> Vec<LaneItem> {
    let mut picked = Vec::new();
    let mut remaining = budget;
    for message in messages.iter().rev() {
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        let line = format!("{}: {}", speaker(message), content);
        let cost = tokens.count(&line) + 1;
        if cost > remaining {
            break;
        }
        remaining -= cost;
        picked.push(LaneItem::plain(line));
    }
    picked.reverse();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharsEstimator;
    use lumen_types::EvidenceKind;

    #[test]
    fn test_section_respects_budget_and_collects_evidence() {
        let est = CharsEstimator;
        let mut builder = PromptBuilder::new(&est);
        let items = vec![
            LaneItem::sourced("a".repeat(40), EvidenceSource::new("doc:1", EvidenceKind::Doc, "one", "a")),
            LaneItem::sourced("b".repeat(400), EvidenceSource::new("doc:2", EvidenceKind::Doc, "two", "b")),
            LaneItem::sourced("c".repeat(40), EvidenceSource::new("doc:3", EvidenceKind::Doc, "three", "c")),
        ];
        let included = builder.section(Lane::Retrieval, "Retrieved", items, 40);
        assert_eq!(included, 2);
        let (text, evidence, usage) = builder.finish();
        assert!(text.starts_with("## Retrieved"));
        assert!(text.contains("[...]"));
        assert_eq!(evidence.len(), 2);
        assert!(usage[0].used <= 40 + 2);
    }

    #[test]
    fn test_zero_budget_renders_nothing() {
        let est = CharsEstimator;
        let mut builder = PromptBuilder::new(&est);
        assert_eq!(builder.section(Lane::Graph, "Graph", vec![LaneItem::plain("x")], 0), 0);
        assert!(builder.finish().0.is_empty());
    }
}
