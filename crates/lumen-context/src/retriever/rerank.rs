use std::collections::HashMap;

use lumen_llm::{GenerateOptions, JsonRequest, JsonSchema, LlmClient};
use serde::Deserialize;
use serde_json::json;

use crate::error::Result;
use crate::prompts::RERANK_SYSTEM_PROMPT;

const PASSAGE_CHARS: usize = 700;

pub fn rerank_schema() -> JsonSchema {
    JsonSchema::new(
        "rerank",
        json!({
            "type": "object",
            "properties": {
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "score": { "type": "number", "minimum": 0, "maximum": 100 }
                        },
                        "required": ["id", "score"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["results"],
            "additionalProperties": false
        }),
    )
}

#[derive(Debug, Deserialize)]
struct RerankOutput {
    results: Vec<RerankScore>,
}

#[derive(Debug, Deserialize)]
struct RerankScore {
    id: String,
    score: f32,
}

/// Score `(id, text)` candidates against `query` in batches; returns id → 0..100
///
/// Any failed batch fails the whole rerank so callers fall back to raw scores
/// instead of mixing two scales.
pub async fn rerank(
    llm: &dyn LlmClient,
    query: &str,
    candidates: &[(String, String)],
    batch_size: usize,
    model: Option<&str>,
) -> Result<HashMap<String, f32>> {
    let mut scores = HashMap::with_capacity(candidates.len());
    for batch in candidates.chunks(batch_size.max(1)) {
        let passages = batch
            .iter()
            .map(|(id, text)| {
                let snippet: String = text.chars().take(PASSAGE_CHARS).collect();
                format!("<passage id=\"{}\">\n{}\n</passage>", id, snippet)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!("Query: {}\n\nPassages:\n{}", query, passages);

        let mut options = GenerateOptions::new().temperature(0.0);
        if let Some(model) = model {
            options = options.model(model);
        }
        let request = JsonRequest::new(RERANK_SYSTEM_PROMPT, user, rerank_schema()).with_options(options);
        let value = llm.generate_json(request).await?;
        let parsed: RerankOutput = serde_json::from_value(value).map_err(lumen_llm::LlmError::from)?;

        for item in parsed.results {
            // ignore ids the model invented
            if batch.iter().any(|(id, _)| *id == item.id) {
                scores.insert(item.id, item.score.clamp(0.0, 100.0));
            }
        }
    }
    Ok(scores)
}
