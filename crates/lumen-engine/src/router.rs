use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use lumen_llm::{GenerateOptions, JsonRequest, JsonSchema, LlmClient};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::prompts::TURN_ROUTER_SYSTEM_PROMPT;
use crate::tools::is_supported_tool;

lazy_static! {
    static ref SMALLTALK_WORDS: HashSet<&'static str> = [
        "hi", "hey", "hello", "yo", "hiya", "howdy", "sup", "thanks", "thank", "thx", "ty",
        "cheers", "you", "how", "are", "is", "it", "going", "good", "morning", "afternoon",
        "evening", "night", "ok", "okay", "cool", "great", "nice", "awesome", "bye", "goodbye",
        "what's", "whats", "up", "doing", "today", "there", "lumen", "i'm", "im", "fine", "well",
        "and", "so", "much", "a", "lot", "very", "again", "all", "u", "r",
    ]
    .into_iter()
    .collect();
    static ref PATH_INDEX: Regex = Regex::new(
        r"(?i)\b(re-?index|rebuild|refresh|re-?sync)\b.*\b(path|course|outline|curriculum)\b|\b(path|course|outline)\b.*\b(re-?index|rebuild|refresh)\b"
    ).unwrap();
    static ref CHAT_REBUILD: Regex = Regex::new(
        r"(?i)\b(re-?index|rebuild|refresh|reset)\b.*\b(chat|thread|conversation|index|memory|summar\w*)\b"
    ).unwrap();
    static ref LEARNING_BUILD: Regex = Regex::new(
        r"(?i)\b(build|generate|create|make|start)\b.*\b(learning\s+path|study\s+path|course)\b"
    ).unwrap();
    static ref PROGRESSIVE: Regex =
        Regex::new(r"(?i)\b(progressive(ly)?|step\s+by\s+step|unit\s+by\s+unit|incremental(ly)?)\b").unwrap();
}

const SMALLTALK_MAX_WORDS: usize = 8;

/// A single tool invocation requested by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnRoute {
    SmallTalk,
    Tool(ToolCall),
    Product,
}

impl TurnRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRoute::SmallTalk => "smalltalk",
            TurnRoute::Tool(_) => "tool",
            TurnRoute::Product => "product",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub text: &'a str,
    /// A build job on the thread is suspended waiting for the learner's answer
    pub waitpoint_active: bool,
}

/// Chooses the lane a turn runs in
#[async_trait]
pub trait TurnRouter: Send + Sync {
    async fn route(&self, input: RouteInput<'_>) -> TurnRoute;
}

pub fn is_smalltalk(text: &str) -> bool {
    let words: Vec<String> = text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '!' | '?' | '.' | ':' | ';'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase().replace('’', "'"))
        .collect();
    !words.is_empty()
        && words.len() <= SMALLTALK_MAX_WORDS
        && words.iter().all(|w| SMALLTALK_WORDS.contains(w.as_str()))
}

/// Pattern match for explicit pipeline requests
pub fn heuristic_tool(text: &str) -> Option<ToolCall> {
    if PATH_INDEX.is_match(text) {
        return Some(ToolCall::new(lumen_types::jobs::CHAT_PATH_INDEX));
    }
    if CHAT_REBUILD.is_match(text) {
        return Some(ToolCall::new(lumen_types::jobs::CHAT_REBUILD));
    }
    if LEARNING_BUILD.is_match(text) {
        let name = if PROGRESSIVE.is_match(text) {
            lumen_types::jobs::LEARNING_BUILD_PROGRESSIVE
        } else {
            lumen_types::jobs::LEARNING_BUILD
        };
        return Some(ToolCall::new(name));
    }
    None
}

pub fn turn_route_schema() -> JsonSchema {
    JsonSchema::new(
        "turn_route",
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["route", "tool", "arguments"],
            "properties": {
                "route": {"type": "string", "enum": ["smalltalk", "tool", "product"]},
                "tool": {"type": "string"},
                "arguments": {"type": "string"}
            }
        }),
    )
}

fn parse_route(value: &Value) -> TurnRoute {
    match value.get("route").and_then(Value::as_str) {
        Some("smalltalk") => TurnRoute::SmallTalk,
        Some("tool") => {
            let name = value.get("tool").and_then(Value::as_str).unwrap_or_default().trim();
            if !is_supported_tool(name) {
                return TurnRoute::Product;
            }
            let arguments = value
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            TurnRoute::Tool(ToolCall {
                name: name.to_string(),
                arguments,
            })
        }
        _ => TurnRoute::Product,
    }
}

/// Heuristics first, then an optional model call bounded by `timeout`
pub struct DefaultTurnRouter {
    llm: Option<Arc<dyn LlmClient>>,
    model: Option<String>,
    timeout: Duration,
    tool_routing: bool,
}

impl DefaultTurnRouter {
    /// Heuristics only
    pub fn heuristic() -> Self {
        Self {
            llm: None,
            model: None,
            timeout: Duration::from_secs(5),
            tool_routing: true,
        }
    }

    pub fn with_llm(llm: Arc<dyn LlmClient>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            llm: Some(llm),
            model,
            timeout,
            tool_routing: true,
        }
    }

    pub fn tool_routing(mut self, enabled: bool) -> Self {
        self.tool_routing = enabled;
        self
    }

    async fn model_route(&self, llm: &Arc<dyn LlmClient>, text: &str) -> TurnRoute {
        let mut options = GenerateOptions::new().temperature(0.0);
        if let Some(model) = &self.model {
            options = options.model(model.clone());
        }
        let request = JsonRequest::new(TURN_ROUTER_SYSTEM_PROMPT, text, turn_route_schema())
            .with_options(options);
        match tokio::time::timeout(self.timeout, llm.generate_json(request)).await {
            Ok(Ok(value)) => parse_route(&value),
            Ok(Err(e)) => {
                warn!(error = %e, "turn router call failed; using product lane");
                TurnRoute::Product
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "turn router timed out; using product lane");
                TurnRoute::Product
            }
        }
    }
}

#[async_trait]
impl TurnRouter for DefaultTurnRouter {
    async fn route(&self, input: RouteInput<'_>) -> TurnRoute {
        if input.waitpoint_active {
            debug!("waitpoint active; skipping tool routing");
            return TurnRoute::Product;
        }
        if is_smalltalk(input.text) {
            return TurnRoute::SmallTalk;
        }
        if !self.tool_routing {
            return TurnRoute::Product;
        }
        if let Some(call) = heuristic_tool(input.text) {
            return TurnRoute::Tool(call);
        }
        let route = match &self.llm {
            Some(llm) => self.model_route(llm, input.text).await,
            None => TurnRoute::Product,
        };
        // the model may only add tool calls or stay in product; small talk is decided above
        match route {
            TurnRoute::SmallTalk => TurnRoute::Product,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_types::jobs::{CHAT_PATH_INDEX, CHAT_REBUILD, LEARNING_BUILD, LEARNING_BUILD_PROGRESSIVE};

    #[test]
    fn test_smalltalk_detection() {
        assert!(is_smalltalk("hey, how are you?"));
        assert!(is_smalltalk("Thanks so much!"));
        assert!(!is_smalltalk("hey, what were the unit titles?"));
        assert!(!is_smalltalk(""));
    }

    #[test]
    fn test_heuristic_tools() {
        assert_eq!(
            heuristic_tool("rebuild the chat index for this thread").map(|c| c.name),
            Some(CHAT_REBUILD.to_string())
        );
        assert_eq!(
            heuristic_tool("please reindex the course outline").map(|c| c.name),
            Some(CHAT_PATH_INDEX.to_string())
        );
        assert_eq!(
            heuristic_tool("build me a learning path from my notes").map(|c| c.name),
            Some(LEARNING_BUILD.to_string())
        );
        assert_eq!(
            heuristic_tool("create a course step by step").map(|c| c.name),
            Some(LEARNING_BUILD_PROGRESSIVE.to_string())
        );
        assert!(heuristic_tool("what were the unit titles?").is_none());
    }

    #[test]
    fn test_model_route_rejects_unknown_tools() {
        let value = json!({"route": "tool", "tool": "delete_everything", "arguments": "{}"});
        assert_eq!(parse_route(&value), TurnRoute::Product);

        let value = json!({"route": "tool", "tool": "chat_rebuild", "arguments": "{\"thread_id\": \"x\"}"});
        match parse_route(&value) {
            TurnRoute::Tool(call) => {
                assert_eq!(call.name, "chat_rebuild");
                assert_eq!(call.arguments["thread_id"], "x");
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_waitpoint_forces_product() {
        let router = DefaultTurnRouter::heuristic();
        let route = router
            .route(RouteInput {
                text: "rebuild the chat index",
                waitpoint_active: true,
            })
            .await;
        assert_eq!(route, TurnRoute::Product);
    }
}
