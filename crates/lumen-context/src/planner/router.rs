//! Per-turn lane routing: a deterministic heuristic, optionally refined by the model

use std::time::Duration;

use lazy_static::lazy_static;
use lumen_llm::{GenerateOptions, JsonRequest, JsonSchema, LlmClient};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::prompts::ROUTER_SYSTEM_PROMPT;

lazy_static! {
    static ref EDIT: Regex = Regex::new(
        r"(?i)\b(rewrite|reword|rephrase|edit|simplify|shorten|lengthen|expand|fix|change|update|improve)\b.*\b(this|that|the)\s+(block|section|paragraph|example|explanation|lesson|part|text)\b"
    ).unwrap();
    static ref MATERIALS: Regex = Regex::new(
        r"(?i)\b(quote|verbatim|word\s+for\s+word|exact\s+wording|cite|citation|file|files|pdf|document|documents|slides?|transcript|source\s+material|according\s+to\s+the|page\s+\d+)\b"
    ).unwrap();
    static ref VERBATIM: Regex =
        Regex::new(r"(?i)\b(quote|verbatim|word\s+for\s+word|exact\s+wording)\b").unwrap();
    static ref UNIT: Regex = Regex::new(
        r"(?i)\b(unit|units|lesson|lessons|module|section|block|this\s+(page|part|step)|here|current)\b"
    ).unwrap();
    static ref PATH: Regex = Regex::new(
        r"(?i)\b(path|course|syllabus|outline|curriculum|units|titles?|overview|roadmap|what('s| is)\s+next)\b"
    ).unwrap();
    static ref CONCEPT: Regex = Regex::new(
        r"(?i)\b(concepts?|relate[sd]?|relationship|prerequisites?|depends?\s+on|builds?\s+on|connection|connected)\b"
    ).unwrap();
    static ref USER_STATE: Regex = Regex::new(
        r"(?i)\b(my\s+progress|how\s+am\s+i\s+doing|what\s+do\s+i\s+know|mastery|weak(est)?|struggl\w*|review\s+what)\b"
    ).unwrap();
    static ref HISTORY: Regex = Regex::new(
        r"(?i)\b(earlier|before|previously|we\s+(discussed|talked|said)|you\s+(said|mentioned|told)|remember|last\s+time|again)\b"
    ).unwrap();
    static ref VIEWPORT: Regex = Regex::new(
        r"(?i)\b(this|here|on\s+(my\s+)?screen|i('m| am)\s+(reading|looking\s+at)|above|below)\b"
    ).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    #[default]
    Explain,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Lanes {
    pub viewport: bool,
    pub unit: bool,
    pub path: bool,
    pub concept: bool,
    pub user: bool,
    pub retrieve: bool,
    pub materials: bool,
    pub graph: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockDetail {
    #[default]
    None,
    Summary,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitDetail {
    pub current_block: BlockDetail,
    pub include_visible: bool,
    pub include_lesson_index: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetrievalScopes {
    pub thread: bool,
    pub path: bool,
    pub user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    Heuristic,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub mode: PlanMode,
    pub lanes: Lanes,
    pub unit: UnitDetail,
    pub scopes: RetrievalScopes,
    pub materials_query: Option<String>,
    pub confidence: f32,
    pub source: RouteSource,
    /// The learner asked for verbatim source text
    pub verbatim: bool,
}

/// What the router knows about the thread besides the text
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteContext {
    pub has_path: bool,
    pub has_session: bool,
    pub has_materials: bool,
}

pub fn heuristic_route(text: &str, ctx: RouteContext) -> RouteDecision {
    let mode = if EDIT.is_match(text) {
        PlanMode::Edit
    } else {
        PlanMode::Explain
    };
    let verbatim = VERBATIM.is_match(text);
    let wants_materials = MATERIALS.is_match(text);
    let wants_unit = UNIT.is_match(text) || mode == PlanMode::Edit;
    let wants_path = PATH.is_match(text);
    let wants_concept = CONCEPT.is_match(text);
    let wants_history = HISTORY.is_match(text);

    let lanes = Lanes {
        viewport: ctx.has_session && (VIEWPORT.is_match(text) || wants_unit),
        unit: ctx.has_path && wants_unit,
        path: ctx.has_path && (wants_path || wants_unit),
        concept: ctx.has_path && wants_concept,
        user: USER_STATE.is_match(text),
        retrieve: true,
        materials: ctx.has_path && ctx.has_materials && wants_materials,
        graph: wants_history || wants_concept,
    };

    let unit = UnitDetail {
        current_block: if mode == PlanMode::Edit {
            BlockDetail::Full
        } else if lanes.viewport {
            BlockDetail::Summary
        } else {
            BlockDetail::None
        },
        include_visible: lanes.viewport,
        include_lesson_index: lanes.path && wants_path,
    };

    let scopes = RetrievalScopes {
        thread: true,
        path: ctx.has_path,
        user: true,
    };

    let matched = [
        mode == PlanMode::Edit,
        wants_materials,
        wants_unit,
        wants_path,
        wants_concept,
        wants_history,
        lanes.user,
    ]
    .iter()
    .filter(|m| **m)
    .count();

    RouteDecision {
        mode,
        lanes,
        unit,
        scopes,
        materials_query: lanes.materials.then(|| text.trim().to_string()),
        confidence: if matched > 0 { 0.7 } else { 0.5 },
        source: RouteSource::Heuristic,
        verbatim,
    }
}

pub fn route_schema() -> JsonSchema {
    let flag = json!({ "type": "boolean" });
    JsonSchema::new(
        "context_route",
        json!({
            "type": "object",
            "properties": {
                "mode": { "type": "string", "enum": ["explain", "edit"] },
                "lanes": {
                    "type": "object",
                    "properties": {
                        "viewport": flag, "unit": flag, "path": flag, "concept": flag,
                        "user": flag, "retrieve": flag, "materials": flag, "graph": flag
                    },
                    "required": ["viewport", "unit", "path", "concept", "user", "retrieve", "materials", "graph"],
                    "additionalProperties": false
                },
                "unit": {
                    "type": "object",
                    "properties": {
                        "current_block": { "type": "string", "enum": ["none", "summary", "full"] },
                        "include_visible": flag,
                        "include_lesson_index": flag
                    },
                    "required": ["current_block", "include_visible", "include_lesson_index"],
                    "additionalProperties": false
                },
                "scopes": {
                    "type": "object",
                    "properties": { "thread": flag, "path": flag, "user": flag },
                    "required": ["thread", "path", "user"],
                    "additionalProperties": false
                },
                "materials_query": { "type": "string" },
                "confidence": { "type": "number" }
            },
            "required": ["mode", "lanes", "unit", "scopes", "materials_query", "confidence"],
            "additionalProperties": false
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ModelRoute {
    mode: PlanMode,
    lanes: Lanes,
    unit: UnitDetail,
    scopes: RetrievalScopes,
    materials_query: String,
    confidence: f32,
}

/// Ask the model to refine `heuristic`; any failure, timeout or low confidence keeps it
pub async fn refine_route(
    llm: &dyn LlmClient,
    text: &str,
    ctx: RouteContext,
    heuristic: RouteDecision,
    timeout: Duration,
    min_confidence: f32,
    model: Option<&str>,
) -> RouteDecision {
    let user = format!(
        "Thread has learning path: {}\nLearner session visible: {}\nSource materials available: {}\n\nMessage:\n{}",
        ctx.has_path, ctx.has_session, ctx.has_materials, text
    );
    let mut options = GenerateOptions::new().temperature(0.0);
    if let Some(model) = model {
        options = options.model(model);
    }
    let request = JsonRequest::new(ROUTER_SYSTEM_PROMPT, user, route_schema()).with_options(options);

    let value = match tokio::time::timeout(timeout, llm.generate_json(request)).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(error = %e, "router call failed; keeping heuristic route");
            return heuristic;
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "router timed out; keeping heuristic route");
            return heuristic;
        }
    };
    let parsed: ModelRoute = match serde_json::from_value(value) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "router output unusable; keeping heuristic route");
            return heuristic;
        }
    };
    if parsed.confidence < min_confidence {
        debug!(confidence = parsed.confidence, "router below confidence threshold");
        return heuristic;
    }

    let refined = RouteDecision {
        mode: parsed.mode,
        lanes: parsed.lanes,
        unit: parsed.unit,
        scopes: parsed.scopes,
        materials_query: Some(parsed.materials_query).filter(|q| !q.trim().is_empty()),
        confidence: parsed.confidence,
        source: RouteSource::Model,
        verbatim: heuristic.verbatim,
    };
    enforce(refined, ctx, &heuristic)
}

/// Drop lanes the thread cannot serve and keep hard requirements from the heuristic
pub fn enforce(mut decision: RouteDecision, ctx: RouteContext, heuristic: &RouteDecision) -> RouteDecision {
    if !ctx.has_path {
        decision.lanes.unit = false;
        decision.lanes.path = false;
        decision.lanes.concept = false;
        decision.lanes.materials = false;
        decision.scopes.path = false;
    }
    if !ctx.has_session {
        decision.lanes.viewport = false;
    }
    if !ctx.has_materials {
        decision.lanes.materials = false;
    }
    if heuristic.verbatim && ctx.has_path && ctx.has_materials {
        decision.lanes.materials = true;
        decision.lanes.retrieve = true;
    }
    if decision.lanes.materials && decision.materials_query.is_none() {
        decision.materials_query = heuristic.materials_query.clone();
    }
    if decision.lanes.retrieve && !(decision.scopes.thread || decision.scopes.path || decision.scopes.user) {
        decision.scopes = heuristic.scopes;
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH_CTX: RouteContext = RouteContext {
        has_path: true,
        has_session: false,
        has_materials: true,
    };

    #[test]
    fn test_unit_titles_routes_to_unit_and_path() {
        let route = heuristic_route("what were the unit titles?", PATH_CTX);
        assert_eq!(route.mode, PlanMode::Explain);
        assert!(route.lanes.unit);
        assert!(route.lanes.path);
        assert!(route.lanes.retrieve);
        assert!(route.scopes.path);
        assert!(route.unit.include_lesson_index);
    }

    #[test]
    fn test_quote_request_forces_materials() {
        let route = heuristic_route("quote the file where it defines X", PATH_CTX);
        assert!(route.verbatim);
        assert!(route.lanes.materials);
        assert!(route.lanes.retrieve);
        assert_eq!(route.materials_query.as_deref(), Some("quote the file where it defines X"));
    }

    #[test]
    fn test_no_path_disables_path_lanes() {
        let route = heuristic_route("quote the lesson outline", RouteContext::default());
        assert!(!route.lanes.materials);
        assert!(!route.lanes.path);
        assert!(!route.scopes.path);
        assert!(route.scopes.thread);
    }

    #[test]
    fn test_edit_mode_detection() {
        let route = heuristic_route("please simplify this paragraph for me", PATH_CTX);
        assert_eq!(route.mode, PlanMode::Edit);
        assert_eq!(route.unit.current_block, BlockDetail::Full);
    }

    #[test]
    fn test_enforce_keeps_verbatim_materials() {
        let heuristic = heuristic_route("quote the pdf", PATH_CTX);
        let mut model = heuristic.clone();
        model.lanes.materials = false;
        model.source = RouteSource::Model;
        let enforced = enforce(model, PATH_CTX, &heuristic);
        assert!(enforced.lanes.materials);
    }
}
