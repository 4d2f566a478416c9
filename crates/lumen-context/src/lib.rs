//! Context planning and hybrid retrieval for Lumen chat turns
//!
//! [`DefaultContextPlanner`] assembles the prompt for one turn: it routes the
//! message, allocates per-lane token budgets, retrieves projection docs and
//! source-material excerpts, and records the evidence the answer may cite.

pub mod config;
pub mod error;
pub mod filters;
pub mod path_docs;
pub mod planner;
pub mod prompts;
pub mod retriever;
pub mod tokens;

pub use config::{ContextConfig, LaneBudgets};
pub use error::{ContextError, Result};
pub use planner::{
    ContextPlan, ContextPlanner, DefaultContextPlanner, EditTarget, Lane, PlanInput, PlanMode,
    RouteDecision, INTAKE_QUESTIONS_KIND,
};
pub use retriever::{
    HybridRetriever, MaterialHit, MaterialRetriever, RetrievalMode, RetrievalPlan, RetrievalResult,
    RetrievedDoc,
};
pub use tokens::{CharsEstimator, Cl100kEstimator, TokenEstimator, TokenizerKind};
