//! # Lumen
//!
//! Conversational retrieval and maintenance engine for study chats.
//!
//! ## Overview
//!
//! A user posts a message to a thread. The engine appends it together with an
//! assistant placeholder, queues a `chat_respond` job and returns. A worker
//! then plans the context (hot window, summaries, retrieved evidence), streams
//! the answer over SSE, verifies quotes and citations, and queues a
//! `chat_maintain` job that indexes the new messages, grows the summary forest
//! and extracts graph and memory items for later turns.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lumen::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let llm = Arc::new(OpenAIClient::new(std::env::var("OPENAI_API_KEY")?)?);
//!
//!     let engine = Engine::builder()
//!         .stores(Stores::in_memory())
//!         .llm_client(llm)
//!         .config(EngineConfig::default().with_models("gpt-4o", "gpt-4o-mini"))
//!         .build()?;
//!
//!     let (shutdown, rx) = tokio::sync::watch::channel(false);
//!     let workers = engine.start_workers(rx);
//!
//!     let user = uuid::Uuid::new_v4();
//!     let mut events = engine.notifier.subscribe(user);
//!     let thread = engine.chat.create_thread(user, Some("Rust".into()), None).await?;
//!     engine.chat.post_message(user, thread.id, "What is ownership?").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{}: {}", event.event.as_str(), event.data);
//!         if event.event.is_sticky() {
//!             break;
//!         }
//!     }
//!
//!     shutdown.send(true)?;
//!     for worker in workers {
//!         worker.await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **`lumen-types`**: threads, messages, turns, projections, jobs and SSE envelopes
//! - **`lumen-llm`**: provider-agnostic `LlmClient` with an OpenAI-compatible client
//! - **`lumen-persist`**: store contracts with in-memory and MongoDB backends
//! - **`lumen-context`**: retriever and context planner
//! - **`lumen-engine`**: responder, maintainer, job runtime and notifier

pub mod prelude;

pub use lumen_types::{
    AssistantMetadata, ChatDoc, ChatMessage, Cursor, DocType, EvidenceCitation, EvidenceSource, Job,
    JobStatus, LearningPath, MessageRole, MessageStatus, SseEvent, SseMessage, SummaryNode, Thread,
    Turn, TurnStatus,
};

pub use lumen_llm::{JsonRequest, LlmClient, LlmError, OpenAIClient, RetryPolicy, StreamEvent, TextRequest};

pub use lumen_persist::{InMemoryVectorStore, MemoryStore, PersistError, Stores, VectorStore};

#[cfg(feature = "mongodb")]
pub use lumen_persist::MongoStore;

pub use lumen_context::{ContextConfig, ContextPlan, ContextPlanner, DefaultContextPlanner, TokenEstimator};

pub use lumen_engine::{
    CancelHandle, CancelToken, ChatService, Engine, EngineBuilder, EngineConfig, EngineError,
    GraphMirror, JobRuntime, MaintainReport, Notifier, PostedTurn, RespondOutcome, Subscription,
};
