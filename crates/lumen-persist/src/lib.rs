//! Store contracts for the Lumen chat engine, with in-memory and MongoDB backends
//!
//! The relational rows (threads, messages, turns, cursors, jobs, derived
//! projections) are the source of truth. The vector index is a cache that the
//! maintainer can rebuild from them.

pub mod dbs;
pub mod error;
pub mod memory;
pub mod repositories;
mod stores;

#[cfg(feature = "mongodb")]
pub use dbs::mongo::MongoStore;
pub use error::{PersistError, Result};
pub use memory::{InMemoryVectorStore, MemoryStore};
pub use repositories::{
    cosine_similarity, ChatDocRepository, ChatGraphRepository, EnqueueOutcome, JobRepository,
    MemoryItemRepository, MessageRepository, PathRepository, SummaryRepository, ThreadRepository,
    ThreadStateRepository, TurnRepository, VectorFilter, VectorMatch, VectorRecord, VectorStore,
};
pub use stores::Stores;
