mod chat;
mod derived;
mod jobs;
mod path;
mod vector;

pub use chat::{MessageRepository, ThreadRepository, ThreadStateRepository, TurnRepository};
pub use derived::{ChatDocRepository, ChatGraphRepository, MemoryItemRepository, SummaryRepository};
pub use jobs::{EnqueueOutcome, JobRepository};
pub use path::PathRepository;
pub use vector::{cosine_similarity, VectorFilter, VectorMatch, VectorRecord, VectorStore};
