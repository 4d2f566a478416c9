use std::sync::Arc;

#[cfg(feature = "mongodb")]
use crate::dbs::mongo::MongoStore;
use crate::memory::{InMemoryVectorStore, MemoryStore};
use crate::repositories::{
    ChatDocRepository, ChatGraphRepository, JobRepository, MemoryItemRepository,
    MessageRepository, PathRepository, SummaryRepository, ThreadRepository,
    ThreadStateRepository, TurnRepository, VectorStore,
};

/// Every store the engine talks to, behind trait objects
#[derive(Clone)]
pub struct Stores {
    pub threads: Arc<dyn ThreadRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub turns: Arc<dyn TurnRepository>,
    pub thread_state: Arc<dyn ThreadStateRepository>,
    pub docs: Arc<dyn ChatDocRepository>,
    pub summaries: Arc<dyn SummaryRepository>,
    pub graph: Arc<dyn ChatGraphRepository>,
    pub memory: Arc<dyn MemoryItemRepository>,
    pub paths: Arc<dyn PathRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub vectors: Arc<dyn VectorStore>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()), Arc::new(InMemoryVectorStore::new()))
    }

    /// Wire every repository to one shared `MemoryStore`, so tests can seed and inspect it
    pub fn from_memory(store: Arc<MemoryStore>, vectors: Arc<InMemoryVectorStore>) -> Self {
        Self {
            threads: store.clone(),
            messages: store.clone(),
            turns: store.clone(),
            thread_state: store.clone(),
            docs: store.clone(),
            summaries: store.clone(),
            graph: store.clone(),
            memory: store.clone(),
            paths: store.clone(),
            jobs: store,
            vectors,
        }
    }

    /// Relational rows in MongoDB; vectors stay in the given index
    #[cfg(feature = "mongodb")]
    pub fn from_mongo(store: Arc<MongoStore>, vectors: Arc<dyn VectorStore>) -> Self {
        Self {
            threads: store.clone(),
            messages: store.clone(),
            turns: store.clone(),
            thread_state: store.clone(),
            docs: store.clone(),
            summaries: store.clone(),
            graph: store.clone(),
            memory: store.clone(),
            paths: store.clone(),
            jobs: store,
            vectors,
        }
    }
}
