mod store;
pub(crate) mod text;
mod vector;

pub use store::MemoryStore;
pub use vector::InMemoryVectorStore;
