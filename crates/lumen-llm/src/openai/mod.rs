mod client;
mod responses;

pub use client::{OpenAIClient, OpenAIClientBuilder};
pub use responses::{
    ContentItem, ConversationObject, EmbeddingData, EmbeddingsResponse, OutputItem,
    ResponseStreamChunk, ResponsesResponse, StreamResponseRef, Usage,
};
