pub mod buffer_utils;
pub mod config;
pub mod error;
pub mod openai;
pub mod retry;
pub mod schema;
pub mod streaming;
pub mod traits;
pub mod types;

pub use config::{ClientFactory, ModelConfig, OpenAIConfig, ProviderConfig, ProviderType};
pub use error::{LlmError, Result};
pub use openai::OpenAIClient;
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use schema::JsonSchema;
pub use streaming::StreamEvent;
pub use traits::{collect_stream, GenerateOptions, JsonRequest, LlmClient, TextRequest, TextStream};
pub use types::Message;
