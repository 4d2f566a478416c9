use crate::error::Result;
use crate::schema::JsonSchema;
use crate::streaming::StreamEvent;
use crate::types::Message;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;

/// Token-delta stream returned by the streaming calls
pub type TextStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Capability set the engine requires from an inference provider
///
/// Embeddings, schema-constrained JSON, plain text and token streaming, with
/// and without a server-side conversation handle.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One dense vector per input, at the same index
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Structured generation; the returned value has been validated against `request.schema`
    async fn generate_json(&self, request: JsonRequest) -> Result<Value>;

    async fn generate_text(&self, request: TextRequest) -> Result<String>;

    async fn stream_text(&self, request: TextRequest) -> Result<TextStream>;

    /// Create a provider-side conversation handle
    async fn create_conversation(&self) -> Result<String>;

    async fn generate_text_in_conversation(
        &self,
        conversation_id: &str,
        request: TextRequest,
    ) -> Result<String>;

    async fn stream_text_in_conversation(
        &self,
        conversation_id: &str,
        request: TextRequest,
    ) -> Result<TextStream>;
}

/// Drain a stream, invoking `on_delta` for each text delta, and return the full text
pub async fn collect_stream<F>(mut stream: TextStream, mut on_delta: F) -> Result<String>
where
    F: FnMut(&str),
{
    let mut full = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Message { content } => {
                on_delta(&content);
                full.push_str(&content);
            }
            StreamEvent::Refusal { content } => {
                return Err(crate::error::LlmError::Refusal(content));
            }
            StreamEvent::Done { .. } => break,
        }
    }
    Ok(full)
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub system: String,
    pub user: String,
    pub history: Vec<Message>,
    pub options: GenerateOptions,
}

impl TextRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            history: Vec::new(),
            options: GenerateOptions::default(),
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone)]
pub struct JsonRequest {
    pub system: String,
    pub user: String,
    pub schema: JsonSchema,
    pub options: GenerateOptions,
}

impl JsonRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, schema: JsonSchema) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            schema,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Overrides the client's default model
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }
}
