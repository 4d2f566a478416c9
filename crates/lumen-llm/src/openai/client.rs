// OpenAI-specific client implementation (Responses, Conversations and Embeddings APIs)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Map, Value};

use crate::error::{LlmError, Result};
use crate::openai::{ConversationObject, EmbeddingsResponse, ResponsesResponse};
use crate::retry::RetryPolicy;
use crate::streaming::parse_response_sse_stream;
use crate::traits::{GenerateOptions, JsonRequest, LlmClient, TextRequest, TextStream};
use crate::types::Message;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_TIMEOUT_SECS: u64 = 180;

/// OpenAI client (HTTP direct, no SDK)
pub struct OpenAIClient {
    http_client: reqwest::Client,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

impl OpenAIClient {
    /// Create new client with API key and default settings
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::builder().api_key(api_key).build()
    }

    pub fn builder() -> OpenAIClientBuilder {
        OpenAIClientBuilder::default()
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    /// Build a /responses payload
    fn build_response_request(
        &self,
        system: &str,
        history: &[Message],
        user: &str,
        options: &GenerateOptions,
        stream: bool,
    ) -> Value {
        let mut input: Vec<Value> = Vec::with_capacity(history.len() + 1);
        for msg in history {
            input.push(json!({"role": msg.role(), "content": msg.content()}));
        }
        input.push(json!({"role": "user", "content": user}));

        let model = options.model.as_deref().unwrap_or(&self.chat_model);

        let mut obj = Map::new();
        obj.insert("model".to_string(), json!(model));
        obj.insert("input".to_string(), Value::Array(input));
        obj.insert("stream".to_string(), json!(stream));
        if !system.is_empty() {
            obj.insert("instructions".to_string(), json!(system));
        }

        // Reasoning models reject sampling parameters
        let is_reasoning_model = model.starts_with('o') || model.starts_with("gpt-5");
        if let Some(temp) = options.temperature {
            if !is_reasoning_model {
                obj.insert("temperature".to_string(), json!(temp));
            }
        }
        if let Some(max_tokens) = options.max_output_tokens {
            obj.insert("max_output_tokens".to_string(), json!(max_tokens));
        }

        Value::Object(obj)
    }

    async fn post_json(&self, path: &str, payload: &Value) -> Result<reqwest::Response> {
        let response = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http { status, body });
        }
        Ok(response)
    }

    async fn create_response(&self, payload: &Value) -> Result<ResponsesResponse> {
        self.retry
            .run("responses", || async {
                let response = self.post_json("/responses", payload).await?;
                let raw: ResponsesResponse = response.json().await?;
                if let Some(refusal) = raw.refusal() {
                    return Err(LlmError::Refusal(refusal));
                }
                Ok(raw)
            })
            .await
    }

    async fn open_stream(&self, payload: &Value) -> Result<TextStream> {
        // Retries cover connection setup only; a stream that fails midway is terminal
        let response = self
            .retry
            .run("responses.stream", || self.post_json("/responses", payload))
            .await?;
        Ok(parse_response_sse_stream(response))
    }

    async fn embed_once(&self, inputs: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let payload = json!({
            "model": self.embedding_model,
            "input": inputs,
        });
        let raw: EmbeddingsResponse = self
            .retry
            .run("embeddings", || async {
                let response = self.post_json("/embeddings", &payload).await?;
                Ok(response.json::<EmbeddingsResponse>().await?)
            })
            .await?;

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        for item in raw.data {
            if item.index < slots.len() && !item.embedding.is_empty() {
                slots[item.index] = Some(item.embedding);
            }
        }
        Ok(slots)
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let mut slots = self.embed_once(inputs).await?;

        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            tracing::warn!(
                missing = missing.len(),
                total = inputs.len(),
                "Embedding response missing indices, retrying once"
            );
            let retry_inputs: Vec<String> = missing.iter().map(|&i| inputs[i].clone()).collect();
            let retried = self.embed_once(&retry_inputs).await?;
            for (pos, &idx) in missing.iter().enumerate() {
                if let Some(Some(vec)) = retried.get(pos) {
                    slots[idx] = Some(vec.clone());
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or(LlmError::MissingEmbedding(i)))
            .collect()
    }

    async fn generate_json(&self, request: JsonRequest) -> Result<Value> {
        let mut payload = self.build_response_request(
            &request.system,
            &[],
            &request.user,
            &request.options,
            false,
        );
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "text".to_string(),
                json!({
                    "format": {
                        "type": "json_schema",
                        "name": request.schema.name,
                        "schema": request.schema.schema,
                        "strict": request.schema.strict,
                    }
                }),
            );
        }

        // Schema violations count as retryable, so parse inside the retry loop
        self.retry
            .run("responses.json", || async {
                let response = self.post_json("/responses", &payload).await?;
                let raw: ResponsesResponse = response.json().await?;
                if let Some(refusal) = raw.refusal() {
                    return Err(LlmError::Refusal(refusal));
                }
                request.schema.parse(&raw.output_text())
            })
            .await
    }

    async fn generate_text(&self, request: TextRequest) -> Result<String> {
        let payload = self.build_response_request(
            &request.system,
            &request.history,
            &request.user,
            &request.options,
            false,
        );
        Ok(self.create_response(&payload).await?.output_text())
    }

    async fn stream_text(&self, request: TextRequest) -> Result<TextStream> {
        let payload = self.build_response_request(
            &request.system,
            &request.history,
            &request.user,
            &request.options,
            true,
        );
        self.open_stream(&payload).await
    }

    async fn create_conversation(&self) -> Result<String> {
        let payload = json!({});
        self.retry
            .run("conversations", || async {
                let response = self.post_json("/conversations", &payload).await?;
                let conv: ConversationObject = response.json().await?;
                Ok(conv.id)
            })
            .await
    }

    async fn generate_text_in_conversation(
        &self,
        conversation_id: &str,
        request: TextRequest,
    ) -> Result<String> {
        let mut payload = self.build_response_request(
            &request.system,
            &request.history,
            &request.user,
            &request.options,
            false,
        );
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("conversation".to_string(), json!(conversation_id));
        }
        Ok(self.create_response(&payload).await?.output_text())
    }

    async fn stream_text_in_conversation(
        &self,
        conversation_id: &str,
        request: TextRequest,
    ) -> Result<TextStream> {
        let mut payload = self.build_response_request(
            &request.system,
            &request.history,
            &request.user,
            &request.options,
            true,
        );
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("conversation".to_string(), json!(conversation_id));
        }
        self.open_stream(&payload).await
    }
}

/// Builder for [`OpenAIClient`]
#[derive(Debug, Default)]
pub struct OpenAIClientBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    chat_model: Option<String>,
    embedding_model: Option<String>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl OpenAIClientBuilder {
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = Some(model.into());
        self
    }

    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<OpenAIClient> {
        let api_key = self
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LlmError::Config("api_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| LlmError::Config("Invalid API key format".to_string()))?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(
                self.timeout
                    .unwrap_or_else(|| Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            )
            .build()
            .map_err(|e| LlmError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = self
            .base_url
            .unwrap_or_else(|| OPENAI_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(OpenAIClient {
            http_client,
            base_url,
            chat_model: self
                .chat_model
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            embedding_model: self
                .embedding_model
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            retry: self.retry.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenAIClient {
        OpenAIClient::builder()
            .api_key("sk-test")
            .base_url("http://localhost:9999/v1/")
            .chat_model("gpt-4o-mini")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_api_key() {
        let err = OpenAIClient::builder().build().unwrap_err();
        assert!(matches!(err, LlmError::Config(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(client().base_url, "http://localhost:9999/v1");
    }

    #[test]
    fn test_payload_puts_history_before_user_turn() {
        let c = client();
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let payload = c.build_response_request(
            "be brief",
            &history,
            "what now?",
            &GenerateOptions::new().temperature(0.2),
            true,
        );
        let input = payload["input"].as_array().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(input[2]["role"], "user");
        assert_eq!(input[2]["content"], "what now?");
        assert_eq!(payload["instructions"], "be brief");
        assert_eq!(payload["stream"], true);
        assert!(payload.get("temperature").is_some());
    }

    #[test]
    fn test_reasoning_model_drops_temperature() {
        let c = client();
        let payload = c.build_response_request(
            "",
            &[],
            "q",
            &GenerateOptions::new().model("gpt-5-mini").temperature(0.7),
            false,
        );
        assert!(payload.get("temperature").is_none());
        assert!(payload.get("instructions").is_none());
        assert_eq!(payload["model"], "gpt-5-mini");
    }
}
