// Configuration layer for provider-agnostic LLM client creation

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    OpenAI,
}

/// Configuration for OpenAI-compatible providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: String,
    /// Defaults to https://api.openai.com/v1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Model selection and request limits shared by every provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub chat_model: String,
    /// Cheaper model used for small talk and routing
    pub fast_model: String,
    pub embedding_model: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            chat_model: "gpt-4o".to_string(),
            fast_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_secs: 180,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderDetails {
    OpenAI(OpenAIConfig),
}

/// Complete provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub details: ProviderDetails,
    #[serde(default)]
    pub models: ModelConfig,
}

impl ProviderConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            details: ProviderDetails::OpenAI(OpenAIConfig::new(api_key)),
            models: ModelConfig::default(),
        }
    }

    /// Point an OpenAI-compatible provider at another endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        match &mut self.details {
            ProviderDetails::OpenAI(openai) => openai.base_url = Some(base_url.into()),
        }
        self
    }

    pub fn with_models(mut self, models: ModelConfig) -> Self {
        self.models = models;
        self
    }

    pub fn provider_type(&self) -> ProviderType {
        match self.details {
            ProviderDetails::OpenAI(_) => ProviderType::OpenAI,
        }
    }
}

/// Factory for creating LLM clients from configuration
pub struct ClientFactory;

impl ClientFactory {
    pub fn create_client(config: ProviderConfig) -> Result<Arc<dyn crate::traits::LlmClient>> {
        let models = config.models;
        match config.details {
            ProviderDetails::OpenAI(openai_config) => {
                let mut builder = crate::openai::OpenAIClient::builder()
                    .api_key(openai_config.api_key)
                    .chat_model(models.chat_model)
                    .embedding_model(models.embedding_model)
                    .timeout(Duration::from_secs(models.request_timeout_secs))
                    .retry(RetryPolicy::new(models.max_retries));
                if let Some(base_url) = openai_config.base_url {
                    builder = builder.base_url(base_url);
                }
                Ok(Arc::new(builder.build()?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_config() {
        let config = ProviderConfig::openai("test-key");
        assert_eq!(config.provider_type(), ProviderType::OpenAI);
        assert_eq!(config.models.request_timeout_secs, 180);
    }

    #[test]
    fn test_factory_builds_client() {
        let config = ProviderConfig::openai("test-key");
        assert!(ClientFactory::create_client(config).is_ok());
    }

    #[test]
    fn test_factory_rejects_empty_key() {
        let config = ProviderConfig::openai("");
        assert!(ClientFactory::create_client(config).is_err());
    }

    #[test]
    fn test_base_url_override() {
        let config = ProviderConfig::openai("test-key").with_base_url("http://localhost:11434/v1");
        let ProviderDetails::OpenAI(openai) = &config.details;
        assert_eq!(openai.base_url.as_deref(), Some("http://localhost:11434/v1"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = ProviderConfig::openai("test-key");
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ProviderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.provider_type(), deserialized.provider_type());
    }
}
