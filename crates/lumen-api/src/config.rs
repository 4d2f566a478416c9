use config::{Config as ConfigLoader, ConfigError, File};
use lumen_engine::EngineConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    // Secrets (from ENV only)
    #[serde(skip)]
    pub mongodb_uri: Option<String>,
    #[serde(skip)]
    pub openai_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request timeout; SSE streams are exempt
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Mongodb,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database: "lumen".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint; the public API when unset
    #[serde(default)]
    pub base_url: Option<String>,
    pub chat_model: String,
    pub fast_model: String,
    pub embedding_model: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            chat_model: "gpt-4o".to_string(),
            fast_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl From<LlmConfig> for lumen_llm::ModelConfig {
    fn from(config: LlmConfig) -> Self {
        Self {
            chat_model: config.chat_model,
            fast_model: config.fast_model,
            embedding_model: config.embedding_model,
            request_timeout_secs: config.request_timeout_secs,
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Environment prefixes and the config section each one overrides
const ENV_SECTIONS: &[(&str, &str)] = &[
    ("SERVER_", "server"),
    ("MONGODB_", "storage"),
    ("LLM_", "llm"),
    ("LOG_", "logging"),
    ("ENGINE_", "engine"),
];

/// Read from the environment only, never mapped onto a section
const SECRETS: &[&str] = &["MONGODB_URI", "OPENAI_API_KEY"];

impl Config {
    /// Load configuration from TOML files and environment variables
    ///
    /// Hierarchy (weakest to strongest):
    /// 1. config/default.toml
    /// 2. config/{ENV}.toml (if ENV is set)
    /// 3. Environment variables (SERVER_, MONGODB_, LLM_, LOG_, ENGINE_ prefixes)
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("ENV").unwrap_or_else(|_| "dev".to_string());
        let dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let mut builder = ConfigLoader::builder()
            .add_source(File::with_name(&format!("{}/default", dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", dir, env)).required(false));
        for (key, value) in env_overrides(std::env::vars()) {
            builder = builder.set_override(key, value)?;
        }

        let mut cfg: Config = builder.build()?.try_deserialize()?;

        cfg.mongodb_uri = std::env::var("MONGODB_URI").ok().filter(|v| !v.is_empty());
        cfg.openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::Message("OPENAI_API_KEY environment variable is required".to_string()))?;
        if cfg.storage.backend == StorageBackend::Mongodb && cfg.mongodb_uri.is_none() {
            return Err(ConfigError::Message(
                "MONGODB_URI environment variable is required for the mongodb backend".to_string(),
            ));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Load config from a specific path (useful for testing)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let cfg: Config = ConfigLoader::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.jobs.workers == 0 {
            return Err(ConfigError::Message("engine.jobs.workers must be at least 1".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Message("server.port must be set".to_string()));
        }
        Ok(())
    }

    /// Engine tunables with the configured model names filled in
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        if engine.responder.chat_model.is_none() {
            engine.responder.chat_model = Some(self.llm.chat_model.clone());
        }
        if engine.responder.fast_model.is_none() {
            engine.responder.fast_model = Some(self.llm.fast_model.clone());
        }
        engine
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Map `PREFIX_KEY` variables onto config keys, e.g. `LLM_CHAT_MODEL` to `llm.chat_model`.
/// A double underscore descends one level: `ENGINE_JOBS__WORKERS` is `engine.jobs.workers`.
fn env_overrides(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in vars {
        if SECRETS.contains(&name.as_str()) {
            continue;
        }
        for (prefix, section) in ENV_SECTIONS {
            if let Some(rest) = name.strip_prefix(prefix) {
                if !rest.is_empty() {
                    out.push((format!("{}.{}", section, rest.to_lowercase().replace("__", ".")), value.clone()));
                }
                break;
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_context::TokenizerKind;

    const FULL: &str = r#"
        [server]
        host = "127.0.0.1"
        port = 3000

        [cors]
        enabled = true
        origins = ["http://localhost:5173"]

        [storage]
        backend = "mongodb"
        database = "lumen_test"

        [llm]
        chat_model = "gpt-4o"
        fast_model = "gpt-4o-mini"
        embedding_model = "text-embedding-3-small"
        request_timeout_secs = 60
        max_retries = 2

        [engine.context]
        mmr_k = 6
        tokenizer = "cl100k"

        [engine.jobs]
        workers = 2

        [logging]
        level = "debug"
        format = "json"
    "#;

    #[test]
    fn test_config_structure() {
        let config: Config = toml::from_str(FULL).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.backend, StorageBackend::Mongodb);
        assert_eq!(config.storage.database, "lumen_test");
        assert_eq!(config.llm.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.engine.context.mmr_k, 6);
        assert_eq!(config.engine.context.tokenizer, TokenizerKind::Cl100k);
        assert_eq!(config.engine.jobs.workers, 2);
        // untouched engine sections keep their defaults
        assert_eq!(config.engine.maintainer.leaf_window, 20);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str("[server]\nhost = \"0.0.0.0\"\nport = 8080\n").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(!config.cors.enabled);
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shipped_default_toml_parses() {
        let config: Config = toml::from_str(include_str!("../config/default.toml")).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.engine.notifier.keepalive_secs, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_fills_models() {
        let config: Config = toml::from_str(FULL).unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.responder.chat_model.as_deref(), Some("gpt-4o"));
        assert_eq!(engine.responder.fast_model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_env_overrides_map_onto_sections() {
        let vars = vec![
            ("SERVER_PORT".to_string(), "9000".to_string()),
            ("LLM_CHAT_MODEL".to_string(), "gpt-4.1".to_string()),
            ("ENGINE_JOBS__WORKERS".to_string(), "6".to_string()),
            ("MONGODB_DATABASE".to_string(), "prod".to_string()),
            ("MONGODB_URI".to_string(), "mongodb://secret".to_string()),
            ("LOG_FORMAT".to_string(), "json".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let overrides = env_overrides(vars.into_iter());
        assert_eq!(
            overrides,
            vec![
                ("engine.jobs.workers".to_string(), "6".to_string()),
                ("llm.chat_model".to_string(), "gpt-4.1".to_string()),
                ("logging.format".to_string(), "json".to_string()),
                ("server.port".to_string(), "9000".to_string()),
                ("storage.database".to_string(), "prod".to_string()),
            ]
        );
    }

    #[test]
    fn test_overrides_win_over_file_values() {
        let mut builder = ConfigLoader::builder()
            .add_source(config::File::from_str(FULL, config::FileFormat::Toml));
        for (key, value) in env_overrides(vec![("SERVER_PORT".to_string(), "9100".to_string())].into_iter()) {
            builder = builder.set_override(key, value).unwrap();
        }
        let config: Config = builder.build().unwrap().try_deserialize().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
