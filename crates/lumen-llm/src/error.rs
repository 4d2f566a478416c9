use thiserror::Error;

/// Errors surfaced by an LLM provider
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Structured output violated schema '{schema}': {reason}")]
    SchemaViolation { schema: String, reason: String },

    #[error("Model refused: {0}")]
    Refusal(String),

    #[error("Embedding missing for input index {0}")]
    MissingEmbedding(usize),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl LlmError {
    /// 408, 429, 5xx, transport failures, timeouts and malformed structured
    /// output are worth another attempt; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            LlmError::Transport(_) | LlmError::Timeout(_) => true,
            LlmError::Decode(_) | LlmError::SchemaViolation { .. } => true,
            LlmError::MissingEmbedding(_) => true,
            LlmError::Refusal(_) | LlmError::Config(_) => false,
        }
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self, LlmError::Refusal(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return LlmError::Timeout(0);
        }
        if let Some(status) = err.status() {
            return LlmError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        if err.is_decode() {
            return LlmError::Decode(err.to_string());
        }
        LlmError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503] {
            let err = LlmError::Http { status, body: String::new() };
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
        for status in [400, 401, 403, 404, 422] {
            let err = LlmError::Http { status, body: String::new() };
            assert!(!err.is_retryable(), "{} should not be retryable", status);
        }
    }

    #[test]
    fn test_refusal_is_terminal() {
        let err = LlmError::Refusal("no".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_refusal());
    }

    #[test]
    fn test_malformed_output_is_retryable() {
        let err = LlmError::SchemaViolation {
            schema: "summary".to_string(),
            reason: "missing summary_md".to_string(),
        };
        assert!(err.is_retryable());
    }
}
