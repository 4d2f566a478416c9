use lumen_context::ContextError;
use lumen_llm::LlmError;
use lumen_persist::PersistError;
use thiserror::Error;

/// Coarse failure class used by the job runtime and the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputInvalid,
    AuthMismatch,
    NotFound,
    DependencyUnavailable,
    Retryable,
    NonRetryable,
    ModelRefusal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Thread {0} is not owned by the caller")]
    AuthMismatch(uuid::Uuid),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Transient failure: {0}")]
    Retryable(String),

    #[error("Permanent failure: {0}")]
    NonRetryable(String),

    #[error("Model refused: {0}")]
    ModelRefusal(String),

    #[error("Cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InputInvalid(_) => ErrorKind::InputInvalid,
            EngineError::AuthMismatch(_) => ErrorKind::AuthMismatch,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::DependencyUnavailable(_) => ErrorKind::DependencyUnavailable,
            EngineError::Retryable(_) => ErrorKind::Retryable,
            EngineError::NonRetryable(_) | EngineError::Cancelled => ErrorKind::NonRetryable,
            EngineError::ModelRefusal(_) => ErrorKind::ModelRefusal,
        }
    }

    /// Whether the job runtime should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Retryable | ErrorKind::DependencyUnavailable
        )
    }
}

impl From<LlmError> for EngineError {
    fn from(err: LlmError) -> Self {
        if err.is_refusal() {
            EngineError::ModelRefusal(err.to_string())
        } else if err.is_retryable() {
            EngineError::Retryable(err.to_string())
        } else {
            EngineError::NonRetryable(err.to_string())
        }
    }
}

impl From<PersistError> for EngineError {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::ThreadNotFound(id) => EngineError::not_found("thread", id),
            PersistError::MessageNotFound(id) => EngineError::not_found("message", id),
            PersistError::TurnNotFound(id) => EngineError::not_found("turn", id),
            PersistError::JobNotFound(id) => EngineError::not_found("job", id),
            PersistError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            PersistError::Serialization(e) => EngineError::NonRetryable(e.to_string()),
            other => EngineError::DependencyUnavailable(other.to_string()),
        }
    }
}

impl From<ContextError> for EngineError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::InputInvalid(msg) => EngineError::InputInvalid(msg),
            ContextError::Llm(e) => e.into(),
            ContextError::Store(e) => e.into(),
            ContextError::Tokenizer(msg) => EngineError::NonRetryable(msg),
            ContextError::Timeout(ms) => EngineError::Retryable(format!("timed out after {} ms", ms)),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InputInvalid(format!("malformed payload: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_errors_map_onto_kinds() {
        let err: EngineError = LlmError::Http { status: 429, body: String::new() }.into();
        assert_eq!(err.kind(), ErrorKind::Retryable);

        let err: EngineError = LlmError::Http { status: 400, body: String::new() }.into();
        assert_eq!(err.kind(), ErrorKind::NonRetryable);
        assert!(!err.is_retryable());

        let err: EngineError = LlmError::Refusal("no".into()).into();
        assert_eq!(err.kind(), ErrorKind::ModelRefusal);
    }

    #[test]
    fn test_store_errors_map_onto_kinds() {
        let id = uuid::Uuid::new_v4();
        let err: EngineError = PersistError::ThreadNotFound(id).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: EngineError = PersistError::Internal("pool closed".into()).into();
        assert_eq!(err.kind(), ErrorKind::DependencyUnavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_context_input_error_stays_invalid() {
        let err: EngineError = ContextError::InputInvalid("empty".into()).into();
        assert_eq!(err.kind(), ErrorKind::InputInvalid);
    }
}
