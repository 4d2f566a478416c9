use lumen_llm::LlmError;
use lumen_persist::PersistError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Store call failed: {0}")]
    Store(#[from] PersistError),

    #[error("Tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, ContextError>;
