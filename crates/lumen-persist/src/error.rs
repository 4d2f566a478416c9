use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(Uuid),

    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),

    #[error("Turn not found: {0}")]
    TurnNotFound(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "mongodb")]
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[cfg(feature = "mongodb")]
    #[error("BSON serialization error: {0}")]
    BsonSerialization(#[from] bson::ser::Error),

    #[cfg(feature = "mongodb")]
    #[error("BSON deserialization error: {0}")]
    BsonDeserialization(#[from] bson::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PersistError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PersistError::ThreadNotFound(_)
                | PersistError::MessageNotFound(_)
                | PersistError::TurnNotFound(_)
                | PersistError::JobNotFound(_)
                | PersistError::NotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;
