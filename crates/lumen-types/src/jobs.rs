use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const CHAT_RESPOND: &str = "chat_respond";
pub const CHAT_MAINTAIN: &str = "chat_maintain";
pub const CHAT_PATH_INDEX: &str = "chat_path_index";
pub const CHAT_REBUILD: &str = "chat_rebuild";
pub const LEARNING_BUILD: &str = "learning_build";
pub const LEARNING_BUILD_PROGRESSIVE: &str = "learning_build_progressive";

pub const ENTITY_THREAD: &str = "chat_thread";
pub const ENTITY_TURN: &str = "chat_turn";
pub const ENTITY_PATH: &str = "path";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    /// Suspended at a waitpoint until the user replies
    WaitingUser,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Still pending or in progress
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::WaitingUser
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub job_type: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
    pub status: JobStatus,
    /// Pipeline stage, e.g. a waitpoint name
    #[serde(default)]
    pub stage: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Suspended at a waitpoint stage until the user answers
    pub fn is_waiting_on_user(&self) -> bool {
        match self.status {
            JobStatus::WaitingUser => true,
            JobStatus::Running => self
                .stage
                .as_deref()
                .map(|s| s.starts_with("waitpoint"))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Arguments for enqueueing a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_user_id: Uuid,
    pub job_type: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub payload: Value,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(
        owner_user_id: Uuid,
        job_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Option<Uuid>,
        payload: Value,
    ) -> Self {
        Self {
            owner_user_id,
            job_type: job_type.into(),
            entity_type: entity_type.into(),
            entity_id,
            payload,
            max_attempts: 5,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRespondPayload {
    pub turn_id: Uuid,
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMaintainPayload {
    pub thread_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRebuildPayload {
    pub thread_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPathIndexPayload {
    pub path_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runnable_statuses() {
        assert!(JobStatus::Queued.is_runnable());
        assert!(JobStatus::Running.is_runnable());
        assert!(JobStatus::WaitingUser.is_runnable());
        assert!(!JobStatus::Succeeded.is_runnable());
        assert!(!JobStatus::Failed.is_runnable());
    }

    #[test]
    fn test_respond_payload_defaults() {
        let raw = serde_json::json!({
            "turn_id": Uuid::nil(),
            "thread_id": Uuid::nil(),
            "user_id": Uuid::nil(),
            "user_message_id": Uuid::nil(),
            "assistant_message_id": Uuid::nil(),
        });
        let payload: ChatRespondPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.attempt, 0);
        assert!(payload.job_id.is_none());
    }
}
