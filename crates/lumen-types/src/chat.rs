use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Active,
    Archived,
}

/// A conversation owned by one user, optionally bound to a learning path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub path_id: Option<Uuid>,
    /// Build job driving this thread, if any
    pub job_id: Option<Uuid>,
    /// Next `seq` to allocate; messages occupy `1..next_seq`
    pub next_seq: i64,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(user_id: Uuid, title: impl Into<String>, path_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            path_id,
            job_id: None,
            next_seq: 1,
            status: ThreadStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Streaming,
    Done,
    Error,
}

/// Canonical chat log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub role: MessageRole,
    pub seq: i64,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Metadata `kind` tag, e.g. `path_intake_questions`
    pub fn kind(&self) -> Option<&str> {
        self.metadata.get("kind").and_then(|k| k.as_str())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields supplied when appending a message; the store assigns `id`, `seq` and timestamps
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub metadata: Value,
}

impl NewMessage {
    pub fn user(thread_id: Uuid, user_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            user_id,
            role: MessageRole::User,
            content: content.into(),
            status: MessageStatus::Sent,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn assistant_placeholder(thread_id: Uuid, user_id: Uuid) -> Self {
        Self {
            thread_id,
            user_id,
            role: MessageRole::Assistant,
            content: String::new(),
            status: MessageStatus::Streaming,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Queued,
    Running,
    Done,
    Error,
}

/// One user message to assistant reply exchange; the idempotency key for `chat_respond`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub user_id: Uuid,
    pub thread_id: Uuid,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub job_id: Option<Uuid>,
    pub status: TurnStatus,
    pub attempt: u32,
    #[serde(default)]
    pub retrieval_trace: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        user_id: Uuid,
        thread_id: Uuid,
        user_message_id: Uuid,
        assistant_message_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            thread_id,
            user_message_id,
            assistant_message_id,
            job_id: None,
            status: TurnStatus::Queued,
            attempt: 0,
            retrieval_trace: Value::Null,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-thread maintenance watermarks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: Uuid,
    pub last_indexed_seq: i64,
    pub last_summarized_seq: i64,
    pub last_graph_seq: i64,
    pub last_memory_seq: i64,
    /// Bumped by every rebuild; cursor writes from an older epoch are dropped
    #[serde(default)]
    pub epoch: i64,
    pub openai_conversation_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadState {
    pub fn new(thread_id: Uuid) -> Self {
        Self {
            thread_id,
            last_indexed_seq: 0,
            last_summarized_seq: 0,
            last_graph_seq: 0,
            last_memory_seq: 0,
            epoch: 0,
            openai_conversation_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn cursor(&self, cursor: Cursor) -> i64 {
        match cursor {
            Cursor::Indexed => self.last_indexed_seq,
            Cursor::Summarized => self.last_summarized_seq,
            Cursor::Graph => self.last_graph_seq,
            Cursor::Memory => self.last_memory_seq,
        }
    }

    /// Raise a cursor to `proposed` if that is ahead; never lowers it
    pub fn advance(&mut self, cursor: Cursor, proposed: i64) -> i64 {
        let slot = match cursor {
            Cursor::Indexed => &mut self.last_indexed_seq,
            Cursor::Summarized => &mut self.last_summarized_seq,
            Cursor::Graph => &mut self.last_graph_seq,
            Cursor::Memory => &mut self.last_memory_seq,
        };
        *slot = (*slot).max(proposed);
        *slot
    }
}

/// The four maintainer watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    Indexed,
    Summarized,
    Graph,
    Memory,
}

impl Cursor {
    pub const ALL: [Cursor; 4] = [
        Cursor::Indexed,
        Cursor::Summarized,
        Cursor::Graph,
        Cursor::Memory,
    ];

    pub fn field_name(&self) -> &'static str {
        match self {
            Cursor::Indexed => "last_indexed_seq",
            Cursor::Summarized => "last_summarized_seq",
            Cursor::Graph => "last_graph_seq",
            Cursor::Memory => "last_memory_seq",
        }
    }
}
