use async_trait::async_trait;
use lumen_types::{
    ChatMessage, Cursor, MessageStatus, NewMessage, Thread, ThreadState, Turn,
};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn create_thread(&self, thread: Thread) -> Result<Thread>;

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>>;

    /// Most recently updated first
    async fn list_threads(&self, user_id: Uuid, limit: usize) -> Result<Vec<Thread>>;

    async fn set_thread_job(&self, thread_id: Uuid, job_id: Option<Uuid>) -> Result<()>;

    async fn touch_thread(&self, thread_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Append a message at `seq = thread.next_seq` and bump `next_seq`, atomically
    async fn append_message(&self, message: NewMessage) -> Result<ChatMessage>;

    /// Append two messages of one thread at consecutive seqs `N` and `N+1`
    async fn append_pair(&self, first: NewMessage, second: NewMessage) -> Result<(ChatMessage, ChatMessage)>;

    async fn get_message(&self, message_id: Uuid) -> Result<Option<ChatMessage>>;

    /// Last `limit` non-deleted messages, ascending by `seq`
    async fn list_recent(&self, thread_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Messages with `after_seq < seq <= up_to_seq`, ascending
    async fn list_range(
        &self,
        thread_id: Uuid,
        after_seq: i64,
        up_to_seq: i64,
    ) -> Result<Vec<ChatMessage>>;

    /// Page of up to `limit` messages strictly before `before_seq`, ascending
    async fn list_before(
        &self,
        thread_id: Uuid,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;

    /// Latest message whose metadata `kind` equals `kind`
    async fn last_of_kind(&self, thread_id: Uuid, kind: &str) -> Result<Option<ChatMessage>>;

    async fn update_content(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
    ) -> Result<()>;

    async fn finalize_message(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
        metadata: Value,
    ) -> Result<()>;

    /// Full-text search over message content within a thread, best match first
    async fn search_messages(
        &self,
        thread_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(ChatMessage, f32)>>;
}

#[async_trait]
pub trait TurnRepository: Send + Sync {
    async fn create_turn(&self, turn: Turn) -> Result<Turn>;

    async fn get_turn(&self, turn_id: Uuid) -> Result<Option<Turn>>;

    async fn update_turn(&self, turn: &Turn) -> Result<()>;
}

#[async_trait]
pub trait ThreadStateRepository: Send + Sync {
    /// Load the thread's state row, creating it at zero cursors if absent
    async fn ensure_state(&self, thread_id: Uuid) -> Result<ThreadState>;

    /// `cursor := max(cursor, proposed)`; returns the stored value
    async fn advance_cursor(&self, thread_id: Uuid, cursor: Cursor, proposed: i64) -> Result<i64>;

    /// Like `advance_cursor`, but only while the state is still at `epoch`.
    /// `None` means a rebuild reset the cursors since `epoch` was read.
    async fn advance_cursor_in_epoch(
        &self,
        thread_id: Uuid,
        epoch: i64,
        cursor: Cursor,
        proposed: i64,
    ) -> Result<Option<i64>>;

    /// Store `conversation_id` unless one is already set; returns the effective id
    async fn set_conversation_id(&self, thread_id: Uuid, conversation_id: &str) -> Result<String>;

    /// Zero all four cursors and bump the epoch; returns the new epoch.
    /// Only the rebuild job calls this.
    async fn reset_cursors(&self, thread_id: Uuid) -> Result<i64>;
}
