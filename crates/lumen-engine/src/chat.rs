//! Inbound chat operations behind the HTTP layer

use lumen_persist::Stores;
use lumen_types::jobs::{CHAT_RESPOND, ENTITY_TURN};
use lumen_types::{ChatMessage, ChatRespondPayload, Job, NewJob, NewMessage, Thread, Turn};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::notify::{Notifier, TurnRef};

const DEFAULT_TITLE: &str = "New chat";
const MAX_PAGE: usize = 200;
const MAX_CONTENT_CHARS: usize = 32_000;

/// Result of posting a user message
#[derive(Debug, Clone, Serialize)]
pub struct PostedTurn {
    pub turn: Turn,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
    pub job_id: Uuid,
}

#[derive(Clone)]
pub struct ChatService {
    stores: Stores,
    notifier: Notifier,
    respond_attempts: u32,
}

impl ChatService {
    pub fn new(stores: Stores, notifier: Notifier) -> Self {
        Self {
            stores,
            notifier,
            respond_attempts: 5,
        }
    }

    pub fn with_respond_attempts(mut self, attempts: u32) -> Self {
        self.respond_attempts = attempts;
        self
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    async fn owned_thread(&self, user_id: Uuid, thread_id: Uuid) -> Result<Thread> {
        let thread = self
            .stores
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| EngineError::not_found("thread", thread_id))?;
        if !thread.is_owned_by(user_id) {
            return Err(EngineError::AuthMismatch(thread_id));
        }
        Ok(thread)
    }

    #[instrument(skip(self, title), fields(user_id = %user_id))]
    pub async fn create_thread(&self, user_id: Uuid, title: Option<String>, path_id: Option<Uuid>) -> Result<Thread> {
        if let Some(path_id) = path_id {
            let path = self
                .stores
                .paths
                .get_path(path_id)
                .await?
                .ok_or_else(|| EngineError::not_found("path", path_id))?;
            if path.user_id != user_id {
                return Err(EngineError::AuthMismatch(path_id));
            }
        }
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let thread = self.stores.threads.create_thread(Thread::new(user_id, title, path_id)).await?;
        self.stores.thread_state.ensure_state(thread.id).await?;
        info!(thread_id = %thread.id, "thread created");
        Ok(thread)
    }

    pub async fn get_thread(&self, user_id: Uuid, thread_id: Uuid) -> Result<Thread> {
        self.owned_thread(user_id, thread_id).await
    }

    pub async fn list_threads(&self, user_id: Uuid, limit: usize) -> Result<Vec<Thread>> {
        Ok(self.stores.threads.list_threads(user_id, limit.clamp(1, MAX_PAGE)).await?)
    }

    /// Page of messages before `before_seq` (newest page when `None`), ascending by seq
    pub async fn list_messages(
        &self,
        user_id: Uuid,
        thread_id: Uuid,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        self.owned_thread(user_id, thread_id).await?;
        Ok(self
            .stores
            .messages
            .list_before(thread_id, before_seq, limit.clamp(1, MAX_PAGE))
            .await?)
    }

    /// Append the user message and an assistant placeholder, then queue the reply
    #[instrument(skip(self, content), fields(user_id = %user_id, thread_id = %thread_id))]
    pub async fn post_message(&self, user_id: Uuid, thread_id: Uuid, content: &str) -> Result<PostedTurn> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::InputInvalid("message content is empty".into()));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(EngineError::InputInvalid(format!(
                "message content exceeds {} characters",
                MAX_CONTENT_CHARS
            )));
        }
        let thread = self.owned_thread(user_id, thread_id).await?;

        let (user_message, assistant_message) = self
            .stores
            .messages
            .append_pair(
                NewMessage::user(thread.id, user_id, content),
                NewMessage::assistant_placeholder(thread.id, user_id),
            )
            .await?;
        let mut turn = self
            .stores
            .turns
            .create_turn(Turn::new(user_id, thread.id, user_message.id, assistant_message.id))
            .await?;

        let job = self.enqueue_respond(&turn).await?;
        turn.job_id = Some(job.id);
        self.stores.turns.update_turn(&turn).await?;
        self.stores.threads.touch_thread(thread.id).await?;

        let turn_ref = TurnRef::new(turn.id, 0);
        self.notifier.message_created(user_id, &user_message, turn_ref);
        self.notifier.message_created(user_id, &assistant_message, turn_ref);

        info!(turn_id = %turn.id, seq = user_message.seq, job_id = %job.id, "message posted");
        Ok(PostedTurn {
            turn,
            user_message,
            assistant_message,
            job_id: job.id,
        })
    }

    async fn enqueue_respond(&self, turn: &Turn) -> Result<Job> {
        let payload = ChatRespondPayload {
            turn_id: turn.id,
            thread_id: turn.thread_id,
            user_id: turn.user_id,
            user_message_id: turn.user_message_id,
            assistant_message_id: turn.assistant_message_id,
            job_id: None,
            attempt: 0,
        };
        let job = NewJob::new(
            turn.user_id,
            CHAT_RESPOND,
            ENTITY_TURN,
            Some(turn.id),
            serde_json::to_value(payload)?,
        )
        .with_max_attempts(self.respond_attempts);
        Ok(self.stores.jobs.enqueue(job).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotifierConfig;
    use lumen_types::{MessageRole, MessageStatus, SseEvent};

    fn service() -> ChatService {
        ChatService::new(Stores::in_memory(), Notifier::from_config(&NotifierConfig::default()))
    }

    #[tokio::test]
    async fn test_post_allocates_consecutive_seqs() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.create_thread(user, None, None).await.unwrap();
        assert_eq!(thread.title, DEFAULT_TITLE);

        let mut sub = chat.notifier().subscribe(user);
        let posted = chat.post_message(user, thread.id, "  what is a monad?  ").await.unwrap();
        assert_eq!(posted.user_message.seq, 1);
        assert_eq!(posted.user_message.content, "what is a monad?");
        assert_eq!(posted.assistant_message.seq, 2);
        assert_eq!(posted.assistant_message.role, MessageRole::Assistant);
        assert_eq!(posted.assistant_message.status, MessageStatus::Streaming);
        assert_eq!(posted.turn.job_id, Some(posted.job_id));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event, SseEvent::MessageCreated);

        let again = chat.post_message(user, thread.id, "and a functor?").await.unwrap();
        assert_eq!(again.user_message.seq, 3);
        assert_eq!(again.assistant_message.seq, 4);
    }

    #[tokio::test]
    async fn test_other_users_are_rejected() {
        let chat = service();
        let owner = Uuid::new_v4();
        let thread = chat.create_thread(owner, Some("Rust".into()), None).await.unwrap();
        let stranger = Uuid::new_v4();

        let err = chat.post_message(stranger, thread.id, "hi").await.unwrap_err();
        assert!(matches!(err, EngineError::AuthMismatch(_)));
        let err = chat.list_messages(stranger, thread.id, None, 20).await.unwrap_err();
        assert!(matches!(err, EngineError::AuthMismatch(_)));
    }

    #[tokio::test]
    async fn test_empty_message_is_invalid() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.create_thread(user, None, None).await.unwrap();
        let err = chat.post_message(user, thread.id, "   ").await.unwrap_err();
        assert!(matches!(err, EngineError::InputInvalid(_)));
    }

    #[tokio::test]
    async fn test_list_messages_pages_backwards() {
        let chat = service();
        let user = Uuid::new_v4();
        let thread = chat.create_thread(user, None, None).await.unwrap();
        for i in 0..3 {
            chat.post_message(user, thread.id, &format!("question {}", i)).await.unwrap();
        }
        let latest = chat.list_messages(user, thread.id, None, 2).await.unwrap();
        assert_eq!(latest.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![5, 6]);
        let older = chat.list_messages(user, thread.id, Some(5), 2).await.unwrap();
        assert_eq!(older.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4]);
    }
}
