use async_trait::async_trait;
use bson::DateTime as BsonDateTime;
use futures::TryStreamExt;
use lumen_types::{ChatMessage, Cursor, MessageStatus, NewMessage, Thread, ThreadState, Turn};
use mongodb::bson::{doc, Document};
use mongodb::options::ReturnDocument;
use serde_json::Value;
use uuid::Uuid;

use crate::dbs::mongo::client::MongoStore;
use crate::dbs::mongo::models::{MongoMessage, MongoThread, MongoThreadState, MongoTurn};
use crate::error::{PersistError, Result};
use crate::memory::text::{match_score, terms};
use crate::repositories::{
    MessageRepository, ThreadRepository, ThreadStateRepository, TurnRepository,
};

impl MongoStore {
    async fn find_messages(
        &self,
        filter: Document,
        sort: Document,
        limit: Option<i64>,
    ) -> Result<Vec<ChatMessage>> {
        let mut find = self.messages.find(filter).sort(sort);
        if let Some(limit) = limit {
            find = find.limit(limit);
        }
        let rows: Vec<MongoMessage> = find.await?.try_collect().await?;
        rows.into_iter().map(ChatMessage::try_from).collect()
    }

    /// Claim `n` consecutive seqs; returns the first one
    async fn reserve_seqs(&self, thread_id: Uuid, n: i64) -> Result<(i64, BsonDateTime)> {
        let now = BsonDateTime::now();
        // $inc is atomic per document, so each caller gets its own range
        let thread = self
            .threads
            .find_one_and_update(
                doc! { "_id": thread_id.to_string() },
                doc! { "$inc": { "next_seq": n }, "$set": { "updated_at": now } },
            )
            .return_document(ReturnDocument::Before)
            .await?
            .ok_or(PersistError::ThreadNotFound(thread_id))?;
        Ok((thread.next_seq, now))
    }

    async fn state_row(&self, thread_id: Uuid) -> Result<MongoThreadState> {
        let now = BsonDateTime::now();
        self.states
            .find_one_and_update(
                doc! { "_id": thread_id.to_string() },
                doc! { "$setOnInsert": {
                    "last_indexed_seq": 0_i64,
                    "last_summarized_seq": 0_i64,
                    "last_graph_seq": 0_i64,
                    "last_memory_seq": 0_i64,
                    "epoch": 0_i64,
                    "openai_conversation_id": null,
                    "updated_at": now,
                } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| PersistError::Internal(format!("state upsert for {} returned nothing", thread_id)))
    }
}

fn message_row(message: NewMessage, seq: i64, now: BsonDateTime) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4(),
        thread_id: message.thread_id,
        user_id: message.user_id,
        role: message.role,
        seq,
        content: message.content,
        status: message.status,
        metadata: message.metadata,
        created_at: now.to_chrono(),
        updated_at: now.to_chrono(),
        deleted_at: None,
    }
}

fn live_messages(thread_id: Uuid) -> Document {
    doc! { "thread_id": thread_id.to_string(), "deleted_at": null }
}

#[async_trait]
impl ThreadRepository for MongoStore {
    async fn create_thread(&self, thread: Thread) -> Result<Thread> {
        self.threads.insert_one(MongoThread::from(&thread)).await?;
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>> {
        self.threads
            .find_one(doc! { "_id": thread_id.to_string() })
            .await?
            .map(Thread::try_from)
            .transpose()
    }

    async fn list_threads(&self, user_id: Uuid, limit: usize) -> Result<Vec<Thread>> {
        let rows: Vec<MongoThread> = self
            .threads
            .find(doc! { "user_id": user_id.to_string() })
            .sort(doc! { "updated_at": -1 })
            .limit(limit as i64)
            .await?
            .try_collect()
            .await?;
        rows.into_iter().map(Thread::try_from).collect()
    }

    async fn set_thread_job(&self, thread_id: Uuid, job_id: Option<Uuid>) -> Result<()> {
        let result = self
            .threads
            .update_one(
                doc! { "_id": thread_id.to_string() },
                doc! { "$set": {
                    "job_id": job_id.map(|id| id.to_string()),
                    "updated_at": BsonDateTime::now(),
                } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(PersistError::ThreadNotFound(thread_id));
        }
        Ok(())
    }

    async fn touch_thread(&self, thread_id: Uuid) -> Result<()> {
        self.threads
            .update_one(
                doc! { "_id": thread_id.to_string() },
                doc! { "$set": { "updated_at": BsonDateTime::now() } },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MongoStore {
    async fn append_message(&self, message: NewMessage) -> Result<ChatMessage> {
        let (seq, now) = self.reserve_seqs(message.thread_id, 1).await?;
        let row = message_row(message, seq, now);
        self.messages.insert_one(MongoMessage::from(&row)).await?;
        Ok(row)
    }

    async fn append_pair(&self, first: NewMessage, second: NewMessage) -> Result<(ChatMessage, ChatMessage)> {
        if first.thread_id != second.thread_id {
            return Err(PersistError::Conflict("message pair spans two threads".to_string()));
        }
        let (seq, now) = self.reserve_seqs(first.thread_id, 2).await?;
        let first = message_row(first, seq, now);
        let second = message_row(second, seq + 1, now);
        self.messages
            .insert_many([MongoMessage::from(&first), MongoMessage::from(&second)])
            .await?;
        Ok((first, second))
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<ChatMessage>> {
        self.messages
            .find_one(doc! { "_id": message_id.to_string() })
            .await?
            .map(ChatMessage::try_from)
            .transpose()
    }

    async fn list_recent(&self, thread_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
        let mut rows = self
            .find_messages(live_messages(thread_id), doc! { "seq": -1 }, Some(limit as i64))
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn list_range(
        &self,
        thread_id: Uuid,
        after_seq: i64,
        up_to_seq: i64,
    ) -> Result<Vec<ChatMessage>> {
        let mut filter = live_messages(thread_id);
        filter.insert("seq", doc! { "$gt": after_seq, "$lte": up_to_seq });
        self.find_messages(filter, doc! { "seq": 1 }, None).await
    }

    async fn list_before(
        &self,
        thread_id: Uuid,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let mut filter = live_messages(thread_id);
        if let Some(before) = before_seq {
            filter.insert("seq", doc! { "$lt": before });
        }
        let mut rows = self
            .find_messages(filter, doc! { "seq": -1 }, Some(limit as i64))
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn last_of_kind(&self, thread_id: Uuid, kind: &str) -> Result<Option<ChatMessage>> {
        let mut filter = live_messages(thread_id);
        filter.insert("kind", kind);
        Ok(self
            .find_messages(filter, doc! { "seq": -1 }, Some(1))
            .await?
            .into_iter()
            .next())
    }

    async fn update_content(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
    ) -> Result<()> {
        let result = self
            .messages
            .update_one(
                doc! { "_id": message_id.to_string() },
                doc! { "$set": {
                    "content": content,
                    "status": bson::to_bson(&status)?,
                    "updated_at": BsonDateTime::now(),
                } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(PersistError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn finalize_message(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
        metadata: Value,
    ) -> Result<()> {
        let kind = metadata.get("kind").and_then(|k| k.as_str()).map(str::to_string);
        let result = self
            .messages
            .update_one(
                doc! { "_id": message_id.to_string() },
                doc! { "$set": {
                    "content": content,
                    "status": bson::to_bson(&status)?,
                    "metadata": bson::to_bson(&metadata)?,
                    "kind": kind,
                    "updated_at": BsonDateTime::now(),
                } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(PersistError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn search_messages(
        &self,
        thread_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(ChatMessage, f32)>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .find_messages(live_messages(thread_id), doc! { "seq": -1 }, None)
            .await?;
        let mut hits: Vec<(ChatMessage, f32)> = rows
            .into_iter()
            .map(|m| {
                let score = match_score(&query_terms, &m.content);
                (m, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        // rows arrive newest first; the stable sort keeps that order among equal scores
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait]
impl TurnRepository for MongoStore {
    async fn create_turn(&self, turn: Turn) -> Result<Turn> {
        self.turns.insert_one(MongoTurn::from(&turn)).await?;
        Ok(turn)
    }

    async fn get_turn(&self, turn_id: Uuid) -> Result<Option<Turn>> {
        self.turns
            .find_one(doc! { "_id": turn_id.to_string() })
            .await?
            .map(Turn::try_from)
            .transpose()
    }

    async fn update_turn(&self, turn: &Turn) -> Result<()> {
        let result = self
            .turns
            .replace_one(doc! { "_id": turn.id.to_string() }, MongoTurn::from(turn))
            .await?;
        if result.matched_count == 0 {
            return Err(PersistError::TurnNotFound(turn.id));
        }
        Ok(())
    }
}

#[async_trait]
impl ThreadStateRepository for MongoStore {
    async fn ensure_state(&self, thread_id: Uuid) -> Result<ThreadState> {
        ThreadState::try_from(self.state_row(thread_id).await?)
    }

    async fn advance_cursor(&self, thread_id: Uuid, cursor: Cursor, proposed: i64) -> Result<i64> {
        self.state_row(thread_id).await?;
        let mut max = Document::new();
        max.insert(cursor.field_name(), proposed);
        let row = self
            .states
            .find_one_and_update(
                doc! { "_id": thread_id.to_string() },
                doc! { "$max": max, "$set": { "updated_at": BsonDateTime::now() } },
            )
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| PersistError::Internal(format!("state for {} vanished", thread_id)))?;
        Ok(ThreadState::try_from(row)?.cursor(cursor))
    }

    async fn advance_cursor_in_epoch(
        &self,
        thread_id: Uuid,
        epoch: i64,
        cursor: Cursor,
        proposed: i64,
    ) -> Result<Option<i64>> {
        self.state_row(thread_id).await?;
        let mut max = Document::new();
        max.insert(cursor.field_name(), proposed);
        // rows written before the epoch field existed count as epoch 0
        let filter = if epoch == 0 {
            doc! { "_id": thread_id.to_string(), "$or": [ { "epoch": 0_i64 }, { "epoch": { "$exists": false } } ] }
        } else {
            doc! { "_id": thread_id.to_string(), "epoch": epoch }
        };
        let row = self
            .states
            .find_one_and_update(filter, doc! { "$max": max, "$set": { "updated_at": BsonDateTime::now() } })
            .return_document(ReturnDocument::After)
            .await?;
        row.map(|r| ThreadState::try_from(r).map(|s| s.cursor(cursor)))
            .transpose()
    }

    async fn set_conversation_id(&self, thread_id: Uuid, conversation_id: &str) -> Result<String> {
        self.state_row(thread_id).await?;
        self.states
            .update_one(
                doc! { "_id": thread_id.to_string(), "openai_conversation_id": null },
                doc! { "$set": {
                    "openai_conversation_id": conversation_id,
                    "updated_at": BsonDateTime::now(),
                } },
            )
            .await?;
        let state = self.state_row(thread_id).await?;
        Ok(state
            .openai_conversation_id
            .unwrap_or_else(|| conversation_id.to_string()))
    }

    async fn reset_cursors(&self, thread_id: Uuid) -> Result<i64> {
        self.state_row(thread_id).await?;
        let row = self
            .states
            .find_one_and_update(
                doc! { "_id": thread_id.to_string() },
                doc! {
                    "$set": {
                        "last_indexed_seq": 0_i64,
                        "last_summarized_seq": 0_i64,
                        "last_graph_seq": 0_i64,
                        "last_memory_seq": 0_i64,
                        "updated_at": BsonDateTime::now(),
                    },
                    "$inc": { "epoch": 1_i64 },
                },
            )
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| PersistError::Internal(format!("state for {} vanished", thread_id)))?;
        Ok(row.epoch)
    }
}
