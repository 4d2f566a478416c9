//! MongoDB document shapes
//!
//! Ids are stored as hyphenated strings and timestamps as native BSON dates so that
//! range filters (`run_after <= now`) and sorts behave.

use bson::DateTime as BsonDateTime;
use lumen_types::{
    ChatMessage, Job, JobStatus, MessageRole, MessageStatus, Thread, ThreadState, ThreadStatus,
    Turn, TurnStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PersistError, Result};

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| PersistError::Internal(format!("bad id {:?}: {}", raw, e)))
}

fn parse_opt_id(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_id).transpose()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoThread {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub path_id: Option<String>,
    pub job_id: Option<String>,
    pub next_seq: i64,
    pub status: ThreadStatus,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

impl From<&Thread> for MongoThread {
    fn from(t: &Thread) -> Self {
        Self {
            id: t.id.to_string(),
            user_id: t.user_id.to_string(),
            title: t.title.clone(),
            path_id: t.path_id.map(|id| id.to_string()),
            job_id: t.job_id.map(|id| id.to_string()),
            next_seq: t.next_seq,
            status: t.status,
            created_at: BsonDateTime::from_chrono(t.created_at),
            updated_at: BsonDateTime::from_chrono(t.updated_at),
        }
    }
}

impl TryFrom<MongoThread> for Thread {
    type Error = PersistError;

    fn try_from(t: MongoThread) -> Result<Self> {
        Ok(Self {
            id: parse_id(&t.id)?,
            user_id: parse_id(&t.user_id)?,
            title: t.title,
            path_id: parse_opt_id(t.path_id)?,
            job_id: parse_opt_id(t.job_id)?,
            next_seq: t.next_seq,
            status: t.status,
            created_at: t.created_at.to_chrono(),
            updated_at: t.updated_at.to_chrono(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub thread_id: String,
    pub user_id: String,
    pub role: MessageRole,
    pub seq: i64,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: Value,
    /// Denormalized `metadata.kind` for lookups
    pub kind: Option<String>,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
    pub deleted_at: Option<BsonDateTime>,
}

impl From<&ChatMessage> for MongoMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            id: m.id.to_string(),
            thread_id: m.thread_id.to_string(),
            user_id: m.user_id.to_string(),
            role: m.role,
            seq: m.seq,
            content: m.content.clone(),
            status: m.status,
            metadata: m.metadata.clone(),
            kind: m.kind().map(str::to_string),
            created_at: BsonDateTime::from_chrono(m.created_at),
            updated_at: BsonDateTime::from_chrono(m.updated_at),
            deleted_at: m.deleted_at.map(BsonDateTime::from_chrono),
        }
    }
}

impl TryFrom<MongoMessage> for ChatMessage {
    type Error = PersistError;

    fn try_from(m: MongoMessage) -> Result<Self> {
        Ok(Self {
            id: parse_id(&m.id)?,
            thread_id: parse_id(&m.thread_id)?,
            user_id: parse_id(&m.user_id)?,
            role: m.role,
            seq: m.seq,
            content: m.content,
            status: m.status,
            metadata: m.metadata,
            created_at: m.created_at.to_chrono(),
            updated_at: m.updated_at.to_chrono(),
            deleted_at: m.deleted_at.map(|d| d.to_chrono()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoTurn {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub thread_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub job_id: Option<String>,
    pub status: TurnStatus,
    pub attempt: i64,
    #[serde(default)]
    pub retrieval_trace: Value,
    pub started_at: Option<BsonDateTime>,
    pub completed_at: Option<BsonDateTime>,
    pub created_at: BsonDateTime,
}

impl From<&Turn> for MongoTurn {
    fn from(t: &Turn) -> Self {
        Self {
            id: t.id.to_string(),
            user_id: t.user_id.to_string(),
            thread_id: t.thread_id.to_string(),
            user_message_id: t.user_message_id.to_string(),
            assistant_message_id: t.assistant_message_id.to_string(),
            job_id: t.job_id.map(|id| id.to_string()),
            status: t.status,
            attempt: i64::from(t.attempt),
            retrieval_trace: t.retrieval_trace.clone(),
            started_at: t.started_at.map(BsonDateTime::from_chrono),
            completed_at: t.completed_at.map(BsonDateTime::from_chrono),
            created_at: BsonDateTime::from_chrono(t.created_at),
        }
    }
}

impl TryFrom<MongoTurn> for Turn {
    type Error = PersistError;

    fn try_from(t: MongoTurn) -> Result<Self> {
        Ok(Self {
            id: parse_id(&t.id)?,
            user_id: parse_id(&t.user_id)?,
            thread_id: parse_id(&t.thread_id)?,
            user_message_id: parse_id(&t.user_message_id)?,
            assistant_message_id: parse_id(&t.assistant_message_id)?,
            job_id: parse_opt_id(t.job_id)?,
            status: t.status,
            attempt: t.attempt.max(0) as u32,
            retrieval_trace: t.retrieval_trace,
            started_at: t.started_at.map(|d| d.to_chrono()),
            completed_at: t.completed_at.map(|d| d.to_chrono()),
            created_at: t.created_at.to_chrono(),
        })
    }
}

/// Keyed by thread id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoThreadState {
    #[serde(rename = "_id")]
    pub thread_id: String,
    pub last_indexed_seq: i64,
    pub last_summarized_seq: i64,
    pub last_graph_seq: i64,
    pub last_memory_seq: i64,
    #[serde(default)]
    pub epoch: i64,
    pub openai_conversation_id: Option<String>,
    pub updated_at: BsonDateTime,
}

impl TryFrom<MongoThreadState> for ThreadState {
    type Error = PersistError;

    fn try_from(s: MongoThreadState) -> Result<Self> {
        Ok(Self {
            thread_id: parse_id(&s.thread_id)?,
            last_indexed_seq: s.last_indexed_seq,
            last_summarized_seq: s.last_summarized_seq,
            last_graph_seq: s.last_graph_seq,
            last_memory_seq: s.last_memory_seq,
            epoch: s.epoch,
            openai_conversation_id: s.openai_conversation_id,
            updated_at: s.updated_at.to_chrono(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoJob {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner_user_id: String,
    pub job_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub attempt: i64,
    pub max_attempts: i64,
    pub run_after: BsonDateTime,
    pub locked_until: Option<BsonDateTime>,
    pub last_error: Option<String>,
    /// Set while the job is runnable; a unique sparse index makes enqueue dedup atomic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub created_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

impl TryFrom<MongoJob> for Job {
    type Error = PersistError;

    fn try_from(j: MongoJob) -> Result<Self> {
        Ok(Self {
            id: parse_id(&j.id)?,
            owner_user_id: parse_id(&j.owner_user_id)?,
            job_type: j.job_type,
            entity_type: j.entity_type,
            entity_id: parse_opt_id(j.entity_id)?,
            payload: j.payload,
            status: j.status,
            stage: j.stage,
            attempt: j.attempt.max(0) as u32,
            max_attempts: j.max_attempts.max(1) as u32,
            run_after: j.run_after.to_chrono(),
            locked_until: j.locked_until.map(|d| d.to_chrono()),
            last_error: j.last_error,
            created_at: j.created_at.to_chrono(),
            updated_at: j.updated_at.to_chrono(),
        })
    }
}

/// Dedup key shared by every runnable job of one (owner, entity, type)
pub(crate) fn dedupe_key(
    owner_user_id: Uuid,
    entity_type: &str,
    entity_id: Option<Uuid>,
    job_type: &str,
) -> String {
    format!(
        "{}:{}:{}:{}",
        owner_user_id,
        entity_type,
        entity_id.map(|id| id.to_string()).unwrap_or_default(),
        job_type
    )
}

/// Generic row wrapper for derived and path tables
///
/// The typed row lives in `data`; `keys` carries the string-valued fields the
/// repositories filter on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRow {
    #[serde(rename = "_id")]
    pub id: String,
    pub keys: bson::Document,
    pub data: bson::Document,
}

impl MongoRow {
    pub fn wrap<T: Serialize>(id: String, keys: bson::Document, row: &T) -> Result<Self> {
        Ok(Self {
            id,
            keys,
            data: bson::to_document(row)?,
        })
    }

    pub fn unwrap_row<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        Ok(bson::from_document(self.data)?)
    }
}
