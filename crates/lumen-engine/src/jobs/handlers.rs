use std::sync::Arc;

use async_trait::async_trait;
use lumen_persist::Stores;
use lumen_types::jobs::{CHAT_MAINTAIN, CHAT_PATH_INDEX, CHAT_REBUILD, CHAT_RESPOND};
use lumen_types::{ChatMaintainPayload, ChatPathIndexPayload, ChatRebuildPayload, ChatRespondPayload, Job};
use serde::de::DeserializeOwned;
use tracing::info;
use uuid::Uuid;

use super::JobHandler;
use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::maintainer::Maintainer;
use crate::path_indexer::PathIndexer;
use crate::responder::Responder;

fn payload<T: DeserializeOwned>(job: &Job) -> Result<T> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| EngineError::InputInvalid(format!("{} payload: {}", job.job_type, e)))
}

/// The job owner must own the thread it touches
async fn check_thread_owner(stores: &Stores, thread_id: Uuid, owner: Uuid) -> Result<()> {
    let thread = stores
        .threads
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| EngineError::not_found("thread", thread_id))?;
    if !thread.is_owned_by(owner) {
        return Err(EngineError::AuthMismatch(owner));
    }
    Ok(())
}

pub struct ChatRespondHandler {
    responder: Arc<Responder>,
}

impl ChatRespondHandler {
    pub fn new(responder: Arc<Responder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl JobHandler for ChatRespondHandler {
    fn job_type(&self) -> &'static str {
        CHAT_RESPOND
    }

    async fn handle(&self, job: &Job, cancel: CancelToken) -> Result<()> {
        let mut payload: ChatRespondPayload = payload(job)?;
        if payload.user_id != job.owner_user_id {
            return Err(EngineError::AuthMismatch(job.owner_user_id));
        }
        payload.job_id = Some(job.id);
        payload.attempt = payload.attempt.max(job.attempt);
        self.responder.respond(&payload, cancel).await?;
        Ok(())
    }

    async fn abandon(&self, job: &Job, error: &EngineError) -> Result<()> {
        let payload: ChatRespondPayload = payload(job)?;
        if payload.user_id != job.owner_user_id {
            return Ok(());
        }
        self.responder.abandon(&payload, error).await
    }
}

pub struct ChatMaintainHandler {
    stores: Stores,
    maintainer: Arc<Maintainer>,
}

impl ChatMaintainHandler {
    pub fn new(stores: Stores, maintainer: Arc<Maintainer>) -> Self {
        Self { stores, maintainer }
    }
}

#[async_trait]
impl JobHandler for ChatMaintainHandler {
    fn job_type(&self) -> &'static str {
        CHAT_MAINTAIN
    }

    async fn handle(&self, job: &Job, cancel: CancelToken) -> Result<()> {
        let ChatMaintainPayload { thread_id } = payload(job)?;
        check_thread_owner(&self.stores, thread_id, job.owner_user_id).await?;
        self.maintainer.maintain(thread_id, cancel).await?;
        Ok(())
    }
}

pub struct ChatRebuildHandler {
    stores: Stores,
    maintainer: Arc<Maintainer>,
}

impl ChatRebuildHandler {
    pub fn new(stores: Stores, maintainer: Arc<Maintainer>) -> Self {
        Self { stores, maintainer }
    }
}

#[async_trait]
impl JobHandler for ChatRebuildHandler {
    fn job_type(&self) -> &'static str {
        CHAT_REBUILD
    }

    async fn handle(&self, job: &Job, cancel: CancelToken) -> Result<()> {
        let ChatRebuildPayload { thread_id } = payload(job)?;
        check_thread_owner(&self.stores, thread_id, job.owner_user_id).await?;
        let report = self.maintainer.rebuild(thread_id, cancel).await?;
        info!(
            %thread_id,
            written = report.phases.iter().map(|p| p.written).sum::<usize>(),
            "thread rebuilt"
        );
        Ok(())
    }
}

pub struct ChatPathIndexHandler {
    stores: Stores,
    indexer: Arc<PathIndexer>,
}

impl ChatPathIndexHandler {
    pub fn new(stores: Stores, indexer: Arc<PathIndexer>) -> Self {
        Self { stores, indexer }
    }
}

#[async_trait]
impl JobHandler for ChatPathIndexHandler {
    fn job_type(&self) -> &'static str {
        CHAT_PATH_INDEX
    }

    async fn handle(&self, job: &Job, _cancel: CancelToken) -> Result<()> {
        let ChatPathIndexPayload { path_id } = payload(job)?;
        let path = self
            .stores
            .paths
            .get_path(path_id)
            .await?
            .ok_or_else(|| EngineError::not_found("path", path_id))?;
        if path.user_id != job.owner_user_id {
            return Err(EngineError::AuthMismatch(job.owner_user_id));
        }
        self.indexer.index_path(path_id).await?;
        Ok(())
    }
}
