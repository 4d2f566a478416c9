use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lumen_types::{Job, NewJob};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// Result of a deduplicated enqueue
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Enqueued(Job),
    /// A runnable job of the same type already exists for the entity
    Existing(Job),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueOutcome::Enqueued(job) | EnqueueOutcome::Existing(job) => job,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    /// Enqueue unless a runnable job with the same (owner, entity_type, entity_id, job_type)
    /// exists; check and insert are atomic
    async fn enqueue_unique(&self, job: NewJob) -> Result<EnqueueOutcome>;

    async fn has_runnable_for_entity(
        &self,
        owner_user_id: Uuid,
        entity_type: &str,
        entity_id: Option<Uuid>,
        job_type: &str,
    ) -> Result<bool>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Latest job of any status for an entity, optionally filtered by type
    async fn latest_for_entity(
        &self,
        owner_user_id: Uuid,
        entity_type: &str,
        entity_id: Uuid,
        job_type: Option<&str>,
    ) -> Result<Option<Job>>;

    /// Claim one due job of the given types: queued with `run_after <= now`, or running
    /// with an expired lease. Marks it running and locks it for `lease`.
    async fn lease_job(&self, job_types: &[String], lease: Duration) -> Result<Option<Job>>;

    async fn complete_job(&self, job_id: Uuid) -> Result<()>;

    /// Record a failure. With `retry_at` the job is requeued at `attempt + 1`, otherwise it
    /// becomes `failed`.
    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Job>;
}
