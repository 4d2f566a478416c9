use std::time::Duration;

use async_trait::async_trait;
use bson::DateTime as BsonDateTime;
use chrono::{DateTime, Utc};
use lumen_types::{Job, JobStatus, NewJob};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ReturnDocument;
use uuid::Uuid;

use crate::dbs::mongo::client::{is_duplicate_key, MongoStore};
use crate::dbs::mongo::models::{dedupe_key, MongoJob};
use crate::error::{PersistError, Result};
use crate::repositories::{EnqueueOutcome, JobRepository};

fn status(s: JobStatus) -> Result<Bson> {
    Ok(bson::to_bson(&s)?)
}

fn runnable_statuses() -> Result<Vec<Bson>> {
    [JobStatus::Queued, JobStatus::Running, JobStatus::WaitingUser]
        .into_iter()
        .map(status)
        .collect()
}

fn new_row(job: NewJob, key: Option<String>) -> MongoJob {
    let now = BsonDateTime::now();
    MongoJob {
        id: Uuid::new_v4().to_string(),
        owner_user_id: job.owner_user_id.to_string(),
        job_type: job.job_type,
        entity_type: job.entity_type,
        entity_id: job.entity_id.map(|id| id.to_string()),
        payload: job.payload,
        status: JobStatus::Queued,
        stage: None,
        attempt: 0,
        max_attempts: i64::from(job.max_attempts),
        run_after: now,
        locked_until: None,
        last_error: None,
        dedupe_key: key,
        created_at: now,
        updated_at: now,
    }
}

fn entity_filter(
    owner_user_id: Uuid,
    entity_type: &str,
    entity_id: Option<Uuid>,
    job_type: &str,
) -> Document {
    doc! {
        "owner_user_id": owner_user_id.to_string(),
        "entity_type": entity_type,
        "entity_id": entity_id.map(|id| id.to_string()),
        "job_type": job_type,
    }
}

impl MongoStore {
    async fn find_runnable(&self, job: &NewJob) -> Result<Option<Job>> {
        let mut filter = entity_filter(job.owner_user_id, &job.entity_type, job.entity_id, &job.job_type);
        filter.insert("status", doc! { "$in": runnable_statuses()? });
        self.jobs.find_one(filter).await?.map(Job::try_from).transpose()
    }

    async fn finish(&self, job_id: Uuid, update: Document) -> Result<Job> {
        self.jobs
            .find_one_and_update(doc! { "_id": job_id.to_string() }, update)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or(PersistError::JobNotFound(job_id))
            .and_then(Job::try_from)
    }
}

#[async_trait]
impl JobRepository for MongoStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let row = new_row(job, None);
        self.jobs.insert_one(&row).await?;
        Job::try_from(row)
    }

    async fn enqueue_unique(&self, job: NewJob) -> Result<EnqueueOutcome> {
        if let Some(existing) = self.find_runnable(&job).await? {
            return Ok(EnqueueOutcome::Existing(existing));
        }

        let key = dedupe_key(job.owner_user_id, &job.entity_type, job.entity_id, &job.job_type);
        let row = new_row(job.clone(), Some(key.clone()));
        match self.jobs.insert_one(&row).await {
            Ok(_) => Ok(EnqueueOutcome::Enqueued(Job::try_from(row)?)),
            Err(e) if is_duplicate_key(&e) => {
                // lost the race to a concurrent enqueue
                let existing = self
                    .jobs
                    .find_one(doc! { "dedupe_key": key.as_str() })
                    .await?
                    .ok_or_else(|| PersistError::Conflict(format!("job {} vanished", key)))?;
                Ok(EnqueueOutcome::Existing(Job::try_from(existing)?))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_runnable_for_entity(
        &self,
        owner_user_id: Uuid,
        entity_type: &str,
        entity_id: Option<Uuid>,
        job_type: &str,
    ) -> Result<bool> {
        let mut filter = entity_filter(owner_user_id, entity_type, entity_id, job_type);
        filter.insert("status", doc! { "$in": runnable_statuses()? });
        Ok(self.jobs.count_documents(filter).await? > 0)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.jobs
            .find_one(doc! { "_id": job_id.to_string() })
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn latest_for_entity(
        &self,
        owner_user_id: Uuid,
        entity_type: &str,
        entity_id: Uuid,
        job_type: Option<&str>,
    ) -> Result<Option<Job>> {
        let mut filter = doc! {
            "owner_user_id": owner_user_id.to_string(),
            "entity_type": entity_type,
            "entity_id": entity_id.to_string(),
        };
        if let Some(job_type) = job_type {
            filter.insert("job_type", job_type);
        }
        self.jobs
            .find_one(filter)
            .sort(doc! { "created_at": -1 })
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn lease_job(&self, job_types: &[String], lease: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now_bson = BsonDateTime::from_chrono(now);
        let filter = doc! {
            "job_type": { "$in": job_types.to_vec() },
            "$or": [
                { "status": status(JobStatus::Queued)?, "run_after": { "$lte": now_bson } },
                {
                    "status": status(JobStatus::Running)?,
                    "$or": [
                        { "locked_until": Bson::Null },
                        { "locked_until": { "$lte": now_bson } },
                    ],
                },
            ],
        };
        let update = doc! { "$set": {
            "status": status(JobStatus::Running)?,
            "locked_until": BsonDateTime::from_chrono(now + lease),
            "updated_at": now_bson,
        } };
        self.jobs
            .find_one_and_update(filter, update)
            .sort(doc! { "run_after": 1, "created_at": 1 })
            .return_document(ReturnDocument::After)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        self.finish(
            job_id,
            doc! {
                "$set": {
                    "status": status(JobStatus::Succeeded)?,
                    "locked_until": Bson::Null,
                    "updated_at": BsonDateTime::now(),
                },
                "$unset": { "dedupe_key": "" },
            },
        )
        .await?;
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        let now = BsonDateTime::now();
        let update = match retry_at {
            Some(at) => doc! {
                "$set": {
                    "status": status(JobStatus::Queued)?,
                    "run_after": BsonDateTime::from_chrono(at),
                    "locked_until": Bson::Null,
                    "last_error": error,
                    "updated_at": now,
                },
                "$inc": { "attempt": 1_i64 },
            },
            None => doc! {
                "$set": {
                    "status": status(JobStatus::Failed)?,
                    "locked_until": Bson::Null,
                    "last_error": error,
                    "updated_at": now,
                },
                "$unset": { "dedupe_key": "" },
            },
        };
        self.finish(job_id, update).await
    }
}
