use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lumen_llm::ExponentialBackoff;
use lumen_persist::JobRepository;
use lumen_types::{Job, NewJob};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::types::JobConfig;

/// Executes one job type; must be idempotent under at-least-once delivery
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn handle(&self, job: &Job, cancel: CancelToken) -> Result<()>;

    /// Called once when the job fails for good and will not be retried
    async fn abandon(&self, _job: &Job, _error: &EngineError) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDisposition {
    Succeeded,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job_id: Uuid,
    pub job_type: String,
    pub attempt: u32,
    pub disposition: JobDisposition,
}

/// Leases due jobs and dispatches them to registered handlers
pub struct JobRuntime {
    jobs: Arc<dyn JobRepository>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    config: JobConfig,
    backoff: ExponentialBackoff,
}

impl JobRuntime {
    pub fn new(jobs: Arc<dyn JobRepository>, config: JobConfig) -> Self {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        );
        Self {
            jobs,
            handlers: HashMap::new(),
            config,
            backoff,
        }
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type().to_string(), handler);
        self
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = self
            .jobs
            .enqueue(job.with_max_attempts(self.config.max_attempts))
            .await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        Ok(job)
    }

    pub async fn has_runnable_for_entity(
        &self,
        owner_user_id: Uuid,
        entity_type: &str,
        entity_id: Option<Uuid>,
        job_type: &str,
    ) -> Result<bool> {
        Ok(self
            .jobs
            .has_runnable_for_entity(owner_user_id, entity_type, entity_id, job_type)
            .await?)
    }

    /// Lease and run a single due job, if any
    pub async fn run_once(&self, cancel: CancelToken) -> Result<Option<JobRun>> {
        let types = self.job_types();
        if types.is_empty() {
            return Ok(None);
        }
        let Some(job) = self.jobs.lease_job(&types, self.config.lease()).await? else {
            return Ok(None);
        };

        let span = tracing::info_span!("job", job_id = %job.id, job_type = %job.job_type, attempt = job.attempt);
        let disposition = self.dispatch(&job, cancel).instrument(span).await?;

        Ok(Some(JobRun {
            job_id: job.id,
            job_type: job.job_type,
            attempt: job.attempt,
            disposition,
        }))
    }

    async fn dispatch(&self, job: &Job, cancel: CancelToken) -> Result<JobDisposition> {
        let handler = self.handlers.get(&job.job_type);
        let result = match handler {
            Some(handler) => handler.handle(job, cancel).await,
            None => Err(EngineError::NonRetryable(format!("no handler for {}", job.job_type))),
        };

        let disposition = match result {
            Ok(()) => {
                self.jobs.complete_job(job.id).await?;
                info!("job succeeded");
                JobDisposition::Succeeded
            }
            Err(EngineError::Cancelled) => {
                // interrupted by shutdown; run again once a worker is back
                self.jobs.fail_job(job.id, "cancelled", Some(Utc::now())).await?;
                warn!("job cancelled; requeued");
                JobDisposition::Retrying
            }
            Err(e) if e.is_retryable() && job.attempt + 1 < job.max_attempts => {
                let delay = self.backoff.delay(job.attempt);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
                self.jobs.fail_job(job.id, &e.to_string(), Some(retry_at)).await?;
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "job failed; retry scheduled");
                JobDisposition::Retrying
            }
            Err(e) => {
                self.jobs.fail_job(job.id, &e.to_string(), None).await?;
                error!(error = %e, kind = ?e.kind(), "job failed permanently");
                if let Some(handler) = handler {
                    if let Err(cleanup) = handler.abandon(job, &e).await {
                        warn!(error = %cleanup, "cleanup after permanent failure failed");
                    }
                }
                JobDisposition::Failed
            }
        };
        Ok(disposition)
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker, types = ?self.job_types(), "job worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let cancel = CancelToken::from(shutdown.clone());
            let ran = match self.run_once(cancel).await {
                Ok(run) => run.is_some(),
                Err(e) => {
                    error!(worker, error = %e, "job poll failed");
                    false
                }
            };
            if ran {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker, "job worker stopped");
    }

    /// Spawn `n` polling workers that stop once `shutdown` flips to true or its sender drops
    pub fn run_workers(self: &Arc<Self>, n: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..n.max(1))
            .map(|worker| tokio::spawn(self.clone().worker_loop(worker, shutdown.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_persist::MemoryStore;
    use lumen_types::JobStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        abandoned: AtomicUsize,
        fail_with: fn() -> Option<EngineError>,
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn job_type(&self) -> &'static str {
            "test_job"
        }

        async fn handle(&self, _job: &Job, _cancel: CancelToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (self.fail_with)() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn abandon(&self, _job: &Job, _error: &EngineError) -> Result<()> {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn runtime(store: Arc<MemoryStore>, fail_with: fn() -> Option<EngineError>) -> (JobRuntime, Arc<Scripted>) {
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
            fail_with,
        });
        let config = JobConfig {
            max_attempts: 2,
            backoff_base_ms: 10,
            backoff_cap_ms: 20,
            ..Default::default()
        };
        (JobRuntime::new(store, config).register(handler.clone()), handler)
    }

    fn new_job() -> NewJob {
        NewJob::new(Uuid::new_v4(), "test_job", "thing", Some(Uuid::new_v4()), json!({}))
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let store = Arc::new(MemoryStore::new());
        let (rt, handler) = runtime(store.clone(), || None);
        let job = rt.enqueue(new_job()).await.unwrap();

        let run = rt.run_once(CancelToken::never()).await.unwrap().unwrap();
        assert_eq!(run.disposition, JobDisposition::Succeeded);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert!(rt.run_once(CancelToken::never()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_until_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let (rt, handler) = runtime(store.clone(), || Some(EngineError::Retryable("429".into())));
        let job = rt.enqueue(new_job()).await.unwrap();

        let run = rt.run_once(CancelToken::never()).await.unwrap().unwrap();
        assert_eq!(run.disposition, JobDisposition::Retrying);
        assert_eq!(handler.abandoned.load(Ordering::SeqCst), 0);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempt, 1);
        assert!(stored.run_after > Utc::now() - chrono::Duration::seconds(1));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let run = rt.run_once(CancelToken::never()).await.unwrap().unwrap();
        assert_eq!(run.disposition, JobDisposition::Failed);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(handler.abandoned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let store = Arc::new(MemoryStore::new());
        let (rt, _) = runtime(store.clone(), || Some(EngineError::InputInvalid("bad payload".into())));
        let job = rt.enqueue(new_job()).await.unwrap();

        let run = rt.run_once(CancelToken::never()).await.unwrap().unwrap();
        assert_eq!(run.disposition, JobDisposition::Failed);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("Invalid input: bad payload"));
    }

    #[tokio::test]
    async fn test_workers_drain_and_stop() {
        let store = Arc::new(MemoryStore::new());
        let (rt, handler) = runtime(store.clone(), || None);
        for _ in 0..3 {
            rt.enqueue(new_job()).await.unwrap();
        }
        let rt = Arc::new(rt);
        let (tx, rx) = watch::channel(false);
        let workers = rt.run_workers(2, rx);

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        for worker in workers {
            tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        }
    }
}
