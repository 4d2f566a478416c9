use async_trait::async_trait;
use lumen_persist::{EnqueueOutcome, Stores};
use lumen_types::jobs::{
    CHAT_PATH_INDEX, CHAT_REBUILD, ENTITY_PATH, ENTITY_THREAD, LEARNING_BUILD,
    LEARNING_BUILD_PROGRESSIVE,
};
use lumen_types::{ChatPathIndexPayload, ChatRebuildPayload, NewJob, Thread};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::router::ToolCall;

pub const ENQUEUE_FAILED_REPLY: &str = "I tried to start that pipeline, but it failed to enqueue.";
pub const UNSUPPORTED_TOOL_REPLY: &str = "I can't run that action from chat.";

/// Declared argument names for a chat-invocable tool
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

pub const TOOL_SPECS: [ToolSpec; 4] = [
    ToolSpec {
        name: LEARNING_BUILD,
        required: &["material_set_id"],
        optional: &["path_id", "thread_id"],
    },
    ToolSpec {
        name: LEARNING_BUILD_PROGRESSIVE,
        required: &["material_set_id"],
        optional: &["path_id", "thread_id"],
    },
    ToolSpec {
        name: CHAT_REBUILD,
        required: &["thread_id"],
        optional: &[],
    },
    ToolSpec {
        name: CHAT_PATH_INDEX,
        required: &["path_id"],
        optional: &[],
    },
];

pub fn tool_spec(name: &str) -> Option<&'static ToolSpec> {
    TOOL_SPECS.iter().find(|s| s.name == name)
}

pub fn is_supported_tool(name: &str) -> bool {
    tool_spec(name).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Enqueued,
    AlreadyRunning,
    Rejected,
    Failed,
}

/// Deterministic reply plus the metadata recorded on the assistant message
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool: String,
    pub status: ToolStatus,
    pub reply: String,
    pub job_id: Option<Uuid>,
    pub arguments: Map<String, Value>,
}

impl ToolOutcome {
    fn new(call: &ToolCall, status: ToolStatus, reply: impl Into<String>) -> Self {
        Self {
            tool: call.name.clone(),
            status,
            reply: reply.into(),
            job_id: None,
            arguments: Map::new(),
        }
    }

    pub fn metadata(&self) -> Value {
        json!({
            "name": self.tool,
            "status": self.status,
            "job_id": self.job_id,
            "arguments": self.arguments,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: Uuid,
    pub thread: Thread,
}

/// Runs at most one tool call per turn
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome;

    fn list_tools(&self) -> Vec<String>;
}

/// Resolved job to enqueue for a tool call
struct JobPlan {
    job_type: &'static str,
    entity_type: &'static str,
    entity_id: Uuid,
    payload: Value,
    arguments: Map<String, Value>,
}

/// Enqueue-only executor for the engine's pipelines
pub struct ChatToolExecutor {
    stores: Stores,
    max_attempts: u32,
}

impl ChatToolExecutor {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            max_attempts: 5,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    async fn resolve(&self, call: &ToolCall, ctx: &ToolContext) -> Result<JobPlan> {
        let spec = tool_spec(&call.name)
            .ok_or_else(|| EngineError::InputInvalid(format!("unsupported tool {}", call.name)))?;
        let thread_id = self.resolve_thread(call, ctx).await?;
        let path_id = uuid_arg(&call.arguments, "path_id")?.or(ctx.thread.path_id);

        let mut arguments = Map::new();
        arguments.insert("thread_id".into(), json!(thread_id));

        match spec.name {
            CHAT_REBUILD => Ok(JobPlan {
                job_type: CHAT_REBUILD,
                entity_type: ENTITY_THREAD,
                entity_id: thread_id,
                payload: serde_json::to_value(ChatRebuildPayload { thread_id })?,
                arguments,
            }),
            CHAT_PATH_INDEX => {
                let path_id = path_id.ok_or_else(|| {
                    EngineError::InputInvalid("this chat is not linked to a learning path".into())
                })?;
                self.ensure_path_owner(path_id, ctx.user_id).await?;
                arguments.insert("path_id".into(), json!(path_id));
                Ok(JobPlan {
                    job_type: CHAT_PATH_INDEX,
                    entity_type: ENTITY_PATH,
                    entity_id: path_id,
                    payload: serde_json::to_value(ChatPathIndexPayload { path_id })?,
                    arguments,
                })
            }
            job_type => {
                if let Some(path_id) = path_id {
                    self.ensure_path_owner(path_id, ctx.user_id).await?;
                    arguments.insert("path_id".into(), json!(path_id));
                }
                let material_set_id = match uuid_arg(&call.arguments, "material_set_id")? {
                    Some(id) => Some(id),
                    None => self.inherit_material_set(ctx, thread_id, path_id).await?,
                };
                let material_set_id = material_set_id.ok_or_else(|| {
                    EngineError::InputInvalid("no uploaded materials to build from".into())
                })?;
                arguments.insert("material_set_id".into(), json!(material_set_id));
                Ok(JobPlan {
                    job_type,
                    entity_type: ENTITY_THREAD,
                    entity_id: thread_id,
                    payload: json!({
                        "thread_id": thread_id,
                        "path_id": path_id,
                        "material_set_id": material_set_id,
                    }),
                    arguments,
                })
            }
        }
    }

    async fn resolve_thread(&self, call: &ToolCall, ctx: &ToolContext) -> Result<Uuid> {
        match uuid_arg(&call.arguments, "thread_id")? {
            Some(id) if id != ctx.thread.id => {
                let thread = self
                    .stores
                    .threads
                    .get_thread(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("thread", id))?;
                if !thread.is_owned_by(ctx.user_id) {
                    return Err(EngineError::AuthMismatch(id));
                }
                Ok(id)
            }
            _ => Ok(ctx.thread.id),
        }
    }

    async fn ensure_path_owner(&self, path_id: Uuid, user_id: Uuid) -> Result<()> {
        let path = self
            .stores
            .paths
            .get_path(path_id)
            .await?
            .ok_or_else(|| EngineError::not_found("path", path_id))?;
        if path.user_id != user_id {
            return Err(EngineError::InputInvalid("learning path belongs to another user".into()));
        }
        Ok(())
    }

    /// Path first, then the payload of the thread's previous build job
    async fn inherit_material_set(
        &self,
        ctx: &ToolContext,
        thread_id: Uuid,
        path_id: Option<Uuid>,
    ) -> Result<Option<Uuid>> {
        if let Some(path_id) = path_id {
            if let Some(path) = self.stores.paths.get_path(path_id).await? {
                if let Some(id) = path.material_set_id {
                    return Ok(Some(id));
                }
            }
        }
        for job_type in [LEARNING_BUILD, LEARNING_BUILD_PROGRESSIVE] {
            let prior = self
                .stores
                .jobs
                .latest_for_entity(ctx.user_id, ENTITY_THREAD, thread_id, Some(job_type))
                .await?;
            let inherited = prior
                .as_ref()
                .and_then(|job| job.payload.get("material_set_id"))
                .and_then(Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok());
            if inherited.is_some() {
                return Ok(inherited);
            }
        }
        Ok(None)
    }

    async fn enqueue(&self, ctx: &ToolContext, plan: &JobPlan) -> Result<EnqueueOutcome> {
        let already = self
            .stores
            .jobs
            .has_runnable_for_entity(ctx.user_id, plan.entity_type, Some(plan.entity_id), plan.job_type)
            .await?;
        if already {
            let existing = self
                .stores
                .jobs
                .latest_for_entity(ctx.user_id, plan.entity_type, plan.entity_id, Some(plan.job_type))
                .await?;
            if let Some(job) = existing {
                return Ok(EnqueueOutcome::Existing(job));
            }
        }
        let job = NewJob::new(
            ctx.user_id,
            plan.job_type,
            plan.entity_type,
            Some(plan.entity_id),
            plan.payload.clone(),
        )
        .with_max_attempts(self.max_attempts);
        let outcome = self.stores.jobs.enqueue_unique(job).await?;
        if outcome.is_new() && plan.entity_type == ENTITY_THREAD && plan.job_type != CHAT_REBUILD {
            self.stores
                .threads
                .set_thread_job(plan.entity_id, Some(outcome.job().id))
                .await?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ToolExecutor for ChatToolExecutor {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        if !is_supported_tool(&call.name) {
            warn!(tool = %call.name, "unsupported tool requested");
            return ToolOutcome::new(call, ToolStatus::Rejected, UNSUPPORTED_TOOL_REPLY);
        }

        let plan = match self.resolve(call, ctx).await {
            Ok(plan) => plan,
            Err(EngineError::InputInvalid(reason)) => {
                return ToolOutcome::new(call, ToolStatus::Rejected, rejected_reply(&call.name, &reason));
            }
            Err(EngineError::AuthMismatch(_)) => {
                return ToolOutcome::new(call, ToolStatus::Rejected, UNSUPPORTED_TOOL_REPLY);
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool argument resolution failed");
                return ToolOutcome::new(call, ToolStatus::Failed, ENQUEUE_FAILED_REPLY);
            }
        };

        match self.enqueue(ctx, &plan).await {
            Ok(outcome) => {
                let status = if outcome.is_new() {
                    ToolStatus::Enqueued
                } else {
                    ToolStatus::AlreadyRunning
                };
                info!(
                    tool = %call.name,
                    job_id = %outcome.job().id,
                    status = ?status,
                    "tool call handled"
                );
                ToolOutcome {
                    tool: call.name.clone(),
                    status,
                    reply: tool_reply(plan.job_type, status),
                    job_id: Some(outcome.job().id),
                    arguments: plan.arguments,
                }
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool enqueue failed");
                let mut outcome = ToolOutcome::new(call, ToolStatus::Failed, ENQUEUE_FAILED_REPLY);
                outcome.arguments = plan.arguments;
                outcome
            }
        }
    }

    fn list_tools(&self) -> Vec<String> {
        TOOL_SPECS.iter().map(|s| s.name.to_string()).collect()
    }
}

fn uuid_arg(args: &Map<String, Value>, key: &str) -> Result<Option<Uuid>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) if raw.trim().is_empty() => Ok(None),
        Some(Value::String(raw)) => Uuid::parse_str(raw.trim())
            .map(Some)
            .map_err(|_| EngineError::InputInvalid(format!("{} is not a valid id", key))),
        Some(_) => Err(EngineError::InputInvalid(format!("{} must be a string", key))),
    }
}

fn tool_label(job_type: &str) -> &'static str {
    match job_type {
        CHAT_REBUILD => "chat rebuild",
        CHAT_PATH_INDEX => "course outline reindex",
        LEARNING_BUILD_PROGRESSIVE => "progressive learning path build",
        _ => "learning path build",
    }
}

pub fn tool_reply(job_type: &str, status: ToolStatus) -> String {
    match (job_type, status) {
        (_, ToolStatus::AlreadyRunning) => format!(
            "A {} is already running for this chat. I'll keep working with what is indexed so far.",
            tool_label(job_type)
        ),
        (CHAT_REBUILD, _) => "Started rebuilding this chat's index and summaries. Answers about earlier messages may be less precise until it finishes.".to_string(),
        (CHAT_PATH_INDEX, _) => "Started reindexing the course outline for this chat.".to_string(),
        (LEARNING_BUILD_PROGRESSIVE, _) => "Started building your learning path unit by unit. New units will appear as they are ready.".to_string(),
        _ => "Started building your learning path. I'll post updates here as it progresses.".to_string(),
    }
}

fn rejected_reply(tool: &str, reason: &str) -> String {
    format!("I couldn't start the {}: {}.", tool_label(tool), reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_types::JobStatus;

    async fn ctx(stores: &Stores, user_id: Uuid) -> ToolContext {
        let thread = stores
            .threads
            .create_thread(Thread::new(user_id, "t", None))
            .await
            .unwrap();
        ToolContext { user_id, thread }
    }

    #[tokio::test]
    async fn test_rebuild_enqueues_once() {
        let stores = Stores::in_memory();
        let user = Uuid::new_v4();
        let ctx = ctx(&stores, user).await;
        let exec = ChatToolExecutor::new(stores.clone());

        let first = exec.execute(&ToolCall::new(CHAT_REBUILD), &ctx).await;
        assert_eq!(first.status, ToolStatus::Enqueued);
        assert_eq!(first.reply, tool_reply(CHAT_REBUILD, ToolStatus::Enqueued));

        let second = exec.execute(&ToolCall::new(CHAT_REBUILD), &ctx).await;
        assert_eq!(second.status, ToolStatus::AlreadyRunning);
        assert!(second.reply.contains("already running"));
        assert_eq!(second.job_id, first.job_id);

        let job = stores.jobs.get_job(first.job_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.entity_id, Some(ctx.thread.id));
    }

    #[tokio::test]
    async fn test_path_index_without_path_is_rejected() {
        let stores = Stores::in_memory();
        let ctx = ctx(&stores, Uuid::new_v4()).await;
        let exec = ChatToolExecutor::new(stores);
        let outcome = exec.execute(&ToolCall::new(CHAT_PATH_INDEX), &ctx).await;
        assert_eq!(outcome.status, ToolStatus::Rejected);
        assert!(outcome.job_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let stores = Stores::in_memory();
        let ctx = ctx(&stores, Uuid::new_v4()).await;
        let exec = ChatToolExecutor::new(stores);
        let outcome = exec.execute(&ToolCall::new("drop_tables"), &ctx).await;
        assert_eq!(outcome.status, ToolStatus::Rejected);
        assert_eq!(outcome.reply, UNSUPPORTED_TOOL_REPLY);
    }

    #[tokio::test]
    async fn test_learning_build_inherits_material_set_from_prior_job() {
        let stores = Stores::in_memory();
        let user = Uuid::new_v4();
        let ctx = ctx(&stores, user).await;
        let set_id = Uuid::new_v4();
        let prior = stores
            .jobs
            .enqueue(NewJob::new(
                user,
                LEARNING_BUILD,
                ENTITY_THREAD,
                Some(ctx.thread.id),
                json!({ "material_set_id": set_id }),
            ))
            .await
            .unwrap();
        stores.jobs.complete_job(prior.id).await.unwrap();

        let exec = ChatToolExecutor::new(stores.clone());
        let outcome = exec
            .execute(&ToolCall::new(LEARNING_BUILD_PROGRESSIVE), &ctx)
            .await;
        assert_eq!(outcome.status, ToolStatus::Enqueued);
        assert_eq!(outcome.arguments["material_set_id"], json!(set_id));

        let thread = stores.threads.get_thread(ctx.thread.id).await.unwrap().unwrap();
        assert_eq!(thread.job_id, outcome.job_id);
    }
}
