//! Turn execution: route, plan, stream, verify, finalize
//!
//! A turn moves `queued -> running -> done | error`. Every write is keyed by
//! the turn's ids, so a retried job resets the assistant row and replays the
//! turn from the top.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use lumen_context::{ContextPlan, ContextPlanner, PlanInput};
use lumen_llm::{GenerateOptions, LlmClient, StreamEvent, TextRequest, TextStream};
use lumen_persist::Stores;
use lumen_types::jobs::{CHAT_MAINTAIN, ENTITY_THREAD};
use lumen_types::{
    AssistantMetadata, ChatMaintainPayload, ChatMessage, ChatRespondPayload, EvidenceSource,
    MessageDeltaData, MessageStatus, NewJob, Thread, ThreadState, Turn, TurnStatus,
};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::citations::{build_citations, finalize_reply, render_sources};
use crate::error::{EngineError, Result};
use crate::notify::{Notifier, TurnRef};
use crate::prompts::{QUOTE_REPAIR_SYSTEM_PROMPT, SMALLTALK_SYSTEM_PROMPT};
use crate::router::{RouteInput, TurnRoute, TurnRouter};
use crate::streaming::Coalescer;
use crate::tools::{ToolContext, ToolExecutor};
use crate::types::ResponderConfig;

/// What a finished turn produced
#[derive(Debug, Clone)]
pub struct RespondOutcome {
    pub turn_id: Uuid,
    pub message_id: Uuid,
    pub attempt: u32,
    pub route: String,
    pub content: String,
    pub metadata: AssistantMetadata,
    /// False when the turn had already finished and nothing ran
    pub executed: bool,
}

/// The reply before post-processing
struct Draft {
    route: TurnRoute,
    content: String,
    sources: Vec<EvidenceSource>,
    tool: Option<Value>,
    plan: Option<ContextPlan>,
}

pub struct Responder {
    stores: Stores,
    llm: Arc<dyn LlmClient>,
    planner: Arc<dyn ContextPlanner>,
    router: Arc<dyn TurnRouter>,
    tools: Arc<dyn ToolExecutor>,
    notifier: Notifier,
    config: ResponderConfig,
    maintain_attempts: u32,
}

impl Responder {
    pub fn new(
        stores: Stores,
        llm: Arc<dyn LlmClient>,
        planner: Arc<dyn ContextPlanner>,
        router: Arc<dyn TurnRouter>,
        tools: Arc<dyn ToolExecutor>,
        notifier: Notifier,
        config: ResponderConfig,
    ) -> Self {
        Self {
            stores,
            llm,
            planner,
            router,
            tools,
            notifier,
            config,
            maintain_attempts: 5,
        }
    }

    pub fn with_maintain_attempts(mut self, attempts: u32) -> Self {
        self.maintain_attempts = attempts;
        self
    }

    fn options(&self, model: Option<&String>) -> GenerateOptions {
        let mut options = GenerateOptions::new();
        if let Some(model) = model {
            options = options.model(model.clone());
        }
        if let Some(t) = self.config.temperature {
            options = options.temperature(t);
        }
        if let Some(max) = self.config.max_output_tokens {
            options = options.max_output_tokens(max);
        }
        options
    }

    #[instrument(skip(self, payload, cancel), fields(turn_id = %payload.turn_id, thread_id = %payload.thread_id))]
    pub async fn respond(&self, payload: &ChatRespondPayload, cancel: CancelToken) -> Result<RespondOutcome> {
        if payload.turn_id.is_nil() || payload.thread_id.is_nil() || payload.user_id.is_nil() {
            return Err(EngineError::InputInvalid("chat_respond payload is missing ids".into()));
        }
        let mut turn = self
            .stores
            .turns
            .get_turn(payload.turn_id)
            .await?
            .ok_or_else(|| EngineError::not_found("turn", payload.turn_id))?;
        if turn.user_id != payload.user_id || turn.thread_id != payload.thread_id {
            return Err(EngineError::AuthMismatch(payload.user_id));
        }
        let thread = self
            .stores
            .threads
            .get_thread(turn.thread_id)
            .await?
            .ok_or_else(|| EngineError::not_found("thread", turn.thread_id))?;
        if !thread.is_owned_by(payload.user_id) {
            return Err(EngineError::AuthMismatch(payload.user_id));
        }

        if turn.status == TurnStatus::Done {
            return self.replay_finished(&turn).await;
        }

        // attempts only move forward, whatever the payload says
        let attempt = if turn.started_at.is_some() {
            payload.attempt.max(turn.attempt + 1)
        } else {
            payload.attempt.max(turn.attempt)
        };
        let turn_ref = TurnRef::new(turn.id, attempt);
        let mut partial = String::new();
        let result = match self.begin_turn(&thread, &mut turn, turn_ref, payload.job_id).await {
            Ok(assistant) => {
                self.run_turn(&thread, &mut turn, &assistant, turn_ref, &cancel, &mut partial)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message_id = turn.assistant_message_id;
                self.fail_turn(&thread, &mut turn, message_id, &partial, &e, turn_ref).await;
                Err(e)
            }
        }
    }

    /// Mark the turn running and hand back the assistant row, emptied on retries
    async fn begin_turn(
        &self,
        thread: &Thread,
        turn: &mut Turn,
        turn_ref: TurnRef,
        job_id: Option<Uuid>,
    ) -> Result<ChatMessage> {
        turn.status = TurnStatus::Running;
        turn.attempt = turn_ref.attempt;
        turn.job_id = job_id.or(turn.job_id);
        turn.started_at = Some(Utc::now());
        turn.completed_at = None;
        self.stores.turns.update_turn(turn).await?;

        let mut assistant = self
            .stores
            .messages
            .get_message(turn.assistant_message_id)
            .await?
            .ok_or_else(|| EngineError::not_found("message", turn.assistant_message_id))?;
        if turn_ref.attempt > 0 {
            self.stores
                .messages
                .update_content(assistant.id, "", MessageStatus::Streaming)
                .await?;
            assistant.content.clear();
            assistant.status = MessageStatus::Streaming;
            self.notifier.message_created(thread.user_id, &assistant, turn_ref);
            info!(attempt = turn_ref.attempt, "assistant message reset for retry");
        }
        Ok(assistant)
    }

    /// Settle a turn whose job will not run again, so its placeholder stops blocking maintenance
    #[instrument(skip(self, payload, cause), fields(turn_id = %payload.turn_id))]
    pub async fn abandon(&self, payload: &ChatRespondPayload, cause: &EngineError) -> Result<()> {
        let Some(mut turn) = self.stores.turns.get_turn(payload.turn_id).await? else {
            return Ok(());
        };
        if turn.user_id != payload.user_id || turn.status == TurnStatus::Done {
            return Ok(());
        }
        let Some(thread) = self.stores.threads.get_thread(turn.thread_id).await? else {
            return Ok(());
        };
        let message = self.stores.messages.get_message(turn.assistant_message_id).await?;
        let already_failed = turn.status == TurnStatus::Error
            && message.as_ref().map_or(true, |m| m.status == MessageStatus::Error);
        if already_failed {
            return Ok(());
        }
        let partial = message.map(|m| m.content).unwrap_or_default();
        let turn_ref = TurnRef::new(turn.id, turn.attempt);
        let message_id = turn.assistant_message_id;
        self.fail_turn(&thread, &mut turn, message_id, &partial, cause, turn_ref).await;
        Ok(())
    }

    async fn replay_finished(&self, turn: &Turn) -> Result<RespondOutcome> {
        let message = self
            .stores
            .messages
            .get_message(turn.assistant_message_id)
            .await?
            .ok_or_else(|| EngineError::not_found("message", turn.assistant_message_id))?;
        let metadata: AssistantMetadata = serde_json::from_value(message.metadata.clone()).unwrap_or_default();
        debug!("turn already finished; nothing to do");
        Ok(RespondOutcome {
            turn_id: turn.id,
            message_id: message.id,
            attempt: turn.attempt,
            route: metadata.route.clone().unwrap_or_default(),
            content: message.content,
            metadata,
            executed: false,
        })
    }

    async fn run_turn(
        &self,
        thread: &Thread,
        turn: &mut Turn,
        assistant: &ChatMessage,
        turn_ref: TurnRef,
        cancel: &CancelToken,
        partial: &mut String,
    ) -> Result<RespondOutcome> {
        let user_message = self
            .stores
            .messages
            .get_message(turn.user_message_id)
            .await?
            .ok_or_else(|| EngineError::not_found("message", turn.user_message_id))?;
        let user_text = user_message.content.trim().to_string();
        if user_text.is_empty() {
            return Err(EngineError::InputInvalid("user message is empty".into()));
        }
        let state = self.stores.thread_state.ensure_state(thread.id).await?;

        let waitpoint_active = self.waitpoint_active(thread).await;
        let route = self
            .router
            .route(RouteInput {
                text: &user_text,
                waitpoint_active,
            })
            .await;
        debug!(route = route.as_str(), "turn routed");

        let draft = match route {
            TurnRoute::SmallTalk => self.smalltalk(&user_text, cancel).await?,
            TurnRoute::Tool(call) => {
                let outcome = self
                    .tools
                    .execute(
                        &call,
                        &ToolContext {
                            user_id: thread.user_id,
                            thread: thread.clone(),
                        },
                    )
                    .await;
                Draft {
                    route: TurnRoute::Tool(call),
                    content: outcome.reply.clone(),
                    sources: Vec::new(),
                    tool: Some(outcome.metadata()),
                    plan: None,
                }
            }
            TurnRoute::Product => {
                self.product(thread, state, user_text.clone(), user_message, assistant, turn_ref, cancel, partial)
                    .await?
            }
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let (content, metadata) = self.post_process(&draft, &user_text).await;
        let metadata_value = serde_json::to_value(&metadata)?;

        self.stores
            .messages
            .finalize_message(assistant.id, &content, MessageStatus::Done, metadata_value.clone())
            .await?;
        turn.status = TurnStatus::Done;
        turn.completed_at = Some(Utc::now());
        if let Some(plan) = &draft.plan {
            turn.retrieval_trace = plan.trace.clone();
        }
        self.stores.turns.update_turn(turn).await?;
        self.notifier
            .message_done(thread.user_id, thread.id, assistant.id, &content, &metadata_value, turn_ref);
        self.stores.threads.touch_thread(thread.id).await?;

        if let Err(e) = self.enqueue_maintain(thread).await {
            warn!(error = %e, "could not enqueue thread maintenance");
        }

        info!(
            route = draft.route.as_str(),
            attempt = turn_ref.attempt,
            chars = content.chars().count(),
            citations = metadata.citations.len(),
            quote_verified = metadata.quote_verified,
            "turn finished"
        );
        Ok(RespondOutcome {
            turn_id: turn.id,
            message_id: assistant.id,
            attempt: turn_ref.attempt,
            route: draft.route.as_str().to_string(),
            content,
            metadata,
            executed: true,
        })
    }

    async fn waitpoint_active(&self, thread: &Thread) -> bool {
        let Some(job_id) = thread.job_id else {
            return false;
        };
        match self.stores.jobs.get_job(job_id).await {
            Ok(Some(job)) => job.is_waiting_on_user(),
            Ok(None) => false,
            Err(e) => {
                warn!(%job_id, error = %e, "could not load thread job");
                false
            }
        }
    }

    async fn smalltalk(&self, user_text: &str, cancel: &CancelToken) -> Result<Draft> {
        let request = TextRequest::new(SMALLTALK_SYSTEM_PROMPT, user_text)
            .with_options(self.options(self.config.fast_model.as_ref()));
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            reply = self.llm.generate_text(request) => reply?,
        };
        Ok(Draft {
            route: TurnRoute::SmallTalk,
            content: reply.trim().to_string(),
            sources: Vec::new(),
            tool: None,
            plan: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn product(
        &self,
        thread: &Thread,
        state: ThreadState,
        user_text: String,
        user_message: ChatMessage,
        assistant: &ChatMessage,
        turn_ref: TurnRef,
        cancel: &CancelToken,
        partial: &mut String,
    ) -> Result<Draft> {
        let conversation_id = if self.config.use_conversation {
            self.conversation_handle(thread.id, &state).await
        } else {
            None
        };
        let plan = self
            .planner
            .plan(PlanInput {
                user_id: thread.user_id,
                thread: thread.clone(),
                state,
                user_text,
                user_message,
            })
            .await?;

        let request = TextRequest::new(plan.instructions.clone(), plan.user_payload.clone())
            .with_options(self.options(self.config.chat_model.as_ref()));
        let stream = match &conversation_id {
            Some(id) => self.llm.stream_text_in_conversation(id, request).await?,
            None => self.llm.stream_text(request).await?,
        };
        self.consume_stream(stream, thread, assistant.id, turn_ref, cancel, partial)
            .await?;

        Ok(Draft {
            route: TurnRoute::Product,
            content: partial.clone(),
            sources: plan.evidence_sources.clone(),
            tool: None,
            plan: Some(plan),
        })
    }

    /// Existing provider conversation for the thread, created on first use
    async fn conversation_handle(&self, thread_id: Uuid, state: &ThreadState) -> Option<String> {
        if let Some(id) = &state.openai_conversation_id {
            return Some(id.clone());
        }
        let created = match self.llm.create_conversation().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "conversation handle unavailable; answering statelessly");
                return None;
            }
        };
        match self.stores.thread_state.set_conversation_id(thread_id, &created).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!(error = %e, "could not persist conversation handle");
                Some(created)
            }
        }
    }

    async fn consume_stream(
        &self,
        mut stream: TextStream,
        thread: &Thread,
        message_id: Uuid,
        turn_ref: TurnRef,
        cancel: &CancelToken,
        content: &mut String,
    ) -> Result<()> {
        let mut db = Coalescer::for_db(self.config.db_flush_interval(), self.config.db_flush_chars);
        let mut sse = Coalescer::for_sse(self.config.sse_flush_interval(), self.config.sse_flush_bytes);
        let mut delta_seq: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None | Some(Ok(StreamEvent::Done { .. })) => break,
                Some(Ok(StreamEvent::Message { content: delta })) => {
                    content.push_str(&delta);
                    if let Some(batch) = sse.push(&delta) {
                        delta_seq += 1;
                        self.emit_delta(thread, message_id, batch, delta_seq, content, turn_ref);
                    }
                    if db.push(&delta).is_some() {
                        self.stores
                            .messages
                            .update_content(message_id, content, MessageStatus::Streaming)
                            .await?;
                    }
                }
                Some(Ok(StreamEvent::Refusal { content: reason })) => {
                    return Err(EngineError::ModelRefusal(reason));
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }

        if let Some(batch) = sse.flush() {
            delta_seq += 1;
            self.emit_delta(thread, message_id, batch, delta_seq, content, turn_ref);
        }
        Ok(())
    }

    fn emit_delta(
        &self,
        thread: &Thread,
        message_id: Uuid,
        delta: String,
        delta_seq: u64,
        content: &str,
        turn_ref: TurnRef,
    ) {
        self.notifier.message_delta(
            thread.user_id,
            MessageDeltaData {
                thread_id: thread.id,
                message_id,
                delta,
                delta_seq,
                content_len: content.chars().count(),
                turn_id: turn_ref.turn_id.unwrap_or_default(),
                attempt: turn_ref.attempt,
            },
        );
    }

    /// Citations, quote verification with one repair pass, readable markers
    async fn post_process(&self, draft: &Draft, user_text: &str) -> (String, AssistantMetadata) {
        let min_chars = self.config.quote_min_chars;
        let mut content = draft.content.clone();
        let (mut stored, mut check) = finalize_reply(&content, &draft.sources, min_chars);
        let missing_material = draft.plan.as_ref().map(|p| p.missing_material_quotes()).unwrap_or(false);

        if draft.plan.is_some() && self.config.quote_repair && (!check.verified() || missing_material) {
            debug!(
                unverified = check.unverified.len(),
                missing_material,
                "repairing reply quotes"
            );
            match self.repair(&content, &draft.sources, user_text, missing_material).await {
                Ok(repaired) if !repaired.trim().is_empty() => {
                    content = repaired;
                    (stored, check) = finalize_reply(&content, &draft.sources, min_chars);
                }
                Ok(_) => warn!("quote repair returned nothing; keeping original reply"),
                Err(e) => warn!(error = %e, "quote repair failed; keeping original reply"),
            }
        }

        let citations = build_citations(&content, &draft.sources);
        let metadata = AssistantMetadata {
            citations,
            evidence_ids: draft.sources.iter().map(|s| s.id.clone()).collect(),
            quote_verified: check.verified(),
            route: Some(draft.route.as_str().to_string()),
            tool: draft.tool.clone(),
        };
        (stored, metadata)
    }

    async fn repair(
        &self,
        content: &str,
        sources: &[EvidenceSource],
        user_text: &str,
        missing_material: bool,
    ) -> Result<String> {
        let mut user = format!(
            "Sources:\n{}\nQuestion:\n{}\n\nPrevious answer:\n{}",
            render_sources(sources),
            user_text,
            content
        );
        if missing_material {
            user.push_str("\n\nNo source-material excerpts were available for this question.");
        }
        let request = TextRequest::new(QUOTE_REPAIR_SYSTEM_PROMPT, user)
            .with_options(self.options(self.config.chat_model.as_ref()).temperature(0.0));
        let repaired = tokio::time::timeout(Duration::from_secs(120), self.llm.generate_text(request))
            .await
            .map_err(|_| EngineError::Retryable("quote repair timed out".into()))??;
        Ok(repaired.trim().to_string())
    }

    async fn fail_turn(
        &self,
        thread: &Thread,
        turn: &mut Turn,
        message_id: Uuid,
        partial: &str,
        cause: &EngineError,
        turn_ref: TurnRef,
    ) {
        error!(error = %cause, kind = ?cause.kind(), attempt = turn_ref.attempt, "turn failed");
        if let Err(e) = self
            .stores
            .messages
            .update_content(message_id, partial, MessageStatus::Error)
            .await
        {
            warn!(error = %e, "could not mark assistant message as failed");
        }
        turn.status = TurnStatus::Error;
        turn.completed_at = Some(Utc::now());
        if let Err(e) = self.stores.turns.update_turn(turn).await {
            warn!(error = %e, "could not mark turn as failed");
        }
        self.notifier
            .message_error(thread.user_id, thread.id, message_id, &cause.to_string(), turn_ref);
    }

    async fn enqueue_maintain(&self, thread: &Thread) -> Result<bool> {
        if self
            .stores
            .jobs
            .has_runnable_for_entity(thread.user_id, ENTITY_THREAD, Some(thread.id), CHAT_MAINTAIN)
            .await?
        {
            debug!("maintenance already queued");
            return Ok(false);
        }
        let payload = serde_json::to_value(ChatMaintainPayload { thread_id: thread.id })?;
        let outcome = self
            .stores
            .jobs
            .enqueue_unique(
                NewJob::new(thread.user_id, CHAT_MAINTAIN, ENTITY_THREAD, Some(thread.id), payload)
                    .with_max_attempts(self.maintain_attempts),
            )
            .await?;
        Ok(outcome.is_new())
    }
}
