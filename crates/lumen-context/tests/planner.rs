use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use lumen_context::retriever::vector_record;
use lumen_context::{
    CharsEstimator, ContextConfig, ContextError, ContextPlanner, DefaultContextPlanner, PlanInput,
    INTAKE_QUESTIONS_KIND,
};
use lumen_llm::{JsonRequest, LlmClient, LlmError, StreamEvent, TextRequest, TextStream};
use lumen_persist::{InMemoryVectorStore, MemoryStore, Stores};
use lumen_types::ids::{self, CHAT_DOC_VERSION, CHAT_PATH_DOC_VERSION};
use lumen_types::{
    ChatDoc, ChatMessage, DocType, JobStatus, LearningPath, NewJob, NewMessage, PathNode, Scope,
    SummaryNode, Thread, ThreadState,
};
use serde_json::{json, Value};
use uuid::Uuid;

/// Every text embeds to the same unit vector; structured calls are refused
struct FlatLlm;

#[async_trait]
impl LlmClient for FlatLlm {
    async fn embed(&self, inputs: &[String]) -> lumen_llm::Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
    }

    async fn generate_json(&self, request: JsonRequest) -> lumen_llm::Result<Value> {
        Err(LlmError::Config(format!("no structured output for {}", request.schema.name)))
    }

    async fn generate_text(&self, _request: TextRequest) -> lumen_llm::Result<String> {
        Ok(String::new())
    }

    async fn stream_text(&self, _request: TextRequest) -> lumen_llm::Result<TextStream> {
        Ok(Box::pin(stream::iter(vec![Ok(StreamEvent::done())])))
    }

    async fn create_conversation(&self) -> lumen_llm::Result<String> {
        Ok("conv".into())
    }

    async fn generate_text_in_conversation(&self, _id: &str, request: TextRequest) -> lumen_llm::Result<String> {
        self.generate_text(request).await
    }

    async fn stream_text_in_conversation(&self, _id: &str, request: TextRequest) -> lumen_llm::Result<TextStream> {
        self.stream_text(request).await
    }
}

struct Fixture {
    memory: Arc<MemoryStore>,
    stores: Stores,
    user_id: Uuid,
}

impl Fixture {
    fn new() -> Self {
        let memory = Arc::new(MemoryStore::new());
        let stores = Stores::from_memory(memory.clone(), Arc::new(InMemoryVectorStore::new()));
        Self {
            memory,
            stores,
            user_id: Uuid::new_v4(),
        }
    }

    fn planner(&self, config: ContextConfig) -> DefaultContextPlanner {
        DefaultContextPlanner::with_estimator(self.stores.clone(), Arc::new(FlatLlm), config, Arc::new(CharsEstimator))
    }

    async fn thread(&self, path_id: Option<Uuid>) -> Thread {
        self.stores
            .threads
            .create_thread(Thread::new(self.user_id, "Study chat", path_id))
            .await
            .unwrap()
    }

    async fn say(&self, thread: &Thread, content: &str) -> ChatMessage {
        self.stores
            .messages
            .append_message(NewMessage::user(thread.id, self.user_id, content))
            .await
            .unwrap()
    }

    async fn index(&self, docs: Vec<ChatDoc>) {
        let records = docs.iter().map(vector_record).collect();
        self.stores.docs.upsert_docs(docs).await.unwrap();
        self.stores
            .vectors
            .upsert(&ids::user_namespace(self.user_id), records)
            .await
            .unwrap();
    }

    async fn input(&self, thread_id: Uuid, message: ChatMessage) -> PlanInput {
        let thread = self.stores.threads.get_thread(thread_id).await.unwrap().unwrap();
        PlanInput {
            user_id: self.user_id,
            state: ThreadState::new(thread.id),
            user_text: message.content.clone(),
            user_message: message,
            thread,
        }
    }

    async fn path(&self, owner: Uuid, title: &str) -> LearningPath {
        let now = Utc::now();
        let path = LearningPath {
            id: Uuid::new_v4(),
            user_id: owner,
            title: title.into(),
            description: "Ownership, borrowing and lifetimes".into(),
            material_set_id: None,
            job_id: None,
            status: "ready".into(),
            created_at: now,
            updated_at: now,
        };
        self.memory.insert_path(path.clone()).await;
        self.memory
            .insert_node(PathNode {
                id: Uuid::new_v4(),
                path_id: path.id,
                parent_id: None,
                index: 0,
                title: "Ownership".into(),
                goal: "Understand moves".into(),
                kind: "module".into(),
                updated_at: now,
            })
            .await;
        path
    }
}

fn offline_config() -> ContextConfig {
    ContextConfig {
        router_use_llm: false,
        query_rewrite: false,
        rerank_enabled: false,
        ..ContextConfig::default()
    }
}

fn with_embedding(mut doc: ChatDoc) -> ChatDoc {
    doc.embedding = vec![1.0, 0.0];
    doc
}

#[tokio::test]
async fn test_hot_window_messages_are_not_retrieved_twice() {
    let fx = Fixture::new();
    let thread = fx.thread(None).await;
    let first = fx.say(&thread, "We picked Postgres for the ledger service").await;
    fx.say(&thread, "Good call, Postgres handles the ledger transactions well").await;
    let current = fx.say(&thread, "Which database did we settle on earlier for the ledger?").await;

    let chunk = with_embedding(
        ChatDoc::projected(
            fx.user_id,
            DocType::MessageChunk,
            Scope::Thread,
            Some(thread.id),
            first.id,
            0,
            CHAT_DOC_VERSION,
            first.content.clone(),
        )
        .in_thread(thread.id)
        .at_seq(first.seq),
    );
    let summary = with_embedding(
        ChatDoc::projected(
            fx.user_id,
            DocType::Summary,
            Scope::Thread,
            Some(thread.id),
            Uuid::new_v4(),
            0,
            CHAT_DOC_VERSION,
            "The team compared databases and chose Postgres for the ledger because of its transactions",
        )
        .in_thread(thread.id),
    );
    fx.index(vec![chunk.clone(), summary.clone()]).await;

    let plan = fx
        .planner(offline_config())
        .plan(fx.input(thread.id, current.clone()).await)
        .await
        .unwrap();

    let used: Vec<Uuid> = plan.used_docs.iter().map(|d| d.id).collect();
    assert!(used.contains(&summary.id));
    assert!(!used.contains(&chunk.id));
    assert!(plan
        .evidence_sources
        .iter()
        .any(|s| s.id == format!("doc:{}", summary.id)));
    assert!(plan.instructions.contains("Recent conversation"));
    assert!(plan.instructions.contains("User: We picked Postgres"));
    assert!(!plan.instructions.contains(&current.content));
    assert_eq!(plan.user_payload, current.content);
}

fn summary(thread_id: Uuid, level: u32, range: (i64, i64), text: &str, parent_id: Option<Uuid>) -> SummaryNode {
    let now = Utc::now();
    SummaryNode {
        id: Uuid::new_v4(),
        thread_id,
        parent_id,
        level,
        start_seq: range.0,
        end_seq: range.1,
        summary_md: text.into(),
        child_node_ids: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_summary_lane_includes_lower_level_orphans() {
    let fx = Fixture::new();
    let thread = fx.thread(None).await;
    let parent = summary(thread.id, 1, (1, 40), "Covered ownership and moves.", None);
    let summaries = [
        summary(thread.id, 0, (1, 20), "Leaf on ownership.", Some(parent.id)),
        summary(thread.id, 0, (21, 40), "Leaf on moves.", Some(parent.id)),
        summary(thread.id, 0, (41, 60), "Then lifetimes and elision.", None),
        parent,
    ];
    for node in summaries {
        fx.stores.summaries.insert_node(node).await.unwrap();
    }
    let current = fx.say(&thread, "Where did we leave off?").await;

    let plan = fx
        .planner(offline_config())
        .plan(fx.input(thread.id, current).await)
        .await
        .unwrap();

    let covered = plan.instructions.find("Covered ownership and moves.").unwrap();
    let orphan = plan.instructions.find("Then lifetimes and elision.").unwrap();
    assert!(covered < orphan);
    assert!(!plan.instructions.contains("Leaf on moves."));
}

#[tokio::test]
async fn test_missing_path_docs_are_synthesized() {
    let fx = Fixture::new();
    let path = fx.path(fx.user_id, "Rust Basics").await;
    let thread = fx.thread(Some(path.id)).await;
    let current = fx.say(&thread, "Can you show me the course outline?").await;

    let plan = fx
        .planner(offline_config())
        .plan(fx.input(thread.id, current).await)
        .await
        .unwrap();

    let overview_id = ids::chat_doc_id(DocType::PathOverview, path.id, 0, CHAT_PATH_DOC_VERSION);
    assert!(plan.instructions.contains("Learning path: Rust Basics"));
    assert!(plan
        .evidence_sources
        .iter()
        .any(|s| s.id == format!("doc:{}", overview_id)));
    assert!(plan.used_docs.iter().any(|d| d.id == overview_id));
}

#[tokio::test]
async fn test_foreign_path_is_ignored() {
    let fx = Fixture::new();
    let path = fx.path(Uuid::new_v4(), "Someone Else's Path").await;
    let thread = fx.thread(Some(path.id)).await;
    let current = fx.say(&thread, "What is in the course outline?").await;

    let plan = fx
        .planner(offline_config())
        .plan(fx.input(thread.id, current).await)
        .await
        .unwrap();

    assert!(!plan.instructions.contains("Someone Else's Path"));
    assert!(plan.used_docs.iter().all(|d| d.doc_type != DocType::PathOverview));
}

#[tokio::test]
async fn test_intake_questions_pinned_while_job_waits() {
    let fx = Fixture::new();
    let thread = fx.thread(None).await;
    fx.stores
        .messages
        .append_message(
            NewMessage::user(thread.id, fx.user_id, "Before I build your path: what is your current level with calculus?")
                .with_metadata(json!({ "kind": INTAKE_QUESTIONS_KIND })),
        )
        .await
        .unwrap();
    for i in 0..4 {
        fx.say(&thread, &format!("Unrelated chatter number {}", i)).await;
    }
    let current = fx.say(&thread, "I took one semester of it in college").await;

    let job = fx
        .stores
        .jobs
        .enqueue(NewJob::new(fx.user_id, "learning_build", "thread", Some(thread.id), json!({})))
        .await
        .unwrap();
    fx.memory
        .set_job_status(job.id, JobStatus::WaitingUser, Some("waitpoint_intake".into()))
        .await
        .unwrap();
    fx.stores.threads.set_thread_job(thread.id, Some(job.id)).await.unwrap();

    let config = ContextConfig {
        hot_window_keep: 2,
        ..offline_config()
    };
    let plan = fx
        .planner(config)
        .plan(fx.input(thread.id, current).await)
        .await
        .unwrap();

    assert!(plan.instructions.contains("Pinned intake questions"));
    assert!(plan.instructions.contains("current level with calculus"));
    assert!(!plan.instructions.contains("Unrelated chatter number 0"));
}

#[tokio::test]
async fn test_blank_message_rejected() {
    let fx = Fixture::new();
    let thread = fx.thread(None).await;
    let current = fx.say(&thread, "   ").await;

    let err = fx
        .planner(offline_config())
        .plan(fx.input(thread.id, current).await)
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::InputInvalid(_)));
}
