//! Shared fixtures: a scripted `LlmClient` and an engine over in-memory stores

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use lumen_engine::{CancelToken, Engine, EngineConfig, JobRun, Subscription};
use lumen_llm::{JsonRequest, LlmClient, LlmError, StreamEvent, TextRequest, TextStream};
use lumen_persist::{InMemoryVectorStore, MemoryStore, Stores};
use lumen_types::{
    ChatMessage, LearningPath, MaterialChunk, MaterialFile, MessageRole, MessageStatus, NewMessage, PathNode,
    SseMessage, Thread,
};
use serde_json::{json, Value};
use uuid::Uuid;

const EMBED_DIM: usize = 16;

/// Bag-of-words embedding; equal texts embed equally
pub fn embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBED_DIM];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        v[bucket % EMBED_DIM] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

/// How one streamed answer plays out
pub enum Reply {
    Text(Vec<String>),
    FailAfter(Vec<String>, LlmError),
    /// Emits the deltas and then never finishes
    Stall(Vec<String>),
}

impl Reply {
    pub fn text(deltas: &[&str]) -> Self {
        Reply::Text(deltas.iter().map(|d| d.to_string()).collect())
    }

    fn into_stream(self) -> TextStream {
        fn deltas(parts: Vec<String>) -> Vec<lumen_llm::Result<StreamEvent>> {
            parts.into_iter().map(|d| Ok(StreamEvent::message(d))).collect()
        }
        match self {
            Reply::Text(parts) => {
                let mut events = deltas(parts);
                events.push(Ok(StreamEvent::done()));
                Box::pin(stream::iter(events))
            }
            Reply::FailAfter(parts, err) => {
                let mut events = deltas(parts);
                events.push(Err(err));
                Box::pin(stream::iter(events))
            }
            Reply::Stall(parts) => Box::pin(stream::iter(deltas(parts)).chain(stream::pending())),
        }
    }
}

/// Provider stand-in: scripted replies first, deterministic defaults after
#[derive(Default)]
pub struct StubLlm {
    replies: Mutex<VecDeque<Reply>>,
    texts: Mutex<VecDeque<String>>,
    json: Mutex<HashMap<String, VecDeque<Value>>>,
    calls: Mutex<Vec<String>>,
    stream_requests: Mutex<Vec<TextRequest>>,
    embed_sizes: Mutex<Vec<usize>>,
    embed_poison: Mutex<Option<String>>,
    conversations: AtomicUsize,
}

impl StubLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn script_text(&self, text: impl Into<String>) {
        self.texts.lock().unwrap().push_back(text.into());
    }

    pub fn script_json(&self, schema: &str, value: Value) {
        self.json
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default()
            .push_back(value);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == call).count()
    }

    /// Input count of every embeddings request so far
    pub fn embed_sizes(&self) -> Vec<usize> {
        self.embed_sizes.lock().unwrap().clone()
    }

    /// Fail any embeddings request with an input containing `word`
    pub fn poison_embeds(&self, word: &str) {
        *self.embed_poison.lock().unwrap() = Some(word.to_string());
    }

    pub fn stream_requests(&self) -> Vec<TextRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn next_stream(&self, request: TextRequest) -> TextStream {
        self.stream_requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::text(&["Sure, ", "here you go."]));
        reply.into_stream()
    }

    fn default_json(request: &JsonRequest) -> Option<Value> {
        match request.schema.name.as_str() {
            "turn_route" => Some(json!({"route": "product", "tool": "", "arguments": "{}"})),
            "contextual_text" => {
                let chunk = request.user.rsplit("Chunk:\n").next().unwrap_or_default();
                Some(json!({"contextual_text": format!("From the study chat: {}", chunk.trim())}))
            }
            "summary" => {
                let digest: String = request
                    .user
                    .split_whitespace()
                    .take(24)
                    .collect::<Vec<_>>()
                    .join(" ");
                Some(json!({"summary_md": format!("Summary: {}", digest)}))
            }
            "chat_graph" => Some(json!({"entities": [], "relations": [], "claims": []})),
            "memory_items" => Some(json!({"items": []})),
            _ => None,
        }
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    async fn embed(&self, inputs: &[String]) -> lumen_llm::Result<Vec<Vec<f32>>> {
        self.record("embed");
        self.embed_sizes.lock().unwrap().push(inputs.len());
        let poison = self.embed_poison.lock().unwrap().clone();
        if let Some(word) = poison {
            if inputs.iter().any(|t| t.contains(&word)) {
                return Err(LlmError::Http {
                    status: 500,
                    body: "embedding backend failed".into(),
                });
            }
        }
        Ok(inputs.iter().map(|t| embedding(t)).collect())
    }

    async fn generate_json(&self, request: JsonRequest) -> lumen_llm::Result<Value> {
        let name = request.schema.name.clone();
        self.record(format!("json:{}", name));
        let scripted = self
            .json
            .lock()
            .unwrap()
            .get_mut(&name)
            .and_then(|queue| queue.pop_front());
        match scripted.or_else(|| Self::default_json(&request)) {
            Some(value) => Ok(value),
            None => Err(LlmError::Config(format!("no structured output scripted for {}", name))),
        }
    }

    async fn generate_text(&self, _request: TextRequest) -> lumen_llm::Result<String> {
        self.record("text");
        Ok(self
            .texts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Doing well, thanks! What are we studying today?".to_string()))
    }

    async fn stream_text(&self, request: TextRequest) -> lumen_llm::Result<TextStream> {
        self.record("stream");
        Ok(self.next_stream(request))
    }

    async fn create_conversation(&self) -> lumen_llm::Result<String> {
        self.record("conversation");
        let n = self.conversations.fetch_add(1, Ordering::SeqCst);
        Ok(format!("conv_{}", n))
    }

    async fn generate_text_in_conversation(&self, _id: &str, request: TextRequest) -> lumen_llm::Result<String> {
        self.generate_text(request).await
    }

    async fn stream_text_in_conversation(&self, _id: &str, request: TextRequest) -> lumen_llm::Result<TextStream> {
        self.record("stream");
        Ok(self.next_stream(request))
    }
}

pub struct Harness {
    pub memory: Arc<MemoryStore>,
    pub vectors: Arc<InMemoryVectorStore>,
    pub stores: Stores,
    pub llm: Arc<StubLlm>,
    pub engine: Engine,
    pub user_id: Uuid,
}

/// Defaults with backoff short enough to retry inside a test
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.jobs.backoff_base_ms = 5;
    config.jobs.backoff_cap_ms = 10;
    config.jobs.poll_interval_ms = 10;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let memory = Arc::new(MemoryStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let stores = Stores::from_memory(memory.clone(), vectors.clone());
        let llm = StubLlm::new();
        let engine = Engine::builder()
            .stores(stores.clone())
            .llm_client(llm.clone())
            .config(config)
            .build()
            .unwrap();
        Self {
            memory,
            vectors,
            stores,
            llm,
            engine,
            user_id: Uuid::new_v4(),
        }
    }

    pub async fn thread(&self, path_id: Option<Uuid>) -> Thread {
        self.engine
            .chat
            .create_thread(self.user_id, Some("Study chat".into()), path_id)
            .await
            .unwrap()
    }

    /// Lease and run due jobs until none is left
    pub async fn run_jobs(&self) -> Vec<JobRun> {
        let mut runs = Vec::new();
        while let Some(run) = self.engine.runtime.run_once(CancelToken::never()).await.unwrap() {
            runs.push(run);
        }
        runs
    }

    pub async fn message(&self, id: Uuid) -> ChatMessage {
        self.stores.messages.get_message(id).await.unwrap().unwrap()
    }

    /// Finished exchanges appended straight to the log, `pairs * 2` messages
    pub async fn seed_exchanges(&self, thread: &Thread, pairs: usize) -> Vec<ChatMessage> {
        let mut out = Vec::new();
        for i in 0..pairs {
            let question = NewMessage::user(
                thread.id,
                self.user_id,
                format!("Question {} about ownership and borrowing in Rust?", i),
            );
            out.push(self.stores.messages.append_message(question).await.unwrap());
            let answer = NewMessage {
                thread_id: thread.id,
                user_id: self.user_id,
                role: MessageRole::Assistant,
                content: format!("Answer {}: a value has exactly one owner, and borrows must not outlive it.", i),
                status: MessageStatus::Done,
                metadata: json!({}),
            };
            out.push(self.stores.messages.append_message(answer).await.unwrap());
        }
        out
    }

    /// Path with two units and one lesson each
    pub async fn path(&self, material_set_id: Option<Uuid>) -> LearningPath {
        let now = Utc::now();
        let path = LearningPath {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            title: "Rust Foundations".into(),
            description: "Ownership, borrowing and lifetimes".into(),
            material_set_id,
            job_id: None,
            status: "ready".into(),
            created_at: now,
            updated_at: now,
        };
        self.memory.insert_path(path.clone()).await;
        for (index, (unit, lesson)) in [("Ownership Basics", "Moves and copies"), ("Borrowing Rules", "Shared references")]
            .into_iter()
            .enumerate()
        {
            let unit_id = Uuid::new_v4();
            self.memory
                .insert_node(PathNode {
                    id: unit_id,
                    path_id: path.id,
                    parent_id: None,
                    index: index as u32,
                    title: unit.into(),
                    goal: String::new(),
                    kind: "module".into(),
                    updated_at: now,
                })
                .await;
            self.memory
                .insert_node(PathNode {
                    id: Uuid::new_v4(),
                    path_id: path.id,
                    parent_id: Some(unit_id),
                    index: 0,
                    title: lesson.into(),
                    goal: String::new(),
                    kind: "lesson".into(),
                    updated_at: now,
                })
                .await;
        }
        path
    }

    /// One uploaded file with a single embedded chunk on `page`
    pub async fn material(&self, material_set_id: Uuid, file_name: &str, text: &str, page: u32) -> MaterialChunk {
        let now = Utc::now();
        let file = MaterialFile {
            id: Uuid::new_v4(),
            material_set_id,
            user_id: self.user_id,
            original_name: file_name.into(),
            mime_type: "application/pdf".into(),
            summary: None,
            created_at: now,
        };
        let chunk = MaterialChunk {
            id: Uuid::new_v4(),
            material_set_id,
            material_file_id: file.id,
            index: 0,
            text: text.into(),
            embedding: embedding(text),
            page: Some(page),
            start_sec: None,
            end_sec: None,
            created_at: now,
        };
        self.memory.insert_material_file(file).await;
        self.memory.insert_material_chunk(chunk.clone()).await;
        chunk
    }
}

/// Everything queued for a subscriber right now
pub fn drain(sub: &mut Subscription) -> Vec<SseMessage> {
    let mut out = Vec::new();
    while let Some(msg) = sub.try_recv() {
        out.push(msg);
    }
    out
}
