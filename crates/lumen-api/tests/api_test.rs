use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures::StreamExt;
use lumen_api::{build_router, config::Config, state::AppState};
use lumen_engine::Engine;
use lumen_llm::{JsonRequest, LlmClient, LlmError, TextRequest, TextStream};
use lumen_persist::Stores;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const GREETING: &str = "Hello! Ready when you are.";

/// Answers small talk and fails everything else
struct GreeterLlm;

#[async_trait]
impl LlmClient for GreeterLlm {
    async fn embed(&self, _inputs: &[String]) -> lumen_llm::Result<Vec<Vec<f32>>> {
        Err(LlmError::Config("no embeddings in tests".into()))
    }

    async fn generate_json(&self, _request: JsonRequest) -> lumen_llm::Result<Value> {
        Err(LlmError::Config("no structured output in tests".into()))
    }

    async fn generate_text(&self, _request: TextRequest) -> lumen_llm::Result<String> {
        Ok(GREETING.to_string())
    }

    async fn stream_text(&self, _request: TextRequest) -> lumen_llm::Result<TextStream> {
        Err(LlmError::Config("no streaming in tests".into()))
    }

    async fn create_conversation(&self) -> lumen_llm::Result<String> {
        Err(LlmError::Config("no conversations in tests".into()))
    }

    async fn generate_text_in_conversation(&self, _id: &str, request: TextRequest) -> lumen_llm::Result<String> {
        self.generate_text(request).await
    }

    async fn stream_text_in_conversation(&self, _id: &str, request: TextRequest) -> lumen_llm::Result<TextStream> {
        self.stream_text(request).await
    }
}

fn test_config() -> Config {
    toml::from_str(
        r#"
        [server]
        host = "127.0.0.1"
        port = 8000

        [engine.jobs]
        workers = 1
        poll_interval_ms = 10
        "#,
    )
    .unwrap()
}

fn app() -> (Router, Engine) {
    let config = test_config();
    let engine = Engine::builder()
        .stores(Stores::in_memory())
        .llm_client(Arc::new(GreeterLlm))
        .config(config.engine_config())
        .build()
        .unwrap();
    (build_router(AppState::new(config, engine.clone())), engine)
}

fn request(method: &str, uri: &str, user: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn create_thread(app: &Router, user: Uuid) -> Uuid {
    let (status, body) = send(app, request("POST", "/threads", Some(user), Some(json!({"title": "Rust"})))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["thread_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = app();
    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"]["storage"], "connected");
}

#[tokio::test]
async fn test_requests_without_identity_are_rejected() {
    let (app, _) = app();
    let (status, body) = send(&app, request("GET", "/threads", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_thread_lifecycle_and_ownership() {
    let (app, _) = app();
    let owner = Uuid::new_v4();
    let thread_id = create_thread(&app, owner).await;

    let (status, body) = send(&app, request("GET", &format!("/threads/{}", thread_id), Some(owner), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Rust");
    assert_eq!(body["message_count"], 0);

    let (status, body) = send(&app, request("GET", "/threads", Some(owner), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["threads"].as_array().unwrap().len(), 1);

    let stranger = Uuid::new_v4();
    let (status, _) = send(&app, request("GET", &format!("/threads/{}", thread_id), Some(stranger), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request("GET", &format!("/threads/{}", Uuid::new_v4()), Some(owner), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_post_and_list_messages() {
    let (app, _) = app();
    let user = Uuid::new_v4();
    let thread_id = create_thread(&app, user).await;
    let uri = format!("/threads/{}/messages", thread_id);

    let (status, body) = send(&app, request("POST", &uri, Some(user), Some(json!({"content": "what is a trait?"})))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["user_message"]["seq"], 1);
    assert_eq!(body["assistant_message"]["seq"], 2);
    assert_eq!(body["assistant_message"]["status"], "streaming");

    let (status, _) = send(&app, request("POST", &uri, Some(user), Some(json!({"content": "   "})))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, request("GET", &format!("{}?limit=10", uri), Some(user), None)).await;
    assert_eq!(status, StatusCode::OK);
    let seqs: Vec<i64> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn test_openapi_document_lists_routes() {
    let (app, _) = app();
    let (status, body) = send(&app, request("GET", "/api/docs/openapi.json", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    let paths = body["paths"].as_object().unwrap();
    for path in ["/health", "/threads", "/threads/{thread_id}", "/threads/{thread_id}/messages", "/threads/{thread_id}/stream"] {
        assert!(paths.contains_key(path), "missing {}", path);
    }
}

#[tokio::test]
async fn test_stream_delivers_the_reply() {
    let (app, engine) = app();
    let user = Uuid::new_v4();
    let thread_id = create_thread(&app, user).await;

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/threads/{}/stream", thread_id), Some(user), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let mut frames = response.into_body().into_data_stream();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let workers = engine.start_workers(rx);

    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/threads/{}/messages", thread_id),
            Some(user),
            Some(json!({"content": "hey, how are you?"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut text = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(chunk)) = frames.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk));
            if text.contains("event: message_done") {
                break;
            }
        }
    })
    .await;
    assert!(read.is_ok(), "no message_done in {:?}", text);
    assert!(text.contains("event: message_created"));
    assert!(text.contains(GREETING));

    tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_stream_rejects_other_users() {
    let (app, _) = app();
    let thread_id = create_thread(&app, Uuid::new_v4()).await;
    let (status, _) = send(
        &app,
        request("GET", &format!("/threads/{}/stream", thread_id), Some(Uuid::new_v4()), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
