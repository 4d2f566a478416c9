use futures::stream;
use lumen_llm::{collect_stream, LlmError, StreamEvent, TextStream};

fn stream_of(events: Vec<Result<StreamEvent, LlmError>>) -> TextStream {
    Box::pin(stream::iter(events))
}

#[test]
fn test_stream_event_serialization() {
    let event = StreamEvent::message("Hello");
    let json = serde_json::to_string(&event).unwrap();
    assert_eq!(json, r#"{"type":"message","content":"Hello"}"#);

    let done = serde_json::to_string(&StreamEvent::done()).unwrap();
    assert_eq!(done, r#"{"type":"done"}"#);
}

#[tokio::test]
async fn test_collect_stream_concatenates_deltas() {
    let stream = stream_of(vec![
        Ok(StreamEvent::message("Hel")),
        Ok(StreamEvent::message("lo")),
        Ok(StreamEvent::done()),
        Ok(StreamEvent::message("ignored")),
    ]);

    let mut deltas = Vec::new();
    let full = collect_stream(stream, |d| deltas.push(d.to_string()))
        .await
        .unwrap();

    assert_eq!(full, "Hello");
    assert_eq!(deltas, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn test_collect_stream_surfaces_midway_error() {
    let stream = stream_of(vec![
        Ok(StreamEvent::message("partial")),
        Err(LlmError::Http { status: 503, body: "overloaded".into() }),
    ]);

    let err = collect_stream(stream, |_| {}).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_collect_stream_refusal_is_terminal() {
    let stream = stream_of(vec![Ok(StreamEvent::Refusal {
        content: "can't".into(),
    })]);

    let err = collect_stream(stream, |_| {}).await.unwrap_err();
    assert!(err.is_refusal());
}
