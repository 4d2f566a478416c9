use lumen_llm::{GenerateOptions, JsonRequest, JsonSchema, Message, TextRequest};
use serde_json::json;

#[test]
fn test_text_request_creation() {
    let request = TextRequest::new("You are a tutor.", "What is a monad?");

    assert_eq!(request.system, "You are a tutor.");
    assert_eq!(request.user, "What is a monad?");
    assert!(request.history.is_empty());
    assert_eq!(request.options.model, None);
}

#[test]
fn test_text_request_with_history_and_options() {
    let history = vec![Message::user("hi"), Message::assistant("hello!")];
    let options = GenerateOptions::new()
        .model("gpt-4o-mini")
        .temperature(0.3)
        .max_output_tokens(400);

    let request = TextRequest::new("sys", "next")
        .with_history(history)
        .with_options(options);

    assert_eq!(request.history.len(), 2);
    assert_eq!(request.options.model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(request.options.temperature, Some(0.3));
    assert_eq!(request.options.max_output_tokens, Some(400));
}

#[test]
fn test_json_request_carries_schema() {
    let schema = JsonSchema::new(
        "contextual_query",
        json!({"type": "object", "required": ["contextual_query"]}),
    );
    let request = JsonRequest::new("rewrite", "units?", schema.clone());

    assert_eq!(request.schema, schema);
    assert!(request.schema.strict);
}

#[test]
fn test_message_roles() {
    assert_eq!(Message::system("s").role(), "system");
    assert_eq!(Message::user("u").role(), "user");
    assert_eq!(Message::assistant("a").role(), "assistant");
    assert_eq!(Message::user("u").content(), "u");
}

#[test]
fn test_message_serializes_with_role_tag() {
    let value = serde_json::to_value(Message::assistant("done")).unwrap();
    assert_eq!(value, json!({"role": "assistant", "content": "done"}));
}
