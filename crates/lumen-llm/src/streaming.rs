use reqwest::Response;
use serde::{Deserialize, Serialize};

use crate::buffer_utils::{parse_sse_stream, SseEventParser};
use crate::error::{LlmError, Result};
use crate::openai::ResponseStreamChunk;
use crate::traits::TextStream;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Message {
        content: String,
    },

    Refusal {
        content: String,
    },

    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

impl StreamEvent {
    pub fn message(content: impl Into<String>) -> Self {
        StreamEvent::Message {
            content: content.into(),
        }
    }

    pub fn done() -> Self {
        StreamEvent::Done {
            response_id: None,
            finish_reason: None,
        }
    }
}

/// Maps Responses API stream events onto [`StreamEvent`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponsesEventParser;

impl SseEventParser for ResponsesEventParser {
    fn parse_data(&self, data: &str) -> Result<Vec<StreamEvent>> {
        let chunk: ResponseStreamChunk = serde_json::from_str(data)
            .map_err(|e| LlmError::Decode(format!("Failed to parse response chunk: {}", e)))?;

        match chunk.event_type.as_str() {
            "response.output_text.delta" => Ok(chunk
                .delta
                .filter(|d| !d.is_empty())
                .map(|content| vec![StreamEvent::Message { content }])
                .unwrap_or_default()),
            "response.refusal.delta" => Ok(chunk
                .delta
                .filter(|d| !d.is_empty())
                .map(|content| vec![StreamEvent::Refusal { content }])
                .unwrap_or_default()),
            "response.completed" | "response.incomplete" => Ok(vec![StreamEvent::Done {
                response_id: chunk.response.as_ref().map(|r| r.id.clone()),
                finish_reason: chunk.response.as_ref().map(|r| r.status.clone()),
            }]),
            "response.failed" | "error" => Err(LlmError::Http {
                status: 500,
                body: chunk.error_message().unwrap_or_else(|| data.to_string()),
            }),
            _ => Ok(Vec::new()),
        }
    }
}

pub fn parse_response_sse_stream(response: Response) -> TextStream {
    parse_sse_stream(response, ResponsesEventParser)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_delta_becomes_message() {
        let events = ResponsesEventParser
            .parse_data(r#"{"type":"response.output_text.delta","delta":"Hel"}"#)
            .unwrap();
        assert_eq!(events, vec![StreamEvent::message("Hel")]);
    }

    #[test]
    fn test_empty_delta_is_skipped() {
        let events = ResponsesEventParser
            .parse_data(r#"{"type":"response.output_text.delta","delta":""}"#)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_completed_carries_response_id() {
        let events = ResponsesEventParser
            .parse_data(
                r#"{"type":"response.completed","response":{"id":"resp_1","status":"completed"}}"#,
            )
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Done {
                response_id: Some("resp_1".to_string()),
                finish_reason: Some("completed".to_string()),
            }]
        );
    }

    #[test]
    fn test_failed_event_is_error() {
        let result = ResponsesEventParser
            .parse_data(r#"{"type":"error","error":{"message":"overloaded"}}"#);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        let events = ResponsesEventParser
            .parse_data(r#"{"type":"response.content_part.added"}"#)
            .unwrap();
        assert!(events.is_empty());
    }
}
