// OpenAI Responses API wire types
// https://platform.openai.com/docs/api-reference/responses

use serde::{Deserialize, Serialize};

/// Non-streaming response from /v1/responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesResponse {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ResponsesResponse {
    /// Concatenated `output_text` across message items
    pub fn output_text(&self) -> String {
        let mut text = String::new();
        for item in &self.output {
            if let OutputItem::Message { content, .. } = item {
                for part in content {
                    if let ContentItem::OutputText { text: t, .. } = part {
                        text.push_str(t);
                    }
                }
            }
        }
        text
    }

    pub fn refusal(&self) -> Option<String> {
        self.output.iter().find_map(|item| match item {
            OutputItem::Message { content, .. } => content.iter().find_map(|part| match part {
                ContentItem::Refusal { refusal } => Some(refusal.clone()),
                _ => None,
            }),
            _ => None,
        })
    }
}

/// Item in the output array
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        #[serde(default)]
        id: String,
        #[serde(default)]
        role: String,
        #[serde(default)]
        content: Vec<ContentItem>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    OutputText {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotations: Option<Vec<serde_json::Value>>,
    },
    Refusal {
        refusal: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// Streaming chunk from /v1/responses (with stream=true)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseStreamChunk {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<StreamResponseRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseStreamChunk {
    pub fn error_message(&self) -> Option<String> {
        if let Some(msg) = &self.message {
            return Some(msg.clone());
        }
        if let Some(err) = &self.error {
            return err
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string());
        }
        self.response
            .as_ref()
            .and_then(|r| r.error.as_ref())
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponseRef {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

/// Response from POST /v1/conversations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationObject {
    pub id: String,
}

/// Response from POST /v1/embeddings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub data: Vec<EmbeddingData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub index: usize,
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_text_concatenates_message_parts() {
        let raw = r#"{
            "id": "resp_1",
            "status": "completed",
            "model": "gpt-4o-mini",
            "output": [
                {"type": "reasoning", "id": "rs_1", "summary": []},
                {"type": "message", "id": "msg_1", "role": "assistant",
                 "content": [{"type": "output_text", "text": "Hello "}, {"type": "output_text", "text": "there"}]}
            ]
        }"#;
        let resp: ResponsesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.output_text(), "Hello there");
        assert!(resp.refusal().is_none());
    }

    #[test]
    fn test_refusal_detected() {
        let raw = r#"{
            "id": "resp_2",
            "status": "completed",
            "output": [
                {"type": "message", "id": "msg_1", "role": "assistant",
                 "content": [{"type": "refusal", "refusal": "I can't help with that."}]}
            ]
        }"#;
        let resp: ResponsesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.refusal().as_deref(), Some("I can't help with that."));
    }
}
