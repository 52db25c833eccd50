//! API request and response models.
//!
//! Requests are parsed only as far as routing needs; every other field is
//! carried through untouched so the forwarded body matches what the client
//! sent, apart from the model name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Chat completion request following OpenAI API format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model identifier
    pub model: String,

    /// Conversation messages
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Everything else, forwarded unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// True if any message carries a non-empty list of content parts.
    pub fn has_multi_content(&self) -> bool {
        self.messages.iter().any(Message::is_multi_content)
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", "assistant", "tool"
    pub role: String,

    /// Absent for e.g. assistant tool calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn is_multi_content(&self) -> bool {
        matches!(&self.content, Some(MessageContent::Parts(parts)) if !parts.is_empty())
    }
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One typed content part (`text`, `image_url`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Model information for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// List of available models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

impl ModelList {
    /// Build a listing from model names, all stamped with `created`.
    pub fn from_names(names: impl IntoIterator<Item = String>, created: i64) -> Self {
        Self {
            object: "list".to_string(),
            data: names
                .into_iter()
                .map(|id| ModelInfo {
                    id,
                    object: "model".to_string(),
                    created,
                    owned_by: "openai".to_string(),
                })
                .collect(),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Number of routable model names
    pub models: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_completion_request_with_extra_params() {
        let json = r#"{
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": 0.7,
            "top_p": 0.9,
            "stream": true
        }"#;

        let request: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.model, "gpt-4");
        assert!(request.is_stream());
        assert_eq!(request.extra["temperature"], json!(0.7));
        assert!(!request.has_multi_content());
    }

    #[test]
    fn test_extra_fields_round_trip() {
        let original = json!({
            "model": "qwen-7b",
            "messages": [
                {"role": "assistant", "tool_calls": [{"id": "c1"}]},
                {"role": "tool", "content": "42", "tool_call_id": "c1"}
            ],
            "max_tokens": 100
        });

        let request: ChatCompletionRequest = serde_json::from_value(original.clone()).unwrap();
        assert!(request.messages[0].content.is_none());
        assert_eq!(serde_json::to_value(&request).unwrap(), original);
    }

    #[test]
    fn test_multi_part_content_detected() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "What is this?"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
                ]
            }]
        }))
        .unwrap();

        assert!(request.has_multi_content());
        match &request.messages[0].content {
            Some(MessageContent::Parts(parts)) => {
                assert_eq!(parts[1].kind, "image_url");
                assert!(parts[1].extra.contains_key("image_url"));
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_empty_parts_are_not_multi_content() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": []}]
        }))
        .unwrap();
        assert!(!request.has_multi_content());
    }

    #[test]
    fn test_model_list_serialization() {
        let list = ModelList::from_names(vec!["a".to_string(), "random".to_string()], 1700000000);
        let value = serde_json::to_value(&list).unwrap();
        assert_eq!(value["object"], "list");
        assert_eq!(value["data"][1]["id"], "random");
        assert_eq!(value["data"][0]["owned_by"], "openai");
    }
}
