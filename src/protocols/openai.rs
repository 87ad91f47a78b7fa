// OpenAI-compatible response types used by the /v1 relay
// Based on OpenAI's API specification: https://platform.openai.com/docs/api-reference

use serde::{Deserialize, Serialize};

// ============= Streaming Response Types =============

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionStreamResponse {
    pub id: String,
    pub object: String, // "chat.completion.chunk"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatStreamChoice>,
}

impl ChatCompletionStreamResponse {
    pub fn content(id: &str, created: u64, model: &str, content: String) -> Self {
        let delta = ChatMessageDelta {
            role: None,
            content: Some(content),
        };
        Self::single(id, created, model, delta, None)
    }

    /// Empty delta carrying the finish reason
    pub fn finish(id: &str, created: u64, model: &str, reason: &str) -> Self {
        Self::single(
            id,
            created,
            model,
            ChatMessageDelta::default(),
            Some(reason.to_string()),
        )
    }

    fn single(
        id: &str,
        created: u64,
        model: &str,
        delta: ChatMessageDelta,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatStreamChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatMessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// ============= Non-streaming Response Types =============

/// Used when a task result carries no upstream body to return verbatim
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String, // "chat.completion"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ============= Error Response Types =============

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, error_type: &str, code: Option<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.to_string(),
                code,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_chunk_shapes() {
        let chunk =
            ChatCompletionStreamResponse::content("chatcmpl-1", 7, "gpt-4o-mini", "Hi".into());
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "created": 7,
                "model": "gpt-4o-mini",
                "choices": [{"index": 0, "delta": {"content": "Hi"}, "finish_reason": null}]
            })
        );

        let last = ChatCompletionStreamResponse::finish("chatcmpl-1", 7, "gpt-4o-mini", "stop");
        let value = serde_json::to_value(&last).unwrap();
        assert_eq!(value["choices"][0]["delta"], json!({}));
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_error_shape() {
        let err = ErrorResponse::new("boom", "server_error", None);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"error": {"message": "boom", "type": "server_error"}})
        );
    }
}
