use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tasks::{TaskId, TaskRecord, TaskStatus, MAX_PRIORITY, MIN_PRIORITY};

/// Body of `POST /chat` and `POST /chat/async`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Falls back to the configured default model
    #[serde(default)]
    pub model: Option<String>,
    /// Falls back to the configured default system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(format!(
                "priority must be between {} and {}, got {}",
                MIN_PRIORITY, MAX_PRIORITY, self.priority
            ));
        }
        Ok(())
    }

    /// Upstream chat completion parameters for this request
    pub fn completion_params(&self, default_model: &str, default_system_prompt: &str) -> Value {
        let mut params = json!({
            "model": self.model.as_deref().unwrap_or(default_model),
            "messages": [
                {
                    "role": "system",
                    "content": self.system_prompt.as_deref().unwrap_or(default_system_prompt),
                },
                {"role": "user", "content": self.message},
            ],
            "stream": self.stream,
        });
        if let Some(user) = &self.user_id {
            params["user"] = json!(user);
        }
        params
    }
}

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const MAX_EMBEDDING_TEXTS: usize = 100;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingsRequest {
    pub texts: Vec<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

/// Response of an accepted chat task
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskResponse {
    pub status: String,
    pub task_id: TaskId,
    pub session_id: String,
    pub stream_url: String,
}

impl TaskResponse {
    pub fn queued(task_id: TaskId, session_id: String) -> Self {
        Self {
            status: "queued".to_string(),
            stream_url: format!("/stream/{}", session_id),
            task_id,
            session_id,
        }
    }
}

/// `GET /chat/{task_id}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TaskRecord> for TaskStatusResponse {
    fn from(record: TaskRecord) -> Self {
        let ready = record.status.is_ready();
        let (result, error) = match record.status {
            TaskStatus::Success => (record.result, None),
            TaskStatus::Failure => (None, record.error),
            _ => (None, None),
        };
        Self {
            task_id: record.task_id,
            status: record.status,
            ready,
            result,
            error,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamQuery {
    pub timeout: Option<u64>,
}
