use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::QueueName;

/// Pub/sub channel carrying the stream events of one session
pub fn stream_channel(session_id: &str) -> String {
    format!("llm:stream:{}", session_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work carried by a queued task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskKind {
    /// `completion_params` is handed to the upstream API untouched
    ChatCompletion {
        session_id: String,
        completion_params: Value,
    },
    BatchEmbeddings { texts: Vec<String>, model: String },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ChatCompletion { .. } => "chat_completion",
            TaskKind::BatchEmbeddings { .. } => "batch_embeddings",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            TaskKind::ChatCompletion { session_id, .. } => Some(session_id),
            TaskKind::BatchEmbeddings { .. } => None,
        }
    }

    /// Embedding batches are cheaper to give up on than chat sessions
    pub fn max_retries(&self, configured: u32) -> u32 {
        match self {
            TaskKind::ChatCompletion { .. } => configured,
            TaskKind::BatchEmbeddings { .. } => configured.min(2),
        }
    }
}

/// Queue payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub id: TaskId,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub queue: QueueName,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(kind: TaskKind, queue: QueueName, priority: i32) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            queue,
            priority,
            retries: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Same task, one retry further along
    pub fn next_attempt(&self) -> Self {
        Self {
            retries: self.retries + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

/// Stored task state, readable by the API while the task runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    pub queue: QueueName,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn pending(envelope: &TaskEnvelope) -> Self {
        let now = Utc::now();
        Self {
            task_id: envelope.id.clone(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retries: envelope.retries,
            queue: envelope.queue,
            created_at: envelope.enqueued_at,
            updated_at: now,
        }
    }

    /// Record for an id nobody has written yet. Unknown ids read as pending.
    pub fn unknown(task_id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retries: 0,
            queue: QueueName::Default,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&self, status: TaskStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn succeeded(&self, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            ..self.transition(TaskStatus::Success)
        }
    }

    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.transition(TaskStatus::Failure)
        }
    }
}

/// Events published on a session channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Status {
        status: String,
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Chunk {
        content: String,
        index: usize,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Error {
        error: String,
    },
    Timeout,
}

impl StreamEvent {
    pub fn started(task_id: &TaskId) -> Self {
        StreamEvent::Status {
            status: "started".to_string(),
            task_id: task_id.clone(),
            attempt: None,
            error: None,
        }
    }

    pub fn retrying(task_id: &TaskId, attempt: u32, error: &str) -> Self {
        StreamEvent::Status {
            status: "retrying".to_string(),
            task_id: task_id.clone(),
            attempt: Some(attempt),
            error: Some(error.to_string()),
        }
    }

    /// Whether the relay stops after forwarding this event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Complete { .. } | StreamEvent::Error { .. } | StreamEvent::Timeout
        )
    }

    pub fn to_json(&self) -> String {
        // Serialization of this enum cannot fail: all fields are strings and integers
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

/// Liveness record a worker process refreshes periodically
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub concurrency: usize,
    pub active_tasks: usize,
    pub queues: Vec<QueueName>,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
