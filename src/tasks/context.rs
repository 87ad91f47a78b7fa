use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::error::TaskResult;
use super::{chat, embeddings, stream_channel, StreamEvent, TaskEnvelope, TaskKind};
use crate::broker::SharedBroker;
use crate::core::RateLimiter;
use crate::openai::OpenAIClient;

/// Rate limiter key shared by every upstream call
pub const UPSTREAM_RATE_LIMIT_KEY: &str = "openai";

/// Everything a task needs while it runs
pub struct TaskContext {
    pub broker: SharedBroker,
    pub openai: OpenAIClient,
    pub limiter: Arc<dyn RateLimiter>,
    /// Wait for a rate limit token before a chat call; embeddings wait twice as long
    pub rate_limit_timeout: Duration,
}

impl TaskContext {
    /// Run one attempt of the task carried by `envelope`
    pub async fn execute(&self, envelope: &TaskEnvelope) -> TaskResult<Value> {
        match &envelope.kind {
            TaskKind::ChatCompletion {
                session_id,
                completion_params,
            } => chat::run(self, &envelope.id, session_id, completion_params).await,
            TaskKind::BatchEmbeddings { texts, model } => {
                embeddings::run(self, texts, model).await
            }
        }
    }

    /// Publish on the session channel, failing the attempt when the broker is unreachable
    pub async fn publish(&self, session_id: &str, event: &StreamEvent) -> TaskResult<()> {
        self.broker
            .publish(&stream_channel(session_id), &event.to_json())
            .await?;
        Ok(())
    }

    /// Publish where a failure can only be logged
    pub async fn publish_best_effort(&self, session_id: &str, event: &StreamEvent) {
        if let Err(e) = self.publish(session_id, event).await {
            warn!("Failed to publish to session {}: {}", session_id, e);
        }
    }
}
