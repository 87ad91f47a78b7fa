use std::time::Duration;

use tracing::info;

use super::{QueueName, TaskEnvelope, TaskKind, TaskRecord};
use crate::broker::{BrokerResult, SharedBroker};

/// API-side handle for queueing tasks
#[derive(Clone)]
pub struct Dispatcher {
    broker: SharedBroker,
    result_ttl: Duration,
}

impl Dispatcher {
    pub fn new(broker: SharedBroker, result_ttl: Duration) -> Self {
        Self { broker, result_ttl }
    }

    /// Queue `kind` on the queue chosen by `priority`
    pub async fn submit(&self, kind: TaskKind, priority: i32) -> BrokerResult<TaskEnvelope> {
        self.submit_to(kind, QueueName::from_priority(priority), priority)
            .await
    }

    pub async fn submit_to(
        &self,
        kind: TaskKind,
        queue: QueueName,
        priority: i32,
    ) -> BrokerResult<TaskEnvelope> {
        let envelope = TaskEnvelope::new(kind, queue, priority);

        // The record exists before any worker can see the task
        self.broker
            .store_task(&TaskRecord::pending(&envelope), self.result_ttl)
            .await?;
        self.broker.enqueue(&envelope).await?;

        info!(
            "Task {} ({}) queued (queue: {})",
            envelope.id,
            envelope.kind.name(),
            envelope.queue
        );
        Ok(envelope)
    }
}
