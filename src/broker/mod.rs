//! Broker abstraction
//!
//! The broker carries three kinds of traffic between the API and the workers:
//! 1. Priority task queues (API enqueues, workers dequeue)
//! 2. Per-session pub/sub channels for stream events
//! 3. Short-lived task records and worker heartbeats

pub mod factory;
pub mod memory;
pub mod redis;

pub use factory::create_broker;
pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::RateLimit;
use crate::core::RateLimiter;
use crate::tasks::{QueueName, TaskEnvelope, TaskId, TaskRecord, WorkerHeartbeat};

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Broker error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Backend(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for BrokerError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        BrokerError::Connection(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Stream of raw payloads received on a subscribed channel
pub type Subscription = BoxStream<'static, String>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Short backend name reported by health endpoints
    fn kind(&self) -> &'static str;

    async fn ping(&self) -> BrokerResult<()>;

    async fn enqueue(&self, envelope: &TaskEnvelope) -> BrokerResult<()>;

    /// Pop the next task, draining `queues` in the given order.
    /// Returns `None` when nothing arrived within `timeout`.
    async fn dequeue(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> BrokerResult<Option<TaskEnvelope>>;

    async fn queue_len(&self, queue: QueueName) -> BrokerResult<usize>;

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()>;

    /// The subscription is live once this returns; anything published afterwards is delivered.
    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription>;

    async fn store_task(&self, record: &TaskRecord, ttl: Duration) -> BrokerResult<()>;

    async fn load_task(&self, task_id: &TaskId) -> BrokerResult<Option<TaskRecord>>;

    async fn register_worker(&self, heartbeat: &WorkerHeartbeat, ttl: Duration)
        -> BrokerResult<()>;

    async fn unregister_worker(&self, worker_id: &str) -> BrokerResult<()>;

    async fn list_workers(&self) -> BrokerResult<Vec<WorkerHeartbeat>>;

    /// Rate limiter shared by every worker attached to this broker
    fn rate_limiter(&self, key: &str, limit: RateLimit) -> Arc<dyn RateLimiter>;
}

pub type SharedBroker = Arc<dyn Broker>;

pub(crate) fn queue_key(queue: QueueName) -> String {
    format!("llm:queue:{}", queue.as_str())
}

pub(crate) fn task_key(task_id: &TaskId) -> String {
    format!("llm:task:{}", task_id)
}

pub(crate) fn worker_key(worker_id: &str) -> String {
    format!("llm:worker:{}", worker_id)
}
