//! Task model and worker runtime
//!
//! The API side only needs [`Dispatcher`]; the worker side runs [`WorkerPool`],
//! which executes the chat and embeddings tasks against the upstream API.

pub mod chat;
pub mod context;
pub mod dispatcher;
pub mod embeddings;
pub mod error;
pub mod queue;
pub mod types;
pub mod worker;

pub use context::{TaskContext, UPSTREAM_RATE_LIMIT_KEY};
pub use dispatcher::Dispatcher;
pub use error::TaskError;
pub use queue::{parse_queue_list, QueueName, MAX_PRIORITY, MIN_PRIORITY};
pub use types::{
    stream_channel, StreamEvent, TaskEnvelope, TaskId, TaskKind, TaskRecord, TaskStatus,
    WorkerHeartbeat,
};
pub use worker::WorkerPool;
