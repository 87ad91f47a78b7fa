//! Worker pool
//!
//! One process runs `concurrency` slots. A slot is taken before dequeueing, so a
//! pool never holds more tasks than it can run (prefetch of one). Retries go
//! back to the queue after their backoff instead of sleeping inside a slot.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::context::{TaskContext, UPSTREAM_RATE_LIMIT_KEY};
use super::error::{TaskError, TaskResult};
use super::{StreamEvent, TaskEnvelope, TaskRecord, TaskStatus, WorkerHeartbeat};
use crate::broker::SharedBroker;
use crate::config::{AppConfig, ConfigResult, RateLimit, RetryConfig, TaskConfig, WorkerConfig};
use crate::core::BackoffCalculator;
use crate::openai::OpenAIClient;

const DEQUEUE_ERROR_PAUSE: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    id: String,
    hostname: String,
    ctx: Arc<TaskContext>,
    worker: WorkerConfig,
    tasks: TaskConfig,
    retry: RetryConfig,
    slots: Arc<Semaphore>,
    active: AtomicUsize,
    started_at: DateTime<Utc>,
    scheduled_retries: Mutex<Vec<JoinHandle<()>>>,
    /// Flipped on shutdown so scheduled retries enqueue without waiting out their backoff
    flush_retries: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(
        broker: SharedBroker,
        openai: OpenAIClient,
        config: &AppConfig,
    ) -> ConfigResult<Self> {
        let limit: RateLimit = config.tasks.rate_limit.parse()?;
        let limiter = broker.rate_limiter(UPSTREAM_RATE_LIMIT_KEY, limit);

        let ctx = TaskContext {
            broker,
            openai,
            limiter,
            rate_limit_timeout: Duration::from_secs(config.tasks.rate_limit_timeout_secs),
        };

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let id = format!(
            "{}-{}",
            hostname,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        Ok(Self {
            id,
            hostname,
            ctx: Arc::new(ctx),
            worker: config.worker.clone(),
            tasks: config.tasks.clone(),
            retry: config.retry.clone(),
            slots: Arc::new(Semaphore::new(config.worker.concurrency.max(1))),
            active: AtomicUsize::new(0),
            started_at: Utc::now(),
            scheduled_retries: Mutex::new(Vec::new()),
            flush_retries: watch::channel(false).0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Consume the configured queues until `shutdown` flips to true, then wait
    /// for in-flight tasks and pending retries.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Worker {} consuming {:?} with concurrency {}",
            self.id, self.worker.queues, self.worker.concurrency
        );

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(shutdown.clone()));
        let poll_timeout = Duration::from_secs(self.worker.poll_timeout_secs.max(1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.ctx.broker.dequeue(&self.worker.queues, poll_timeout).await {
                Ok(Some(envelope)) => {
                    let pool = self.clone();
                    tokio::spawn(async move { pool.execute(envelope, permit).await });
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Dequeue failed: {}", e);
                    drop(permit);
                    tokio::time::sleep(DEQUEUE_ERROR_PAUSE).await;
                }
            }
        }

        info!("Worker {} shutting down, waiting for in-flight tasks", self.id);
        let all_slots = self.worker.concurrency.max(1) as u32;
        if let Ok(permits) = self.slots.acquire_many(all_slots).await {
            drop(permits);
        }

        self.flush_retries.send_replace(true);
        let retries: Vec<JoinHandle<()>> = std::mem::take(&mut *self.scheduled_retries.lock());
        for handle in retries {
            let _ = handle.await;
        }

        heartbeat.abort();
        if let Err(e) = self.ctx.broker.unregister_worker(&self.id).await {
            warn!("Failed to unregister worker {}: {}", self.id, e);
        }
        info!("Worker {} stopped", self.id);
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.worker.heartbeat_interval_secs.max(1));
        let ttl = interval * 3;
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }

            let heartbeat = WorkerHeartbeat {
                worker_id: self.id.clone(),
                hostname: self.hostname.clone(),
                concurrency: self.worker.concurrency,
                active_tasks: self.active_tasks(),
                queues: self.worker.queues.clone(),
                started_at: self.started_at,
                last_seen: Utc::now(),
            };
            if let Err(e) = self.ctx.broker.register_worker(&heartbeat, ttl).await {
                warn!("Heartbeat failed: {}", e);
            }
        }
    }

    async fn execute(self: Arc<Self>, envelope: TaskEnvelope, permit: OwnedSemaphorePermit) {
        self.active.fetch_add(1, Ordering::Relaxed);
        let ttl = Duration::from_secs(self.tasks.result_expires_secs);

        let base = match self.ctx.broker.load_task(&envelope.id).await {
            Ok(Some(record)) => record,
            Ok(None) => TaskRecord::pending(&envelope),
            Err(e) => {
                warn!("Could not load record of task {}: {}", envelope.id, e);
                TaskRecord::pending(&envelope)
            }
        };
        let base = TaskRecord {
            retries: envelope.retries,
            ..base
        };
        self.store(&base.transition(TaskStatus::Started), ttl).await;

        debug!(
            "Task {} ({}) started, attempt {}",
            envelope.id,
            envelope.kind.name(),
            envelope.retries + 1
        );

        let outcome = self
            .with_time_limits(&envelope, self.ctx.execute(&envelope))
            .await;

        match outcome {
            Ok(result) => {
                info!("Task {} succeeded", envelope.id);
                self.store(&base.succeeded(result), ttl).await;
            }
            Err(err) => self.handle_failure(&envelope, &base, err, ttl).await,
        }

        self.active.fetch_sub(1, Ordering::Relaxed);
        drop(permit);
    }

    /// Soft limit only warns, hard limit abandons the attempt
    async fn with_time_limits<F>(&self, envelope: &TaskEnvelope, work: F) -> TaskResult<Value>
    where
        F: Future<Output = TaskResult<Value>>,
    {
        tokio::pin!(work);
        let hard = self.tasks.time_limit();
        let soft = self.tasks.soft_time_limit().min(hard);
        let deadline = tokio::time::Instant::now() + hard;

        match tokio::time::timeout(soft, &mut work).await {
            Ok(result) => return result,
            Err(_) if soft < hard => {
                warn!(
                    "Task {} exceeded its soft time limit of {:?}",
                    envelope.id, soft
                );
            }
            Err(_) => return Err(TaskError::TimeLimitExceeded),
        }

        tokio::time::timeout_at(deadline, work)
            .await
            .unwrap_or(Err(TaskError::TimeLimitExceeded))
    }

    async fn handle_failure(
        self: &Arc<Self>,
        envelope: &TaskEnvelope,
        base: &TaskRecord,
        err: TaskError,
        ttl: Duration,
    ) {
        let message = err.to_string();
        let session_id = envelope.kind.session_id();
        let max_retries = envelope.kind.max_retries(self.retry.max_retries);

        if err.is_retryable() && envelope.retries < max_retries {
            let delay = BackoffCalculator::calculate_delay(&self.retry, envelope.retries);
            let next = envelope.next_attempt();
            warn!(
                "Task {} failed ({}), retry {}/{} in {:?}",
                envelope.id, message, next.retries, max_retries, delay
            );

            let record = TaskRecord {
                error: Some(message.clone()),
                ..base.transition(TaskStatus::Retry)
            };
            self.store(&record, ttl).await;
            if let Some(session_id) = session_id {
                self.ctx
                    .publish_best_effort(
                        session_id,
                        &StreamEvent::retrying(&envelope.id, next.retries, &message),
                    )
                    .await;
            }
            self.schedule_retry(next, delay);
            return;
        }

        error!("Task {} failed: {}", envelope.id, message);
        self.store(&base.failed(message.clone()), ttl).await;
        if let Some(session_id) = session_id {
            self.ctx
                .publish_best_effort(session_id, &StreamEvent::Error { error: message })
                .await;
        }
    }

    /// Re-enqueue after `delay`, or right away once shutdown starts
    fn schedule_retry(self: &Arc<Self>, envelope: TaskEnvelope, delay: Duration) {
        let broker = self.ctx.broker.clone();
        let mut flush = self.flush_retries.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = flush.wait_for(|flush| *flush) => {}
            }
            if let Err(e) = broker.enqueue(&envelope).await {
                error!("Failed to re-enqueue task {}: {}", envelope.id, e);
            }
        });

        let mut pending = self.scheduled_retries.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    async fn store(&self, record: &TaskRecord, ttl: Duration) {
        if let Err(e) = self.ctx.broker.store_task(record, ttl).await {
            warn!("Failed to store record of task {}: {}", record.task_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::tasks::{Dispatcher, QueueName, TaskKind};
    use futures_util::StreamExt;
    use serde_json::json;

    fn pool_with(broker: Arc<MemoryBroker>, mutate: impl FnOnce(&mut AppConfig)) -> Arc<WorkerPool> {
        let mut config = AppConfig::default();
        config.worker.concurrency = 2;
        config.retry.initial_backoff_ms = 10;
        config.retry.jitter_factor = 0.0;
        mutate(&mut config);
        // No key configured: every upstream call fails with a non-retryable error
        let openai = OpenAIClient::new(config.openai.clone()).unwrap();
        Arc::new(WorkerPool::new(broker, openai, &config).unwrap())
    }

    async fn wait_for_ready(broker: &MemoryBroker, envelope: &TaskEnvelope) -> TaskRecord {
        for _ in 0..200 {
            if let Some(record) = broker.load_task(&envelope.id).await.unwrap() {
                if record.status.is_ready() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", envelope.id);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_publishes_error() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = pool_with(broker.clone(), |_| {});
        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn(pool.clone().run(rx));

        let mut events = broker.subscribe("llm:stream:s1").await.unwrap();
        let dispatcher = Dispatcher::new(broker.clone(), Duration::from_secs(60));
        let envelope = dispatcher
            .submit(
                TaskKind::ChatCompletion {
                    session_id: "s1".to_string(),
                    completion_params: json!({"model": "gpt-4o-mini", "messages": []}),
                },
                0,
            )
            .await
            .unwrap();

        let record = wait_for_ready(&broker, &envelope).await;
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(record.retries, 0);

        let started: StreamEvent =
            serde_json::from_str(&events.next().await.unwrap()).unwrap();
        assert_eq!(started, StreamEvent::started(&envelope.id));
        let failed: StreamEvent = serde_json::from_str(&events.next().await.unwrap()).unwrap();
        assert!(matches!(failed, StreamEvent::Error { .. }));

        tx.send(true).unwrap();
        runner.await.unwrap();
        assert!(broker.list_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hard_time_limit_fails_without_retry() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = pool_with(broker.clone(), |c| {
            c.tasks.time_limit_secs = 0;
            c.tasks.soft_time_limit_secs = 0;
        });
        let envelope = TaskEnvelope::new(
            TaskKind::BatchEmbeddings {
                texts: vec![],
                model: "m".to_string(),
            },
            QueueName::Default,
            0,
        );

        let result = pool
            .with_time_limits(&envelope, async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({}))
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, TaskError::TimeLimitExceeded));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_retryable_failure_is_requeued_with_backoff() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = pool_with(broker.clone(), |_| {});
        let envelope = TaskEnvelope::new(
            TaskKind::BatchEmbeddings {
                texts: vec!["a".to_string()],
                model: "m".to_string(),
            },
            QueueName::Low,
            -8,
        );
        let base = TaskRecord::pending(&envelope);

        pool.handle_failure(
            &envelope,
            &base,
            TaskError::RateLimitTimeout(Duration::from_secs(60)),
            Duration::from_secs(60),
        )
        .await;

        let record = broker.load_task(&envelope.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Retry);

        let requeued = broker
            .dequeue(&[QueueName::Low], Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.id, envelope.id);
        assert_eq!(requeued.retries, 1);
    }

    fn chat_envelope(session_id: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskKind::ChatCompletion {
                session_id: session_id.to_string(),
                completion_params: json!({"model": "gpt-4o-mini", "messages": []}),
            },
            QueueName::Default,
            0,
        )
    }

    #[tokio::test]
    async fn test_retryable_failure_publishes_retrying_status() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = pool_with(broker.clone(), |_| {});
        let envelope = chat_envelope("s-retry");
        let base = TaskRecord::pending(&envelope);
        let mut events = broker.subscribe("llm:stream:s-retry").await.unwrap();

        let err = TaskError::OpenAI(crate::openai::OpenAIError::Api {
            status: 503,
            message: "overloaded".to_string(),
        });
        let message = err.to_string();
        pool.handle_failure(&envelope, &base, err, Duration::from_secs(60))
            .await;

        let payload: serde_json::Value =
            serde_json::from_str(&events.next().await.unwrap()).unwrap();
        assert_eq!(payload["type"], "status");
        assert_eq!(payload["status"], "retrying");
        assert_eq!(payload["task_id"], envelope.id.as_str());
        assert_eq!(payload["attempt"], 1);
        assert_eq!(payload["error"], message.as_str());

        let record = broker.load_task(&envelope.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Retry);
        assert_eq!(record.error.as_deref(), Some(message.as_str()));
    }

    #[tokio::test]
    async fn test_time_limit_failure_publishes_timeout_error() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = pool_with(broker.clone(), |_| {});
        let envelope = chat_envelope("s-slow");
        let base = TaskRecord::pending(&envelope);
        let mut events = broker.subscribe("llm:stream:s-slow").await.unwrap();

        pool.handle_failure(
            &envelope,
            &base,
            TaskError::TimeLimitExceeded,
            Duration::from_secs(60),
        )
        .await;

        let event: StreamEvent = serde_json::from_str(&events.next().await.unwrap()).unwrap();
        assert_eq!(
            event,
            StreamEvent::Error {
                error: "Timeout: the request took too long".to_string()
            }
        );
        let record = broker.load_task(&envelope.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(broker.queue_len(QueueName::Default).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retries_stop_at_task_limit() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = pool_with(broker.clone(), |_| {});
        let mut envelope = TaskEnvelope::new(
            TaskKind::BatchEmbeddings {
                texts: vec!["a".to_string()],
                model: "m".to_string(),
            },
            QueueName::Default,
            0,
        );
        // Embeddings give up after two retries
        envelope.retries = 2;
        let base = TaskRecord::pending(&envelope);

        pool.handle_failure(
            &envelope,
            &base,
            TaskError::RateLimitTimeout(Duration::from_secs(60)),
            Duration::from_secs(60),
        )
        .await;

        let record = broker.load_task(&envelope.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(broker.queue_len(QueueName::Default).await.unwrap(), 0);
    }
}
