use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

use super::{Broker, BrokerResult, Subscription};
use crate::config::RateLimit;
use crate::core::{RateLimiter, TokenBucket};
use crate::tasks::{QueueName, TaskEnvelope, TaskId, TaskRecord, WorkerHeartbeat};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process broker used for development, single-process deployments and tests
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

#[derive(Default)]
struct MemoryBrokerInner {
    queues: Mutex<HashMap<QueueName, VecDeque<TaskEnvelope>>>,
    queue_notify: Notify,
    channels: DashMap<String, broadcast::Sender<String>>,
    tasks: DashMap<TaskId, (TaskRecord, Instant)>,
    workers: DashMap<String, (WorkerHeartbeat, Instant)>,
    limiters: DashMap<String, Arc<TokenBucket>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self, queues: &[QueueName]) -> Option<TaskEnvelope> {
        let mut guard = self.inner.queues.lock();
        queues
            .iter()
            .find_map(|q| guard.get_mut(q).and_then(|queue| queue.pop_front()))
    }
}

/// Receiver half of a session subscription. Fields drop in order, so the
/// receiver is gone by the time the guard checks the count.
struct ChannelReceiver {
    receiver: broadcast::Receiver<String>,
    _guard: ChannelGuard,
}

/// Removes a channel once its last subscriber is dropped
struct ChannelGuard {
    channel: String,
    inner: Weak<MemoryBrokerInner>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .channels
                .remove_if(&self.channel, |_, s| s.receiver_count() == 0);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn enqueue(&self, envelope: &TaskEnvelope) -> BrokerResult<()> {
        self.inner
            .queues
            .lock()
            .entry(envelope.queue)
            .or_default()
            .push_back(envelope.clone());
        self.inner.queue_notify.notify_waiters();
        self.inner.queue_notify.notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> BrokerResult<Option<TaskEnvelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so an enqueue in between is not missed
            let notified = self.inner.queue_notify.notified();
            if let Some(envelope) = self.try_pop(queues) {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(queues));
            }
        }
    }

    async fn queue_len(&self, queue: QueueName) -> BrokerResult<usize> {
        Ok(self
            .inner
            .queues
            .lock()
            .get(&queue)
            .map(|q| q.len())
            .unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        let Some(sender) = self.inner.channels.get(channel).map(|s| s.value().clone()) else {
            debug!("No subscribers on {}, dropping event", channel);
            return Ok(());
        };
        if sender.send(payload.to_string()).is_err() {
            // Every receiver is gone
            self.inner
                .channels
                .remove_if(channel, |_, s| s.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        let receiver = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let state = ChannelReceiver {
            receiver,
            _guard: ChannelGuard {
                channel: channel.to_string(),
                inner: Arc::downgrade(&self.inner),
            },
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                match state.receiver.recv().await {
                    Ok(payload) => return Some((payload, state)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn store_task(&self, record: &TaskRecord, ttl: Duration) -> BrokerResult<()> {
        let now = Instant::now();
        self.inner.tasks.retain(|_, (_, expires_at)| *expires_at > now);
        self.inner.tasks.insert(
            record.task_id.clone(),
            (record.clone(), now + ttl),
        );
        Ok(())
    }

    async fn load_task(&self, task_id: &TaskId) -> BrokerResult<Option<TaskRecord>> {
        let now = Instant::now();
        self.inner
            .tasks
            .remove_if(task_id, |_, (_, expires_at)| *expires_at <= now);
        Ok(self
            .inner
            .tasks
            .get(task_id)
            .map(|entry| entry.value().0.clone()))
    }

    async fn register_worker(
        &self,
        heartbeat: &WorkerHeartbeat,
        ttl: Duration,
    ) -> BrokerResult<()> {
        self.inner.workers.insert(
            heartbeat.worker_id.clone(),
            (heartbeat.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> BrokerResult<()> {
        self.inner.workers.remove(worker_id);
        Ok(())
    }

    async fn list_workers(&self) -> BrokerResult<Vec<WorkerHeartbeat>> {
        let now = Instant::now();
        self.inner
            .workers
            .retain(|_, (_, expires_at)| *expires_at > now);
        Ok(self
            .inner
            .workers
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect())
    }

    fn rate_limiter(&self, key: &str, limit: RateLimit) -> Arc<dyn RateLimiter> {
        self.inner
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::from_rate(limit)))
            .clone()
    }
}
