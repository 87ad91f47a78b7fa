//! Redis broker
//!
//! Key layout:
//! - `llm:queue:{high|default|low}`: task lists (LPUSH / BRPOP, FIFO per queue)
//! - `llm:task:{id}`: task record JSON with expiry
//! - `llm:worker:{id}`: worker heartbeat JSON with expiry
//! - `llm:stream:{session_id}`: pub/sub channel of stream events
//! - `ratelimit:{key}`: token bucket hash

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{
    queue_key, task_key, worker_key, Broker, BrokerError, BrokerResult, Subscription,
};
use crate::config::{BrokerConfig, RateLimit};
use crate::core::RateLimiter;
use crate::tasks::{QueueName, TaskEnvelope, TaskId, TaskRecord, WorkerHeartbeat};

#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    /// Pub/sub needs a dedicated connection per subscription
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(config: &BrokerConfig) -> BrokerResult<Self> {
        let mut cfg = Config::from_url(config.url.clone());
        cfg.pool = Some(PoolConfig::new(config.pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self { pool, client })
    }

    async fn connection(&self) -> BrokerResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn enqueue(&self, envelope: &TaskEnvelope) -> BrokerResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(queue_key(envelope.queue), payload)
            .await?;
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> BrokerResult<Option<TaskEnvelope>> {
        let keys: Vec<String> = queues.iter().map(|q| queue_key(*q)).collect();
        let mut conn = self.connection().await?;

        // BRPOP checks keys in argument order, which gives queue priority
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&keys)
            .arg(timeout.as_secs_f64().max(0.01))
            .query_async(&mut conn)
            .await?;

        match popped {
            Some((key, payload)) => match serde_json::from_str::<TaskEnvelope>(&payload) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(e) => {
                    warn!("Dropping malformed task from {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn queue_len(&self, queue: QueueName) -> BrokerResult<usize> {
        let mut conn = self.connection().await?;
        let len: usize = conn.llen(queue_key(queue)).await?;
        Ok(len)
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        let mut conn = self.connection().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        if receivers == 0 {
            debug!("No subscribers on {}", channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        // Dropping the stream drops the connection, which ends the subscription
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!("Ignoring non-utf8 payload: {}", e);
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }

    async fn store_task(&self, record: &TaskRecord, ttl: Duration) -> BrokerResult<()> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(task_key(&record.task_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_task(&self, task_id: &TaskId) -> BrokerResult<Option<TaskRecord>> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.get(task_key(task_id)).await?;
        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(BrokerError::from)
    }

    async fn register_worker(
        &self,
        heartbeat: &WorkerHeartbeat,
        ttl: Duration,
    ) -> BrokerResult<()> {
        let payload = serde_json::to_string(heartbeat)?;
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(worker_key(&heartbeat.worker_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> BrokerResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(worker_key(worker_id)).await?;
        Ok(())
    }

    async fn list_workers(&self) -> BrokerResult<Vec<WorkerHeartbeat>> {
        let mut conn = self.connection().await?;

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(worker_key("*"))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        // Keys may expire between SCAN and MGET
        Ok(payloads
            .into_iter()
            .flatten()
            .filter_map(|p| serde_json::from_str(&p).ok())
            .collect())
    }

    fn rate_limiter(&self, key: &str, limit: RateLimit) -> Arc<dyn RateLimiter> {
        Arc::new(RedisRateLimiter::new(self.pool.clone(), key, limit))
    }
}

/// Token bucket stored in a Redis hash, shared by every worker process
pub struct RedisRateLimiter {
    pool: Pool,
    key: String,
    limit: RateLimit,
    script: redis::Script,
}

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
local tokens = tonumber(bucket[1]) or rate
local last_update = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_update)
tokens = math.min(rate, tokens + (elapsed / period) * rate)

if tokens >= requested then
    tokens = tokens - requested
    redis.call('HSET', key, 'tokens', tokens, 'last_update', now)
    redis.call('EXPIRE', key, math.ceil(period * 2))
    return 1
end

return 0
"#;

const RATE_LIMIT_POLL: Duration = Duration::from_millis(100);

impl RedisRateLimiter {
    pub fn new(pool: Pool, key: &str, limit: RateLimit) -> Self {
        Self {
            pool,
            key: format!("ratelimit:{}", key),
            limit,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    async fn try_acquire(&self, tokens: f64) -> BrokerResult<bool> {
        let mut conn = self.pool.get().await?;
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let acquired: i32 = self
            .script
            .key(&self.key)
            .arg(self.limit.count)
            .arg(self.limit.period.as_secs_f64())
            .arg(tokens)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn acquire(&self, tokens: f64, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            match self.try_acquire(tokens).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("Rate limiter check failed: {}", e),
            }
            if start.elapsed() + RATE_LIMIT_POLL > timeout {
                return false;
            }
            tokio::time::sleep(RATE_LIMIT_POLL).await;
        }
    }
}
