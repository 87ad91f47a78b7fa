use super::{ConfigError, ConfigResult};
use crate::tasks::QueueName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration shared by the API server and the worker pool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub openai: OpenAIConfig,
    pub broker: BrokerConfig,
    pub tasks: TaskConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub logging: LogConfig,
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Maximum payload size in bytes
    pub max_payload_size: usize,
    /// How long the OpenAI-compatible endpoint waits for a non-streaming result.
    /// Should be >= tasks.time_limit_secs
    pub api_timeout_secs: u64,
    /// Default relay timeout for `/stream/{session_id}`
    pub stream_default_timeout_secs: u64,
    /// Upper bound accepted for the `timeout` query parameter
    pub stream_max_timeout_secs: u64,
    /// Interval between task result polls while waiting on a non-streaming proxy call
    pub result_poll_interval_ms: u64,
    /// CORS allowed origins (empty or "*" = any)
    pub cors_allowed_origins: Vec<String>,
    /// Headers checked for an incoming request ID
    pub request_id_headers: Vec<String>,
    /// Default system prompt for `/chat` requests
    pub default_system_prompt: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8007,
            max_payload_size: 32 * 1024 * 1024,
            api_timeout_secs: 900,
            stream_default_timeout_secs: 120,
            stream_max_timeout_secs: 300,
            result_poll_interval_ms: 500,
            cors_allowed_origins: vec![],
            request_id_headers: default_request_id_headers(),
            default_system_prompt: "You are a helpful and concise assistant.".to_string(),
        }
    }
}

pub fn default_request_id_headers() -> Vec<String> {
    vec![
        "x-request-id".to_string(),
        "x-correlation-id".to_string(),
        "x-trace-id".to_string(),
        "request-id".to_string(),
    ]
}

/// Upstream OpenAI-compatible API settings
#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    /// Base URL including the version prefix, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub default_model: String,
    pub timeout_secs: u64,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            organization: None,
            base_url: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            timeout_secs: 600,
        }
    }
}

impl OpenAIConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl fmt::Debug for OpenAIConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("organization", &self.organization)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Which broker implementation carries queues, results and stream events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Redis,
    /// In-process broker; API and workers must share the process
    Memory,
}

impl BrokerBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerBackend::Redis => "redis",
            BrokerBackend::Memory => "memory",
        }
    }
}

impl FromStr for BrokerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BrokerBackend::Redis),
            "memory" => Ok(BrokerBackend::Memory),
            other => Err(ConfigError::InvalidValue {
                field: "broker.backend".to_string(),
                value: other.to_string(),
                reason: "Must be one of: redis, memory".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub url: String,
    /// Maximum pooled connections (redis only)
    pub pool_max: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Redis,
            url: "redis://localhost:6379/0".to_string(),
            pool_max: 32,
        }
    }
}

/// Per-task execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Hard limit; the task is abandoned and marked failed
    pub time_limit_secs: u64,
    /// Soft limit; crossing it only logs a warning
    pub soft_time_limit_secs: u64,
    /// Retention of task records
    pub result_expires_secs: u64,
    /// Global upstream rate limit, e.g. "500/m"
    pub rate_limit: String,
    /// How long a chat task waits for a rate limit token
    pub rate_limit_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 900,
            soft_time_limit_secs: 870,
            result_expires_secs: 3600,
            rate_limit: "500/m".to_string(),
            rate_limit_timeout_secs: 30,
        }
    }
}

impl TaskConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }
}

/// Retry configuration for failed tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Jitter factor applied to backoff (0.0 - 1.0)
    /// Effective delay D' = D * (1 + U[-j, +j])
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of tasks executed concurrently by one worker process
    pub concurrency: usize,
    /// Queues consumed, in priority order
    pub queues: Vec<QueueName>,
    pub heartbeat_interval_secs: u64,
    /// Blocking dequeue timeout; bounds shutdown latency
    pub poll_timeout_secs: u64,
    /// Run a worker pool inside the API process
    pub embedded: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            queues: QueueName::all().to_vec(),
            heartbeat_interval_secs: 10,
            poll_timeout_secs: 1,
            embedded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

/// A rate expressed as `<count>/<s|m|h>`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub count: u32,
    pub period: Duration,
}

impl RateLimit {
    pub fn per_second(&self) -> f64 {
        self.count as f64 / self.period.as_secs_f64()
    }
}

impl FromStr for RateLimit {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: "tasks.rate_limit".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (count, unit) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("Expected <count>/<s|m|h>"))?;
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|_| invalid("Count must be a positive integer"))?;
        if count == 0 {
            return Err(invalid("Count must be > 0"));
        }
        let period = match unit.trim() {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            _ => return Err(invalid("Unit must be one of: s, m, h")),
        };
        Ok(Self { count, period })
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.period.as_secs() {
            1 => "s",
            60 => "m",
            _ => "h",
        };
        write!(f, "{}/{}", self.count, unit)
    }
}
