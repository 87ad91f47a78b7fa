use clap::{ArgAction, Parser, Subcommand};
use llm_relay::config::{
    ApiConfig, AppConfig, BrokerBackend, BrokerConfig, ConfigResult, LogConfig, OpenAIConfig,
    RetryConfig, TaskConfig, WorkerConfig,
};
use llm_relay::logging::{init_logging, LoggingConfig};
use llm_relay::server;
use llm_relay::tasks::parse_queue_list;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "llm-relay")]
#[command(about = "Queue-backed relay between chat clients and an OpenAI-compatible API")]
#[command(long_about = r#"
Queue-backed relay between chat clients and an OpenAI-compatible API

Every setting can also be supplied through the environment (or a .env file).

Examples:
  # API server with an in-process broker and workers
  llm-relay --broker-backend memory serve

  # API server and a separate worker process sharing Redis
  llm-relay --redis-url redis://localhost:6379/0 serve
  llm-relay --redis-url redis://localhost:6379/0 worker --concurrency 50
"#)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Host address to bind the API server
    #[arg(long, env = "HOST", default_value = "0.0.0.0", global = true)]
    host: String,

    /// Port number to bind the API server
    #[arg(long, env = "PORT", default_value_t = 8007, global = true)]
    port: u16,

    /// Seconds a synchronous request waits for its task
    #[arg(long, env = "API_TIMEOUT", default_value_t = 900, global = true)]
    api_timeout: u64,

    /// Maximum request body size in bytes
    #[arg(long, env = "MAX_PAYLOAD_SIZE", default_value_t = 32 * 1024 * 1024, global = true)]
    max_payload_size: usize,

    /// Comma-separated CORS origins ("*" allows any)
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", default_value = "*", global = true)]
    cors_allowed_origins: String,

    /// Upstream API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    openai_api_key: Option<String>,

    /// Upstream organization id
    #[arg(long, env = "OPENAI_ORG_ID", global = true)]
    openai_org_id: Option<String>,

    /// Upstream base URL including the version prefix
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1", global = true)]
    openai_base_url: String,

    /// Model used when a request does not name one
    #[arg(long, env = "OPENAI_DEFAULT_MODEL", default_value = "gpt-4o-mini", global = true)]
    openai_default_model: String,

    /// Upstream request timeout in seconds
    #[arg(long, env = "OPENAI_TIMEOUT", default_value_t = 600, global = true)]
    openai_timeout: u64,

    /// Broker implementation: redis or memory
    #[arg(long, env = "BROKER_BACKEND", default_value = "redis", global = true)]
    broker_backend: String,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379/0", global = true)]
    redis_url: String,

    /// Broker URL, defaults to the Redis URL
    #[arg(long, env = "BROKER_URL", global = true)]
    broker_url: Option<String>,

    /// Maximum pooled broker connections
    #[arg(long, env = "BROKER_POOL_MAX", default_value_t = 32, global = true)]
    broker_pool_max: usize,

    /// Global upstream rate limit, e.g. 500/m
    #[arg(long, env = "RATE_LIMIT", default_value = "500/m", global = true)]
    rate_limit: String,

    /// Hard task time limit in seconds
    #[arg(long, env = "TASK_TIME_LIMIT", default_value_t = 900, global = true)]
    task_time_limit: u64,

    /// Soft task time limit in seconds
    #[arg(long, env = "TASK_SOFT_TIME_LIMIT", default_value_t = 870, global = true)]
    task_soft_time_limit: u64,

    /// Seconds task records are retained
    #[arg(long, env = "RESULT_EXPIRES", default_value_t = 3600, global = true)]
    result_expires: u64,

    /// Retries after the first attempt
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3, global = true)]
    max_retries: u32,

    /// Backoff ceiling in seconds
    #[arg(long, env = "RETRY_BACKOFF_MAX", default_value_t = 60, global = true)]
    retry_backoff_max: u64,

    /// Tasks one worker process runs concurrently
    #[arg(long = "concurrency", env = "WORKER_CONCURRENCY", default_value_t = 100, global = true)]
    worker_concurrency: usize,

    /// Comma-separated queues to consume, highest priority first
    #[arg(long = "queues", env = "WORKER_QUEUES", default_value = "high,default,low", global = true)]
    worker_queues: String,

    /// Run workers inside the API process even with the redis broker
    #[arg(long, env = "EMBEDDED_WORKERS", action = ArgAction::Set, default_value_t = false, global = true)]
    embedded_workers: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON", action = ArgAction::Set, default_value_t = false, global = true)]
    log_json: bool,

    /// Directory for daily-rolling log files
    #[arg(long, env = "LOG_DIR", global = true)]
    log_dir: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the HTTP API
    Serve,
    /// Run a standalone worker pool
    Worker,
}

impl CliArgs {
    fn to_app_config(&self) -> ConfigResult<AppConfig> {
        let cors_allowed_origins = self
            .cors_allowed_origins
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let retry = RetryConfig {
            max_retries: self.max_retries,
            max_backoff_ms: self.retry_backoff_max * 1000,
            ..Default::default()
        };

        Ok(AppConfig {
            api: ApiConfig {
                host: self.host.clone(),
                port: self.port,
                max_payload_size: self.max_payload_size,
                api_timeout_secs: self.api_timeout,
                cors_allowed_origins,
                ..Default::default()
            },
            openai: OpenAIConfig {
                api_key: self.openai_api_key.clone().filter(|k| !k.is_empty()),
                organization: self.openai_org_id.clone().filter(|o| !o.is_empty()),
                base_url: self.openai_base_url.clone(),
                default_model: self.openai_default_model.clone(),
                timeout_secs: self.openai_timeout,
            },
            broker: BrokerConfig {
                backend: self.broker_backend.parse::<BrokerBackend>()?,
                url: self
                    .broker_url
                    .clone()
                    .unwrap_or_else(|| self.redis_url.clone()),
                pool_max: self.broker_pool_max,
            },
            tasks: TaskConfig {
                time_limit_secs: self.task_time_limit,
                soft_time_limit_secs: self.task_soft_time_limit,
                result_expires_secs: self.result_expires,
                rate_limit: self.rate_limit.clone(),
                ..Default::default()
            },
            retry,
            worker: WorkerConfig {
                concurrency: self.worker_concurrency,
                queues: parse_queue_list(&self.worker_queues)?,
                embedded: self.embedded_workers,
                ..Default::default()
            },
            logging: LogConfig {
                level: self.log_level.clone(),
                json: self.log_json,
                dir: self.log_dir.clone(),
            },
        })
    }
}

fn main() -> anyhow::Result<()> {
    // A missing .env file is not an error
    dotenvy::dotenv().ok();

    let cli_args = CliArgs::parse();
    let config = cli_args.to_app_config()?;

    let _log_guard = init_logging(LoggingConfig::from(&config.logging));
    info!(
        "llm-relay {} starting ({:?}, broker: {})",
        env!("CARGO_PKG_VERSION"),
        cli_args.command,
        config.broker.backend.as_str()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    match cli_args.command {
        Command::Serve => runtime.block_on(server::startup(config))?,
        Command::Worker => runtime.block_on(server::run_worker(config))?,
    }

    Ok(())
}
