use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::{error, web, App, Error, HttpRequest, HttpServer};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{create_broker, SharedBroker};
use crate::config::{ApiConfig, AppConfig, BrokerBackend, ConfigValidator};
use crate::error::ApiError;
use crate::middleware::RequestIdMiddleware;
use crate::openai::{OpenAIClient, OpenAIResult};
use crate::routers;
use crate::tasks::{Dispatcher, WorkerPool};

/// Headers browsers may read on cross-origin responses
pub const EXPOSED_HEADERS: [&str; 3] = ["X-Session-ID", "X-Task-ID", "X-Request-ID"];

pub struct AppState {
    pub broker: SharedBroker,
    pub dispatcher: Dispatcher,
    pub openai: OpenAIClient,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(config: AppConfig, broker: SharedBroker) -> OpenAIResult<Self> {
        let openai = OpenAIClient::new(config.openai.clone())?;
        let dispatcher = Dispatcher::new(
            broker.clone(),
            Duration::from_secs(config.tasks.result_expires_secs),
        );
        Ok(Self {
            broker,
            dispatcher,
            openai,
            config,
        })
    }
}

// Custom error handler for JSON payload errors.
pub fn json_error_handler(err: error::JsonPayloadError, _req: &HttpRequest) -> Error {
    let api_error = match &err {
        error::JsonPayloadError::OverflowKnownLength { length, limit } => {
            ApiError::PayloadTooLarge(format!(
                "Payload too large: {} bytes exceeds limit of {} bytes",
                length, limit
            ))
        }
        error::JsonPayloadError::Overflow { limit } => {
            ApiError::PayloadTooLarge(format!("Payload exceeds limit of {} bytes", limit))
        }
        // Valid JSON with missing or mistyped fields
        error::JsonPayloadError::Deserialize(e) if e.is_data() => {
            ApiError::Validation(format!("Invalid request body: {}", e))
        }
        _ => ApiError::BadRequest(format!("Invalid JSON payload: {}", err)),
    };
    warn!("JSON payload error: {}", api_error);
    api_error.into()
}

pub fn json_config(max_payload_size: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_payload_size)
        .error_handler(json_error_handler)
}

/// Malformed query strings are validation failures, rendered like every other API error
pub fn query_error_handler(err: error::QueryPayloadError, _req: &HttpRequest) -> Error {
    let api_error = ApiError::Validation(format!("Invalid query parameters: {}", err));
    warn!("Query error: {}", api_error);
    api_error.into()
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(query_error_handler)
}

/// Permissive when no origins (or `*`) are configured
pub fn create_cors(allowed_origins: &[String]) -> Cors {
    let any_origin = allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*");

    let cors = if any_origin {
        Cors::default().allow_any_origin().send_wildcard()
    } else {
        allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .supports_credentials()
    };

    cors.allow_any_method()
        .allow_any_header()
        .expose_headers(EXPOSED_HEADERS)
        .max_age(3600)
}

/// Build the application with all routes and middleware
pub fn build_app(
    state: web::Data<AppState>,
    api: &ApiConfig,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(state)
        .app_data(json_config(api.max_payload_size))
        .app_data(query_config())
        .app_data(web::PayloadConfig::default().limit(api.max_payload_size))
        .wrap(RequestIdMiddleware::new(api.request_id_headers.clone()))
        .wrap(create_cors(&api.cors_allowed_origins))
        .configure(routers::configure)
}

/// Start a worker pool inside this process, returning its shutdown handle
fn spawn_embedded_workers(
    state: &AppState,
) -> anyhow::Result<(watch::Sender<bool>, tokio::task::JoinHandle<()>)> {
    let pool = Arc::new(WorkerPool::new(
        state.broker.clone(),
        state.openai.clone(),
        &state.config,
    )?);
    info!("Starting embedded worker pool {}", pool.id());
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(pool.run(rx));
    Ok((tx, handle))
}

pub async fn startup(config: AppConfig) -> anyhow::Result<()> {
    ConfigValidator::validate(&config)?;

    let broker = create_broker(&config.broker)?;
    if let Err(e) = broker.ping().await {
        warn!("Broker not reachable yet: {}", e);
    }

    let state = AppState::new(config.clone(), broker)?;
    if !state.openai.is_configured() {
        warn!("OPENAI_API_KEY is not set; upstream calls will fail");
    }

    let embedded = if config.broker.backend == BrokerBackend::Memory || config.worker.embedded {
        Some(spawn_embedded_workers(&state)?)
    } else {
        None
    };

    info!("Serving on {}:{}", config.api.host, config.api.port);
    info!(
        "Broker: {}, max payload size: {} MB",
        config.broker.backend.as_str(),
        config.api.max_payload_size / (1024 * 1024)
    );

    let app_state = web::Data::new(state);
    let api = config.api.clone();

    HttpServer::new(move || {
        let app_state = app_state.clone();
        build_app(app_state, &api)
    })
    .bind((config.api.host.as_str(), config.api.port))?
    .run()
    .await?;

    if let Some((shutdown, handle)) = embedded {
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            error!("Embedded worker pool panicked: {}", e);
        }
    }
    Ok(())
}

/// Run a standalone worker process until Ctrl-C
pub async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    ConfigValidator::validate(&config)?;
    if config.broker.backend == BrokerBackend::Memory {
        anyhow::bail!(
            "The memory broker cannot be shared with a separate worker process; use `serve`"
        );
    }

    let broker = create_broker(&config.broker)?;
    broker.ping().await?;

    let openai = OpenAIClient::new(config.openai.clone())?;
    if !openai.is_configured() {
        warn!("OPENAI_API_KEY is not set; upstream calls will fail");
    }

    let pool = Arc::new(WorkerPool::new(broker, openai, &config)?);
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, draining");
        }
        let _ = tx.send(true);
    });

    pool.run(rx).await;
    Ok(())
}
