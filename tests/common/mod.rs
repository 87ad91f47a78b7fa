// These modules are used by several test binaries
#![allow(dead_code)]

pub mod mock_openai_server;

use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use llm_relay::broker::{Broker, MemoryBroker};
use llm_relay::config::{AppConfig, BrokerBackend};
use llm_relay::openai::OpenAIClient;
use llm_relay::server::AppState;
use llm_relay::tasks::{TaskId, TaskRecord, WorkerPool};
use tokio::sync::watch;

/// Config for an in-process deployment against `upstream_url`
pub fn test_config(upstream_url: Option<String>) -> AppConfig {
    let mut config = AppConfig::default();
    config.broker.backend = BrokerBackend::Memory;
    config.api.api_timeout_secs = 5;
    config.api.result_poll_interval_ms = 20;
    config.worker.concurrency = 4;
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 50;
    config.retry.jitter_factor = 0.0;
    if let Some(url) = upstream_url {
        config.openai.base_url = url;
        config.openai.api_key = Some("sk-test".to_string());
    }
    config
}

/// API state backed by a memory broker the test can inspect
pub fn create_test_state(config: AppConfig) -> (web::Data<AppState>, Arc<MemoryBroker>) {
    let broker = Arc::new(MemoryBroker::new());
    let state = AppState::new(config, broker.clone()).expect("Failed to create AppState in test");
    (web::Data::new(state), broker)
}

/// Worker pool running against `broker` until the returned sender flips
pub fn start_workers(
    broker: Arc<MemoryBroker>,
    config: &AppConfig,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let openai = OpenAIClient::new(config.openai.clone()).unwrap();
    let pool = Arc::new(WorkerPool::new(broker, openai, config).unwrap());
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(pool.run(rx));
    (tx, handle)
}

/// Poll until the task finishes
pub async fn wait_for_ready(broker: &MemoryBroker, task_id: &str) -> TaskRecord {
    let task_id = TaskId::from(task_id);
    for _ in 0..300 {
        if let Some(record) = broker.load_task(&task_id).await.unwrap() {
            if record.status.is_ready() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never finished", task_id);
}

/// `data:` payloads of an SSE body, in order
pub fn sse_payloads(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}
