use std::sync::Arc;

use tracing::info;

use super::{BrokerResult, MemoryBroker, RedisBroker, SharedBroker};
use crate::config::{BrokerBackend, BrokerConfig};

/// Create a broker based on configuration
pub fn create_broker(config: &BrokerConfig) -> BrokerResult<SharedBroker> {
    match config.backend {
        BrokerBackend::Memory => {
            info!("Initializing in-memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        BrokerBackend::Redis => {
            info!(
                "Initializing redis broker at {} (pool max {})",
                redact_url(&config.url),
                config.pool_max
            );
            Ok(Arc::new(RedisBroker::new(config)?))
        }
    }
}

/// Hide the password component of a broker URL
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
