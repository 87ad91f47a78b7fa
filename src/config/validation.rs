use super::*;
use tracing::warn;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        Self::validate_api(&config.api)?;
        Self::validate_broker(&config.broker)?;
        Self::validate_tasks(&config.tasks)?;
        Self::validate_retry(&config.retry)?;
        Self::validate_worker(&config.worker)?;

        if config.api.api_timeout_secs < config.tasks.time_limit_secs {
            warn!(
                "api_timeout_secs ({}) is lower than the task time limit ({}); \
                 non-streaming proxy calls may time out before their task does",
                config.api.api_timeout_secs, config.tasks.time_limit_secs
            );
        }

        Ok(())
    }

    fn validate_api(api: &ApiConfig) -> ConfigResult<()> {
        if api.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: api.port.to_string(),
                reason: "Port must be between 1 and 65535".to_string(),
            });
        }

        if api.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_payload_size".to_string(),
                value: api.max_payload_size.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if api.api_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api_timeout_secs".to_string(),
                value: api.api_timeout_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if api.stream_default_timeout_secs > api.stream_max_timeout_secs {
            return Err(ConfigError::InvalidValue {
                field: "stream_default_timeout_secs".to_string(),
                value: api.stream_default_timeout_secs.to_string(),
                reason: format!(
                    "Must be <= stream_max_timeout_secs ({})",
                    api.stream_max_timeout_secs
                ),
            });
        }

        if api.result_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "result_poll_interval_ms".to_string(),
                value: api.result_poll_interval_ms.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        Ok(())
    }

    fn validate_broker(broker: &BrokerConfig) -> ConfigResult<()> {
        if broker.backend == BrokerBackend::Redis {
            if broker.url.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "broker.url".to_string(),
                });
            }
            if !broker.url.starts_with("redis://")
                && !broker.url.starts_with("rediss://")
                && !broker.url.starts_with("unix://")
            {
                let rabbitmq =
                    broker.url.starts_with("amqp://") || broker.url.starts_with("amqps://");
                let reason = if rabbitmq {
                    "RabbitMQ brokers are not supported; use a redis://, rediss:// or unix:// URL"
                } else {
                    "Must start with redis://, rediss:// or unix://"
                };
                return Err(ConfigError::InvalidValue {
                    field: "broker.url".to_string(),
                    value: broker.url.clone(),
                    reason: reason.to_string(),
                });
            }
            if broker.pool_max == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "broker.pool_max".to_string(),
                    value: broker.pool_max.to_string(),
                    reason: "Must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_tasks(tasks: &TaskConfig) -> ConfigResult<()> {
        if tasks.time_limit_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tasks.time_limit_secs".to_string(),
                value: tasks.time_limit_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if tasks.soft_time_limit_secs > tasks.time_limit_secs {
            return Err(ConfigError::InvalidValue {
                field: "tasks.soft_time_limit_secs".to_string(),
                value: tasks.soft_time_limit_secs.to_string(),
                reason: format!(
                    "Must be <= tasks.time_limit_secs ({})",
                    tasks.time_limit_secs
                ),
            });
        }

        if tasks.result_expires_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tasks.result_expires_secs".to_string(),
                value: tasks.result_expires_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        tasks.rate_limit.parse::<RateLimit>()?;
        Ok(())
    }

    fn validate_retry(retry: &RetryConfig) -> ConfigResult<()> {
        if retry.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_backoff_ms".to_string(),
                value: retry.initial_backoff_ms.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff_ms".to_string(),
                value: retry.max_backoff_ms.to_string(),
                reason: "Must be >= initial_backoff_ms".to_string(),
            });
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier".to_string(),
                value: retry.backoff_multiplier.to_string(),
                reason: "Must be >= 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                field: "retry.jitter_factor".to_string(),
                value: retry.jitter_factor.to_string(),
                reason: "Must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_worker(worker: &WorkerConfig) -> ConfigResult<()> {
        if worker.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker.concurrency".to_string(),
                value: worker.concurrency.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if worker.queues.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "worker.queues".to_string(),
            });
        }
        if worker.heartbeat_interval_secs == 0 || worker.poll_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "worker heartbeat and poll intervals must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_soft_limit_above_hard_limit() {
        let mut config = AppConfig::default();
        config.tasks.soft_time_limit_secs = config.tasks.time_limit_secs + 1;

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "tasks.soft_time_limit_secs"
        ));
    }

    #[test]
    fn test_invalid_rate_limit() {
        let mut config = AppConfig::default();
        config.tasks.rate_limit = "fast".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_stream_timeout_bounds() {
        let mut config = AppConfig::default();
        config.api.stream_default_timeout_secs = 301;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_worker_settings() {
        let mut config = AppConfig::default();
        config.worker.concurrency = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.worker.queues.clear();
        assert!(matches!(
            ConfigValidator::validate(&config),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_redis_url_scheme() {
        let mut config = AppConfig::default();
        config.broker.url = "amqp://guest@localhost:5672".to_string();
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("RabbitMQ brokers are not supported"));

        config.broker.url = "http://localhost:6379".to_string();
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Must start with redis://"));
        assert!(!err.to_string().contains("RabbitMQ"));

        // The in-process broker ignores the URL entirely
        config.broker.backend = BrokerBackend::Memory;
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_retry_settings() {
        let mut config = AppConfig::default();
        config.retry.max_backoff_ms = 10;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
