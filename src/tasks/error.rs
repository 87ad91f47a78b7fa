use std::time::Duration;

use crate::broker::BrokerError;
use crate::openai::OpenAIError;

/// Failure of a single task attempt
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    OpenAI(#[from] OpenAIError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Rate limit timeout: no token within {0:?}")]
    RateLimitTimeout(Duration),

    #[error("Timeout: the request took too long")]
    TimeLimitExceeded,

    #[error("Invalid task parameters: {0}")]
    InvalidParams(String),
}

impl TaskError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::OpenAI(e) => e.is_retryable(),
            TaskError::Broker(_) | TaskError::RateLimitTimeout(_) => true,
            TaskError::TimeLimitExceeded | TaskError::InvalidParams(_) => false,
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
