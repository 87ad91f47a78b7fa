use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

/// Lowest and highest priority accepted from clients
pub const MIN_PRIORITY: i32 = -10;
pub const MAX_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    High,
    Default,
    Low,
}

impl QueueName {
    /// All queues in the order workers drain them
    pub fn all() -> [QueueName; 3] {
        [QueueName::High, QueueName::Default, QueueName::Low]
    }

    /// `high` above 5, `low` below -5, `default` otherwise
    pub fn from_priority(priority: i32) -> Self {
        if priority > 5 {
            QueueName::High
        } else if priority < -5 {
            QueueName::Low
        } else {
            QueueName::Default
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::High => "high",
            QueueName::Default => "default",
            QueueName::Low => "low",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "high" => Ok(QueueName::High),
            "default" => Ok(QueueName::Default),
            "low" => Ok(QueueName::Low),
            other => Err(ConfigError::InvalidValue {
                field: "worker.queues".to_string(),
                value: other.to_string(),
                reason: "Must be one of: high, default, low".to_string(),
            }),
        }
    }
}

/// Parse a comma-separated queue list, dropping duplicates and keeping priority order
pub fn parse_queue_list(list: &str) -> Result<Vec<QueueName>, ConfigError> {
    let mut queues = Vec::new();
    for part in list.split(',').filter(|p| !p.trim().is_empty()) {
        let queue: QueueName = part.parse()?;
        if !queues.contains(&queue) {
            queues.push(queue);
        }
    }
    queues.sort_by_key(|q| QueueName::all().iter().position(|o| o == q));
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_boundaries() {
        assert_eq!(QueueName::from_priority(10), QueueName::High);
        assert_eq!(QueueName::from_priority(6), QueueName::High);
        assert_eq!(QueueName::from_priority(5), QueueName::Default);
        assert_eq!(QueueName::from_priority(0), QueueName::Default);
        assert_eq!(QueueName::from_priority(-5), QueueName::Default);
        assert_eq!(QueueName::from_priority(-6), QueueName::Low);
        assert_eq!(QueueName::from_priority(-10), QueueName::Low);
    }

    #[test]
    fn test_parse_queue_list() {
        assert_eq!(
            parse_queue_list("low, high,default,high").unwrap(),
            vec![QueueName::High, QueueName::Default, QueueName::Low]
        );
        assert_eq!(parse_queue_list("low").unwrap(), vec![QueueName::Low]);
        assert!(parse_queue_list("urgent").is_err());
    }
}
