//! Crate-level error type
//!
//! Each layer keeps its own error enum; `SimCityError` aggregates them for
//! callers (like the CLI) that drive several layers at once.

use crate::config::ConfigError;
use crate::protocol::topics::TopicError;
use crate::protocol::payloads::PayloadError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for simulated-city operations
#[derive(Debug, Error)]
pub enum SimCityError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Check failed: {message}")]
    CheckFailed { message: String },
}

impl SimCityError {
    /// Create a failed-check error
    pub fn check_failed<S: Into<String>>(message: S) -> Self {
        Self::CheckFailed {
            message: message.into(),
        }
    }
}

/// Result type for simulated-city operations
pub type SimCityResult<T> = Result<T, SimCityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let error: SimCityError = ConfigError::NoActiveProfiles.into();
        assert!(matches!(error, SimCityError::Config(_)));
        assert_eq!(
            error.to_string(),
            "Configuration error: No active MQTT profiles configured"
        );
    }

    #[test]
    fn test_topic_error_converts() {
        let error: SimCityError = TopicError::Wildcard("a/+".to_string()).into();
        assert!(matches!(error, SimCityError::Topic(_)));
        assert!(error.to_string().contains("a/+"));
    }

    #[test]
    fn test_check_failed_constructor() {
        let error = SimCityError::check_failed("1 of 2 profiles failed");
        assert!(matches!(error, SimCityError::CheckFailed { .. }));
        assert_eq!(error.to_string(), "Check failed: 1 of 2 profiles failed");
    }
}
