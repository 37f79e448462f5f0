// warren-core/src/error.rs
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarrenError {
    /// Required topology (exchange, queue) is missing. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out after {0:?} waiting for a pooled channel")]
    PoolTimeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A delivery was acknowledged or rejected more than once.
    #[error("multiple acks/nacks for delivery {delivery_tag}: {payload}")]
    MultipleAcknowledgements { delivery_tag: u64, payload: String },

    #[error("unknown consumer '{0}'")]
    UnknownConsumer(String),

    #[error("unknown subscriber '{0}'")]
    UnknownSubscriber(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("test handler is not tracking messages; call enable() first")]
    NotTracking,
}

impl From<serde_yaml::Error> for WarrenError {
    fn from(err: serde_yaml::Error) -> Self {
        WarrenError::Settings(err.to_string())
    }
}

impl From<std::io::Error> for WarrenError {
    fn from(err: std::io::Error) -> Self {
        WarrenError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for WarrenError {
    fn from(err: serde_json::Error) -> Self {
        WarrenError::Serialization(err.to_string())
    }
}

/// Outcome of processing a single delivery.
///
/// `TemporaryIssue` sends the consumer to sleep and requeues the message,
/// anything else dead-letters it.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("temporary issue: {0}")]
    TemporaryIssue(String),

    #[error("processing failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Warren(#[from] WarrenError),
}

impl ProcessError {
    pub fn temporary(message: impl Into<String>) -> Self {
        ProcessError::TemporaryIssue(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed(message.into())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ProcessError::TemporaryIssue(_))
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        ProcessError::Failed(format!("invalid payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_acknowledgements_names_the_delivery() {
        let err = WarrenError::MultipleAcknowledgements {
            delivery_tag: 7,
            payload: "Hello".into(),
        };
        assert_eq!(err.to_string(), "multiple acks/nacks for delivery 7: Hello");
    }

    #[test]
    fn process_error_wraps_warren_errors_transparently() {
        let err: ProcessError = WarrenError::Configuration("No queue configured".into()).into();
        assert_eq!(err.to_string(), "configuration error: No queue configured");
        assert!(!err.is_temporary());
        assert!(ProcessError::temporary("db down").is_temporary());
    }
}
