//! Error types for producing, publishing and delivering dispatch events.
//!
//! Outbound HTTP failures are categorised for logging and for the retry
//! decision; use-case errors separate caller mistakes from ledger failures.

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Outbound HTTP delivery failures.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Merchant responded with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Merchant responded with a 5xx status or another non-2xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// The HTTP client could not be built or the request was malformed.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Classifies a non-2xx response.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        if (400..500).contains(&status_code) {
            Self::client_error(status_code, body)
        } else {
            Self::server_error(status_code, body)
        }
    }

    /// Whether the failure is likely transient.
    ///
    /// Informational only: the ledger counts every non-2xx outcome as a
    /// failed attempt regardless of category.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::ServerError { .. } => true,
            Self::ClientError { status_code, .. } => matches!(status_code, 408 | 429),
            Self::ConfigurationError { .. } => false,
        }
    }

    /// Response body to record in the ledger, if the merchant sent one.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::ClientError { body, .. } | Self::ServerError { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Errors returned by the webhook delivery use case.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatch payload was rejected before any ledger row was created.
    #[error("invalid dispatch payload: {0}")]
    Validation(String),

    /// Requested ledger row does not exist.
    #[error("callback log not found: {0}")]
    NotFound(String),

    /// Ledger read or write failed.
    #[error("ledger error: {0}")]
    Ledger(#[source] CoreError),
}

impl DispatchError {
    /// Whether the caller's input caused this error.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<CoreError> for DispatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(what) => Self::NotFound(what),
            CoreError::InvalidInput(msg) => Self::Validation(msg),
            CoreError::InvalidStatus { .. } => Self::Validation(err.to_string()),
            other => Self::Ledger(other),
        }
    }
}

/// Errors returned by the grouped producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerError {
    /// `produce` was called after `stop` began.
    #[error("producer is shutting down")]
    ShuttingDown,
}

/// Errors raised by a broker client.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Writing a record failed.
    #[error("failed to publish to {topic}: {message}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Underlying failure
        message: String,
    },

    /// Subscribing to a topic failed.
    #[error("failed to subscribe to {topic}: {message}")]
    Subscribe {
        /// Topic being subscribed to
        topic: String,
        /// Underlying failure
        message: String,
    },

    /// The broker connection has been closed.
    #[error("broker closed")]
    Closed,
}

impl BrokerError {
    /// Creates a publish error.
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish { topic: topic.into(), message: message.into() }
    }

    /// Creates a subscribe error.
    pub fn subscribe(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe { topic: topic.into(), message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::server_error(500, "internal server error").is_retryable());
        assert!(DeliveryError::client_error(429, "slow down").is_retryable());

        assert!(!DeliveryError::client_error(404, "not found").is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            DeliveryError::from_status(404, ""),
            DeliveryError::ClientError { status_code: 404, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(503, ""),
            DeliveryError::ServerError { status_code: 503, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(302, ""),
            DeliveryError::ServerError { status_code: 302, .. }
        ));
    }

    #[test]
    fn response_body_only_for_http_errors() {
        assert_eq!(DeliveryError::server_error(500, "oops").response_body(), Some("oops"));
        assert_eq!(DeliveryError::timeout(30).response_body(), None);
    }

    #[test]
    fn core_errors_split_into_validation_and_ledger() {
        assert!(DispatchError::from(CoreError::InvalidInput("bad".into())).is_validation());
        assert!(DispatchError::from(CoreError::InvalidStatus { code: 9 }).is_validation());
        assert!(matches!(
            DispatchError::from(CoreError::NotFound("x".into())),
            DispatchError::NotFound(_)
        ));
        assert!(matches!(
            DispatchError::from(CoreError::Database("down".into())),
            DispatchError::Ledger(_)
        ));
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(ProducerError::ShuttingDown.to_string(), "producer is shutting down");
    }
}
