//! Connector error types.

use thiserror::Error;

/// Result type alias using [`ConnectorError`].
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors raised by connector components.
///
/// Only configuration, credential and consumer setup failures leave
/// [`crate::run`]. Everything else is logged where it happens.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Broker error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),

    #[error("Fatal consumer error: {0}")]
    ConsumerFatal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned status {status}")]
    GatewayStatus { status: u16 },

    #[error("Unable to parse function listing: {reason} (body: {preview:?})")]
    Listing { reason: String, preview: String },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Request timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectorError {
    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a publish error.
    #[must_use]
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Stable label used as the `error_type` log field.
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Credentials(_) => "credentials_error",
            Self::Broker(_) => "broker_error",
            Self::ConsumerFatal(_) => "consumer_fatal",
            Self::Http(_) => "http_error",
            Self::GatewayStatus { .. } => "gateway_status",
            Self::Listing { .. } => "listing_error",
            Self::Publish(_) => "publish_error",
            Self::Timeout => "timeout",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<figment::Error> for ConnectorError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types() {
        assert_eq!(ConnectorError::config("x").error_type(), "config_error");
        assert_eq!(ConnectorError::Timeout.error_type(), "timeout");
        assert_eq!(
            ConnectorError::GatewayStatus { status: 502 }.error_type(),
            "gateway_status"
        );
    }

    #[test]
    fn consumer_fatal_message() {
        let err = ConnectorError::ConsumerFatal("fenced".into());
        assert_eq!(err.error_type(), "consumer_fatal");
        assert_eq!(err.to_string(), "Fatal consumer error: fenced");
    }

    #[test]
    fn listing_error_includes_preview() {
        let err = ConnectorError::Listing {
            reason: "expected value".into(),
            preview: "<html>".into(),
        };
        assert!(err.to_string().contains("<html>"));
    }
}
