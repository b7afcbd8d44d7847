//! Error types for the Portcullis gateway

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for the gateway pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration or administrative input
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule with the same key already exists
    #[error("Rule already exists: {0}")]
    DuplicateRule(String),

    /// No rule with the given key or identity exists
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// Redirect handling was invoked for a request that no rule matches
    #[error("No matching rule for {0}")]
    NoMatchingRule(String),

    /// A rule key could not be compiled as a regular expression
    #[error("Invalid rule pattern '{pattern}': {message}")]
    InvalidRegex {
        /// The offending pattern
        pattern: String,
        /// Compiler message
        message: String,
    },

    /// Plugin protocol error (bad verdict, unreachable plugin)
    #[error("Plugin error in '{plugin}': {message}")]
    Plugin {
        /// Plugin identifier
        plugin: String,
        /// Error message
        message: String,
    },

    /// A sniff snapshot payload could not be decoded
    #[error("Malformed sniff snapshot: {0}")]
    SnapshotDecode(String),

    /// Invalid HTTP request
    #[error("Invalid HTTP request: {0}")]
    InvalidRequest(String),

    /// Upstream connection error (DNS, refused, reset)
    #[error("Failed to connect to upstream: {0}")]
    UpstreamConnection(String),

    /// Upstream timeout
    #[error("Upstream request timed out")]
    UpstreamTimeout,

    /// The underlying connection cannot be turned into a raw stream
    #[error("Connection does not support hijacking")]
    HijackUnsupported,

    /// CONNECT tunnel failure
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Hyper protocol error
    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    /// HTTP builder error
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::InvalidRequest(_) | Error::Hyper(_) => StatusCode::BAD_REQUEST,
            Error::RuleNotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateRule(_) => StatusCode::CONFLICT,
            Error::UpstreamConnection(_) | Error::Tunnel(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::HijackUnsupported => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error came from reaching the upstream
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::UpstreamConnection(_) | Error::UpstreamTimeout | Error::Tunnel(_)
        )
    }

    /// Create a plugin error
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::RuleNotFound("abc".to_string()).to_status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::UpstreamConnection("refused".to_string()).to_status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::UpstreamTimeout.to_status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::NoMatchingRule("/x".to_string()).to_status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_plugin_error() {
        let err = Error::plugin("geo-filter", "unexpected verdict 418");
        assert!(matches!(err, Error::Plugin { .. }));
        assert!(err.to_string().contains("geo-filter"));
        assert!(!err.is_transport());
    }
}
