use hyper::header::CONTENT_TYPE;
use hyper::{Body, Response, StatusCode};
use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the waypoint gateway
#[derive(Error, Debug, Clone)]
pub enum WaypointError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Duplicate rule keys, references to undeclared clusters and similar
    #[error("Configuration inconsistency: {message}")]
    ConfigurationInconsistency { message: String },

    /// No rule accepted the inbound exchange
    #[error("No route for {method} {host}{path} on port {port}")]
    NoRoute {
        host: String,
        method: String,
        path: String,
        port: u16,
    },

    /// An interceptor aborted the pipeline
    #[error("Pipeline aborted by {interceptor}: {message}")]
    PipelineAbort {
        interceptor: String,
        message: String,
    },

    /// Every endpoint stayed at its concurrency cap for all attempts
    #[error("All endpoints busy after {attempts} attempts")]
    DispatchExhausted { attempts: u32 },

    /// Dispatch was requested against an empty endpoint list
    #[error("No endpoints available: {message}")]
    EmptyEndpointList { message: String },

    /// Cluster notification carried a missing or wrong signature
    #[error("Signature rejected: {message}")]
    SignatureRejected { message: String },

    /// Cluster notification timestamp or nonce outside the replay window
    #[error("Replay rejected: {message}")]
    ReplayRejected { message: String },

    /// Network related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// The owning exchange was cancelled (client went away, shutdown)
    #[error("Exchange cancelled: {message}")]
    Cancelled { message: String },

    /// Malformed inbound request
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// IO related errors
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl WaypointError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a configuration inconsistency error
    pub fn inconsistency<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationInconsistency {
            message: message.into(),
        }
    }

    /// Create a routing failure
    pub fn no_route<H, M, P>(host: H, method: M, path: P, port: u16) -> Self
    where
        H: Into<String>,
        M: Into<String>,
        P: Into<String>,
    {
        Self::NoRoute {
            host: host.into(),
            method: method.into(),
            path: path.into(),
            port,
        }
    }

    /// Create a pipeline abort error
    pub fn pipeline_abort<I: Into<String>, S: Into<String>>(interceptor: I, message: S) -> Self {
        Self::PipelineAbort {
            interceptor: interceptor.into(),
            message: message.into(),
        }
    }

    /// Create a dispatch exhaustion error
    pub fn dispatch_exhausted(attempts: u32) -> Self {
        Self::DispatchExhausted { attempts }
    }

    /// Create an empty endpoint list error
    pub fn empty_endpoints<S: Into<String>>(message: S) -> Self {
        Self::EmptyEndpointList {
            message: message.into(),
        }
    }

    /// Create a signature rejection
    pub fn signature_rejected<S: Into<String>>(message: S) -> Self {
        Self::SignatureRejected {
            message: message.into(),
        }
    }

    /// Create a replay rejection
    pub fn replay_rejected<S: Into<String>>(message: S) -> Self {
        Self::ReplayRejected {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a bad request error
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is retryable against another destination
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WaypointError::Network { .. }
                | WaypointError::Timeout { .. }
                | WaypointError::DispatchExhausted { .. }
        )
    }

    /// Short machine-readable name used in error bodies and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            WaypointError::Config { .. } => "config",
            WaypointError::ConfigurationInconsistency { .. } => "configuration_inconsistency",
            WaypointError::NoRoute { .. } => "no_route",
            WaypointError::PipelineAbort { .. } => "pipeline_abort",
            WaypointError::DispatchExhausted { .. } => "dispatch_exhausted",
            WaypointError::EmptyEndpointList { .. } => "empty_endpoint_list",
            WaypointError::SignatureRejected { .. } => "signature_rejected",
            WaypointError::ReplayRejected { .. } => "replay_rejected",
            WaypointError::Network { .. } => "network",
            WaypointError::Timeout { .. } => "timeout",
            WaypointError::Cancelled { .. } => "cancelled",
            WaypointError::BadRequest { .. } => "bad_request",
            WaypointError::Io { .. } => "io",
            WaypointError::Internal { .. } => "internal",
        }
    }

    /// HTTP status of the terminal response produced for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            WaypointError::NoRoute { .. } => StatusCode::NOT_FOUND,
            WaypointError::DispatchExhausted { .. }
            | WaypointError::EmptyEndpointList { .. }
            | WaypointError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WaypointError::SignatureRejected { .. } | WaypointError::ReplayRejected { .. } => {
                StatusCode::FORBIDDEN
            }
            WaypointError::Network { .. } => StatusCode::BAD_GATEWAY,
            WaypointError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            WaypointError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            WaypointError::Config { .. }
            | WaypointError::ConfigurationInconsistency { .. }
            | WaypointError::PipelineAbort { .. }
            | WaypointError::Io { .. }
            | WaypointError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the terminal response sent to the client for this error
    pub fn to_response(&self) -> Response<Body> {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        Response::builder()
            .status(self.status_code())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = self.status_code();
                response
            })
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            WaypointError::Config { .. } => ErrorSeverity::Critical,
            WaypointError::ConfigurationInconsistency { .. } => ErrorSeverity::Critical,
            WaypointError::Internal { .. } => ErrorSeverity::High,
            WaypointError::Io { .. } => ErrorSeverity::High,
            WaypointError::PipelineAbort { .. } => ErrorSeverity::Medium,
            WaypointError::EmptyEndpointList { .. } => ErrorSeverity::Medium,
            WaypointError::Network { .. } => ErrorSeverity::Medium,
            WaypointError::Timeout { .. } => ErrorSeverity::Medium,
            WaypointError::SignatureRejected { .. } => ErrorSeverity::Medium,
            WaypointError::ReplayRejected { .. } => ErrorSeverity::Medium,
            WaypointError::DispatchExhausted { .. } => ErrorSeverity::Low,
            WaypointError::NoRoute { .. } => ErrorSeverity::Low,
            WaypointError::Cancelled { .. } => ErrorSeverity::Low,
            WaypointError::BadRequest { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for waypoint operations
pub type WaypointResult<T> = Result<T, WaypointError>;

/// Convert from anyhow::Error to WaypointError
impl From<anyhow::Error> for WaypointError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return WaypointError::io(io_err.to_string());
        }

        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            return WaypointError::network(format!("HTTP error: {}", hyper_err));
        }

        WaypointError::internal(err.to_string())
    }
}

impl From<std::io::Error> for WaypointError {
    fn from(err: std::io::Error) -> Self {
        WaypointError::io(err.to_string())
    }
}

impl From<hyper::Error> for WaypointError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            WaypointError::timeout(Duration::from_secs(30), "HTTP request")
        } else if err.is_connect() {
            WaypointError::network(format!("Connection error: {}", err))
        } else {
            WaypointError::network(format!("HTTP error: {}", err))
        }
    }
}

impl From<toml::de::Error> for WaypointError {
    fn from(err: toml::de::Error) -> Self {
        WaypointError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<notify::Error> for WaypointError {
    fn from(err: notify::Error) -> Self {
        WaypointError::io(format!("File watching error: {}", err))
    }
}

impl From<serde_json::Error> for WaypointError {
    fn from(err: serde_json::Error) -> Self {
        WaypointError::internal(format!("JSON serialization error: {}", err))
    }
}

impl From<regex::Error> for WaypointError {
    fn from(err: regex::Error) -> Self {
        WaypointError::config(format!("Invalid regular expression: {}", err))
    }
}

impl From<hyper::http::uri::InvalidUri> for WaypointError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        WaypointError::config(format!("Invalid URI: {}", err))
    }
}

impl From<hyper::http::Error> for WaypointError {
    fn from(err: hyper::http::Error) -> Self {
        WaypointError::network(format!("HTTP error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for WaypointError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        WaypointError::timeout(Duration::from_secs(30), "operation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = WaypointError::no_route("example.com", "GET", "/missing", 8080);
        assert!(matches!(err, WaypointError::NoRoute { .. }));
        assert_eq!(
            err.to_string(),
            "No route for GET example.com/missing on port 8080"
        );

        let err = WaypointError::dispatch_exhausted(5);
        assert_eq!(err.to_string(), "All endpoints busy after 5 attempts");

        let err = WaypointError::timeout(Duration::from_secs(30), "backend call");
        assert_eq!(
            err.to_string(),
            "Operation timed out after 30s: backend call"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            WaypointError::no_route("h", "GET", "/", 80).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WaypointError::dispatch_exhausted(5).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WaypointError::empty_endpoints("none").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WaypointError::signature_rejected("bad").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            WaypointError::replay_rejected("old").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            WaypointError::pipeline_abort("auth", "boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            WaypointError::network("refused").status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = WaypointError::signature_rejected("bad signature").to_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "signature_rejected");
    }

    #[test]
    fn test_error_properties() {
        let network_err = WaypointError::network("Connection error");
        assert!(network_err.is_retryable());
        assert_eq!(network_err.severity(), ErrorSeverity::Medium);

        let config_err = WaypointError::config("Invalid config");
        assert!(!config_err.is_retryable());
        assert_eq!(config_err.severity(), ErrorSeverity::Critical);
        assert_eq!(config_err.kind(), "config");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: WaypointError = io_error.into();
        assert!(matches!(err, WaypointError::Io { .. }));

        let anyhow_error = anyhow::anyhow!("Generic error");
        let err: WaypointError = anyhow_error.into();
        assert!(matches!(err, WaypointError::Internal { .. }));

        let regex_error = regex::Regex::new("(").unwrap_err();
        let err: WaypointError = regex_error.into();
        assert!(matches!(err, WaypointError::Config { .. }));
    }
}
