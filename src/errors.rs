//! Client-side error taxonomy.
//!
//! Every variant maps to one semantic outcome of a cluster operation.
//! HTTP status codes returned by a node are translated here, in
//! [`RiakError::from_status`], so each protocol operation only has to
//! handle the codes whose meaning is specific to it.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Library result alias.
pub type Result<T> = std::result::Result<T, RiakError>;

/// Errors surfaced by connections, the node pool and the object codec.
#[derive(Debug, Error)]
pub enum RiakError {
    /// Invalid or missing configuration (e.g. an empty node list).
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure reaching a node.
    #[error("network error talking to {address}: {message}")]
    Network { address: String, message: String },

    /// A deadline expired before the operation completed.
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// Input rejected locally or by the server with 400.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The requested object or counter does not exist.
    #[error("not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// A conditional request header did not match the stored state.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The fetched key has concurrent sibling values.
    #[error("{bucket}/{key} has {} siblings", vtags.len())]
    Siblings {
        bucket: String,
        key: String,
        vtags: Vec<String>,
    },

    /// Every connection in the pool is currently Dead.
    #[error("cluster unreachable: all {nodes} nodes are down")]
    ClusterUnreachable { nodes: usize },

    /// A connection was released to a pool that did not lease it.
    #[error("connection {address} is not on lease from this pool")]
    NotLeased { address: String },

    /// A response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// A status code with no mapping for the operation that received it.
    #[error("unexpected status {status} during {operation}: {body}")]
    UnexpectedStatus {
        operation: String,
        status: u16,
        body: String,
    },
}

impl RiakError {
    /// Stable machine-readable code for logs and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            RiakError::Config(_) => "ConfigError",
            RiakError::Network { .. } => "NetworkError",
            RiakError::Timeout { .. } => "TimeoutError",
            RiakError::Validation { .. } => "ValidationError",
            RiakError::NotFound { .. } => "NotFoundError",
            RiakError::Conflict { .. } => "ConflictError",
            RiakError::Siblings { .. } => "Siblings",
            RiakError::ClusterUnreachable { .. } => "ClusterUnreachable",
            RiakError::NotLeased { .. } => "NotLeased",
            RiakError::Decode(_) => "DecodeError",
            RiakError::UnexpectedStatus { .. } => "UnexpectedStatus",
        }
    }

    /// Shorthand for a [`RiakError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        RiakError::Validation {
            message: message.into(),
        }
    }

    /// Translate a non-success status into the taxonomy.
    ///
    /// `bucket`/`key` only feed the `NotFound` variant; `body` is the
    /// (possibly empty) response text, kept for diagnostics.
    pub fn from_status(
        operation: &str,
        status: StatusCode,
        bucket: &str,
        key: &str,
        body: &str,
    ) -> Self {
        let body = body.trim();
        match status {
            StatusCode::BAD_REQUEST => RiakError::Validation {
                message: if body.is_empty() {
                    format!("{operation} rejected by server")
                } else {
                    body.to_string()
                },
            },
            StatusCode::NOT_FOUND => RiakError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            StatusCode::PRECONDITION_FAILED => RiakError::Conflict {
                message: "one of the conditional headers failed to match".to_string(),
            },
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => RiakError::Timeout {
                operation: operation.to_string(),
            },
            other => RiakError::UnexpectedStatus {
                operation: operation.to_string(),
                status: other.as_u16(),
                body: body.to_string(),
            },
        }
    }

    /// Whether the error came from the transport rather than the node.
    pub fn is_transport(&self) -> bool {
        matches!(self, RiakError::Network { .. })
    }
}

impl From<serde_json::Error> for RiakError {
    fn from(e: serde_json::Error) -> Self {
        RiakError::Decode(e.to_string())
    }
}

/// Run `fut` under a caller-supplied deadline.
///
/// Expiry yields [`RiakError::Timeout`]; the connection the future was
/// using keeps its liveness state.
pub async fn deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RiakError::Timeout {
            operation: format!("operation (deadline {limit:?})"),
        }),
    }
}
