//! Unified error taxonomy — every failure in the gateway is boiled down
//! to one of these kinds before it crosses the gRPC boundary.
//!
//! Upstream provider error bodies are never forwarded verbatim: only the
//! kind and a short, sanitized message survive the trip to `tonic::Status`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream provider temporarily unavailable: {0}")]
    UpstreamTransient(String),

    #[error("upstream provider rejected the request: {0}")]
    UpstreamPermanent(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if a dispatch attempt that produced this error should be retried
    /// against the next candidate provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient(_) | Self::RateLimited { .. })
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::DeadlineExceeded
        } else if e.is_connect() {
            Self::UpstreamTransient(format!("connection error: {e}"))
        } else {
            Self::UpstreamTransient(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("record not found".into()),
            rusqlite::Error::SqliteFailure(..) | rusqlite::Error::SqliteSingleThreadedMode => {
                Self::Unavailable(format!("key store unreachable: {e}"))
            }
            other => Self::Internal(format!("store error: {other}")),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Internal(format!("config parse error: {e}"))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("io error: {e}"))
    }
}

impl From<GatewayError> for tonic::Status {
    fn from(err: GatewayError) -> Self {
        use tonic::Code;
        let code = match &err {
            GatewayError::InvalidInput(_) => Code::InvalidArgument,
            GatewayError::Unauthenticated => Code::Unauthenticated,
            GatewayError::PermissionDenied(_) => Code::PermissionDenied,
            GatewayError::NotFound(_) => Code::NotFound,
            GatewayError::RateLimited { .. } => Code::ResourceExhausted,
            GatewayError::UpstreamTransient(_) => Code::Unavailable,
            GatewayError::UpstreamPermanent(_) => Code::FailedPrecondition,
            GatewayError::DeadlineExceeded => Code::DeadlineExceeded,
            GatewayError::Internal(_) => Code::Internal,
            GatewayError::Unavailable(_) => Code::Unavailable,
        };
        tonic::Status::new(code, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn maps_kinds_to_expected_codes() {
        let cases: Vec<(GatewayError, Code)> = vec![
            (GatewayError::invalid_input("bad"), Code::InvalidArgument),
            (GatewayError::Unauthenticated, Code::Unauthenticated),
            (GatewayError::PermissionDenied("x".into()), Code::PermissionDenied),
            (GatewayError::NotFound("x".into()), Code::NotFound),
            (GatewayError::RateLimited { retry_after_secs: 5 }, Code::ResourceExhausted),
            (GatewayError::UpstreamTransient("x".into()), Code::Unavailable),
            (GatewayError::UpstreamPermanent("x".into()), Code::FailedPrecondition),
            (GatewayError::DeadlineExceeded, Code::DeadlineExceeded),
            (GatewayError::internal("x"), Code::Internal),
            (GatewayError::Unavailable("x".into()), Code::Unavailable),
        ];
        for (err, expected) in cases {
            let status: tonic::Status = err.into();
            assert_eq!(status.code(), expected);
        }
    }

    #[test]
    fn sqlite_failure_maps_to_unavailable_not_internal() {
        let sqlite_err = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(5), Some("database is locked".into()));
        let mapped: GatewayError = sqlite_err.into();
        assert!(matches!(mapped, GatewayError::Unavailable(_)));
        let status: tonic::Status = mapped.into();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[test]
    fn retryable_kinds() {
        assert!(GatewayError::UpstreamTransient("x".into()).is_retryable());
        assert!(GatewayError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(!GatewayError::UpstreamPermanent("x".into()).is_retryable());
        assert!(!GatewayError::invalid_input("x").is_retryable());
    }
}
