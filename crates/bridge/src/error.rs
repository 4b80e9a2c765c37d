//! Error types for the API bridge.

use serde::Serialize;
use thiserror::Error;
use unrelated_api_descriptor::error::DescriptorError;
use unrelated_http_tools::call::{CallError, CallErrorKind};

/// Error categories reported to callers as `error.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ResolutionError,
    PolicyDenied,
    NetworkError,
    AuthError,
    RateLimited,
    PollTimeout,
    IngestionError,
    PlanningError,
    ValidationError,
    UpstreamError,
    Binding,
    Cancelled,
    StoreError,
}

impl From<CallErrorKind> for ErrorKind {
    fn from(kind: CallErrorKind) -> Self {
        match kind {
            CallErrorKind::Network => Self::NetworkError,
            CallErrorKind::Auth => Self::AuthError,
            CallErrorKind::RateLimited => Self::RateLimited,
            CallErrorKind::Validation => Self::ValidationError,
            CallErrorKind::Upstream => Self::UpstreamError,
            CallErrorKind::Blocked => Self::PolicyDenied,
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Missing or malformed request binding headers.
    #[error("{0}")]
    Binding(String),

    #[error(transparent)]
    Resolution(#[from] DescriptorError),

    #[error("{0}")]
    PolicyDenied(String),

    /// A classified upstream call failure.
    #[error("{message}")]
    Call { kind: ErrorKind, message: String },

    #[error("{0}")]
    PollTimeout(String),

    #[error("{0}")]
    Ingestion(String),

    #[error("{0}")]
    Planning(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// `{kind, message}` as returned in `{ok: false, error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl BridgeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Binding(_) => ErrorKind::Binding,
            Self::Resolution(_) => ErrorKind::ResolutionError,
            Self::PolicyDenied(_) => ErrorKind::PolicyDenied,
            Self::Call { kind, .. } => *kind,
            Self::PollTimeout(_) => ErrorKind::PollTimeout,
            Self::Ingestion(_) => ErrorKind::IngestionError,
            Self::Planning(_) => ErrorKind::PlanningError,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Store(_) => ErrorKind::StoreError,
        }
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<CallError> for BridgeError {
    fn from(e: CallError) -> Self {
        Self::Call {
            kind: e.kind.into(),
            message: e.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_by_name() {
        let body = BridgeError::PolicyDenied("POST /users not allowed".to_string()).body();
        let v = serde_json::to_value(&body).expect("serialize");
        assert_eq!(v["kind"], "PolicyDenied");
        assert_eq!(v["message"], "POST /users not allowed");
    }

    #[test]
    fn call_errors_map_to_taxonomy() {
        let e: BridgeError = CallError {
            kind: CallErrorKind::Auth,
            message: "API returned 401 Unauthorized".to_string(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::AuthError);

        let e = BridgeError::Resolution(DescriptorError::invalid_spec("spec.json", "bad"));
        assert_eq!(e.kind(), ErrorKind::ResolutionError);
    }
}
