//! Error types for `unrelated-api-descriptor`.

use serde::Serialize;
use thiserror::Error;
use unrelated_http_tools::error::HttpToolsError;

/// Why a target could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionKind {
    /// Endpoint or spec location could not be reached (network, non-2xx, blocked).
    Unreachable,
    /// The document was fetched but is not a usable schema or spec.
    InvalidSpec,
    /// Resolution exceeded its startup timeout.
    Timeout,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to reach '{location}': {message}")]
    Unreachable { location: String, message: String },

    #[error("invalid spec at '{location}': {message}")]
    InvalidSpec { location: String, message: String },

    #[error("resolution of '{location}' timed out after {secs}s")]
    Timeout { location: String, secs: u64 },

    /// Bad regex passed to schema search.
    #[error("invalid search pattern: {0}")]
    Search(String),
}

impl DescriptorError {
    pub fn unreachable(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn invalid_spec(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Map an outbound HTTP failure for `location` into a resolution error.
    pub fn from_http(location: impl Into<String>, err: &HttpToolsError) -> Self {
        Self::unreachable(location, err.to_string())
    }

    #[must_use]
    pub fn kind(&self) -> Option<ResolutionKind> {
        match self {
            Self::Unreachable { .. } => Some(ResolutionKind::Unreachable),
            Self::InvalidSpec { .. } => Some(ResolutionKind::InvalidSpec),
            Self::Timeout { .. } => Some(ResolutionKind::Timeout),
            Self::Search(_) => None,
        }
    }
}

/// Result type alias for descriptor operations.
pub type Result<T> = std::result::Result<T, DescriptorError>;
