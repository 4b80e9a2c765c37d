//! Logging setup for the bridge binary.

use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const DEFAULT_FILTER: &str =
    "unrelated_api_bridge=info,unrelated_http_tools=info,unrelated_api_descriptor=info";

/// Install the global subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(
    format: LogFormat,
    endpoint: Option<&str>,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init()?,
    }
    if let Some(endpoint) = endpoint {
        tracing::info!(endpoint, "telemetry endpoint configured; spans are logged locally only");
    }
    Ok(())
}
