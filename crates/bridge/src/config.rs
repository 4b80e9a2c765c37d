//! Bridge configuration.
//!
//! [`BridgeConfig`] is the CLI/env surface of the binary; it converts into the plain
//! [`BridgeSettings`] the library is built from.

use crate::ingest::shaping::DEFAULT_MAX_CONTEXT_CHARS;
use crate::planner::PlannerSettings;
use crate::poll::PollSettings;
use clap::{Parser, ValueEnum};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use unrelated_api_descriptor::resolve::ResolverSettings;
use unrelated_http_tools::retry::RetryPolicy;
use unrelated_http_tools::safety::{OutboundHttpSafety, RedirectPolicy};

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub descriptor_ttl: Duration,
    pub session_idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Overall budget for one `query` (all planning rounds).
    pub plan_timeout: Duration,
    pub max_plan_rounds: u32,
    pub max_rows_per_ingest: usize,
    pub max_context_chars: usize,
    pub resolver: ResolverSettings,
    pub poll: PollSettings,
    pub safety: OutboundHttpSafety,
    /// Without a planner, `query` reports a planning error.
    pub planner: Option<PlannerSettings>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            descriptor_ttl: Duration::from_secs(300),
            session_idle_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            plan_timeout: Duration::from_secs(300),
            max_plan_rounds: 30,
            max_rows_per_ingest: 10_000,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            resolver: ResolverSettings::default(),
            poll: PollSettings::default(),
            safety: OutboundHttpSafety::restrictive(),
            planner: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "unrelated-api-bridge",
    about = "Queryable, policy-gated tool surface over REST and GraphQL APIs"
)]
pub struct BridgeConfig {
    /// Address the HTTP surface listens on
    #[arg(long, env = "API_BRIDGE_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Planner endpoint; `query` is unavailable without it
    #[arg(long, env = "API_BRIDGE_PLANNER_URL")]
    pub planner_url: Option<String>,

    #[arg(long, env = "API_BRIDGE_PLANNER_API_KEY", hide_env_values = true)]
    pub planner_api_key: Option<String>,

    #[arg(long, env = "API_BRIDGE_PLANNER_MODEL", default_value = "default")]
    pub planner_model: String,

    #[arg(long, env = "API_BRIDGE_PLANNER_TIMEOUT_SECS", default_value_t = 120)]
    pub planner_timeout_secs: u64,

    /// Accepted for deployment parity; spans are not exported
    #[arg(long, env = "API_BRIDGE_TELEMETRY_ENDPOINT")]
    pub telemetry_endpoint: Option<String>,

    #[arg(long, env = "API_BRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(long, env = "API_BRIDGE_SESSION_IDLE_SECS", default_value_t = 900)]
    pub session_idle_secs: u64,

    #[arg(long, env = "API_BRIDGE_DESCRIPTOR_TTL_SECS", default_value_t = 300)]
    pub descriptor_ttl_secs: u64,

    #[arg(long, env = "API_BRIDGE_CALL_TIMEOUT_SECS", default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Total attempts per call, including the first
    #[arg(long, env = "API_BRIDGE_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    #[arg(long, env = "API_BRIDGE_PLAN_TIMEOUT_SECS", default_value_t = 300)]
    pub plan_timeout_secs: u64,

    #[arg(long, env = "API_BRIDGE_MAX_PLAN_ROUNDS", default_value_t = 30)]
    pub max_plan_rounds: u32,

    #[arg(long, env = "API_BRIDGE_MAX_ROWS", default_value_t = 10_000)]
    pub max_rows: usize,

    #[arg(long, env = "API_BRIDGE_MAX_CONTEXT_CHARS", default_value_t = DEFAULT_MAX_CONTEXT_CHARS)]
    pub max_context_chars: usize,

    #[arg(long, env = "API_BRIDGE_MAX_SCHEMA_CHARS", default_value_t = 32_000)]
    pub max_schema_chars: usize,

    #[arg(long, env = "API_BRIDGE_POLL_INITIAL_MS", default_value_t = 1_000)]
    pub poll_initial_ms: u64,

    #[arg(long, env = "API_BRIDGE_POLL_MAX_INTERVAL_MS", default_value_t = 10_000)]
    pub poll_max_interval_ms: u64,

    #[arg(long, env = "API_BRIDGE_POLL_MAX_SECS", default_value_t = 120)]
    pub poll_max_secs: u64,

    #[arg(long, env = "API_BRIDGE_POLL_MAX_POLLS", default_value_t = 20)]
    pub poll_max_polls: u32,

    /// Allow calls to loopback, private and link-local addresses
    #[arg(long, env = "API_BRIDGE_ALLOW_PRIVATE_NETWORKS")]
    pub allow_private_networks: bool,

    /// Comma-separated host allowlist; unset allows any public host
    #[arg(long, env = "API_BRIDGE_ALLOWED_HOSTS", value_delimiter = ',')]
    pub allowed_hosts: Vec<String>,

    #[arg(long, env = "API_BRIDGE_MAX_RESPONSE_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub max_response_bytes: usize,

    #[arg(long, env = "API_BRIDGE_FOLLOW_REDIRECTS")]
    pub follow_redirects: bool,
}

impl BridgeConfig {
    #[must_use]
    pub fn into_settings(self) -> BridgeSettings {
        let defaults = BridgeSettings::default();
        let allowed_hosts: HashSet<String> = self
            .allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        BridgeSettings {
            descriptor_ttl: Duration::from_secs(self.descriptor_ttl_secs),
            session_idle_ttl: Duration::from_secs(self.session_idle_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            retry: RetryPolicy {
                maximum_attempts: self.retry_attempts.max(1),
                ..RetryPolicy::default()
            },
            plan_timeout: Duration::from_secs(self.plan_timeout_secs),
            max_plan_rounds: self.max_plan_rounds.max(1),
            max_rows_per_ingest: self.max_rows.max(1),
            max_context_chars: self.max_context_chars,
            resolver: ResolverSettings {
                max_schema_chars: self.max_schema_chars,
                ..ResolverSettings::default()
            },
            poll: PollSettings {
                initial_interval: Duration::from_millis(self.poll_initial_ms),
                max_interval: Duration::from_millis(self.poll_max_interval_ms),
                max_duration: Duration::from_secs(self.poll_max_secs),
                max_polls: self.poll_max_polls,
                ..PollSettings::default()
            },
            safety: OutboundHttpSafety {
                allowed_hosts: (!allowed_hosts.is_empty()).then_some(allowed_hosts),
                allow_private_networks: self.allow_private_networks,
                max_response_bytes: Some(self.max_response_bytes),
                redirects: if self.follow_redirects {
                    RedirectPolicy::Follow
                } else {
                    RedirectPolicy::None
                },
            },
            planner: self.planner_url.map(|url| PlannerSettings {
                url,
                api_key: self.planner_api_key,
                model: self.planner_model,
                timeout: Duration::from_secs(self.planner_timeout_secs),
            }),
            ..defaults
        }
    }
}
