//! Retrying call executor.
//!
//! Turns a [`CallSpec`] into a classified [`CallResult`]. Transient failures (transport errors,
//! timeouts, 5xx, 429) are retried with capped exponential backoff inside a single deadline;
//! everything else is classified and returned on the first attempt.

use crate::call::{
    CallErrorKind, CallResult, CallSpec, CallStatus, Endpoint, GraphqlCall, HttpMeta, RestCall,
};
use crate::error::HttpToolsError;
use crate::request::{build_url, decode_body, query_pairs, read_body_limited, substitute_path_params};
use crate::retry::RetryPolicy;
use crate::safety::{OutboundHttpSafety, redact_url};
use crate::semantics::{GraphqlOperationKind, is_idempotent, parse_graphql_operations, strongest_kind};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Body markers that flag an accepted-but-unfinished operation.
pub const PENDING_MARKERS: &[&str] = &[
    "pending",
    "queued",
    "running",
    "processing",
    "in_progress",
    "accepted",
];

#[derive(Clone)]
pub struct CallExecutor {
    client: Client,
    safety: Arc<OutboundHttpSafety>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

struct PreparedRequest {
    method: Method,
    url: Url,
    body: Option<Value>,
    graphql: bool,
    /// Whether a transport failure may be replayed.
    replay_safe: bool,
}

struct RawResponse {
    status: StatusCode,
    location: Option<String>,
    retry_after: Option<Duration>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

enum AttemptFailure {
    Transport(String),
    TooLarge(String),
    Blocked(String),
}

impl CallExecutor {
    /// Create an executor whose client honours `safety`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        safety: OutboundHttpSafety,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Result<Self, HttpToolsError> {
        let client = safety.build_client()?;
        Ok(Self {
            client,
            safety: Arc::new(safety),
            retry,
            call_timeout,
        })
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn safety(&self) -> &OutboundHttpSafety {
        &self.safety
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Execute `call` against `endpoint` within the executor's call timeout.
    pub async fn execute(&self, call: &CallSpec, endpoint: &Endpoint) -> CallResult {
        self.execute_until(call, endpoint, Instant::now() + self.call_timeout)
            .await
    }

    /// Execute `call` against `endpoint`, giving up (including retries) at `deadline`.
    pub async fn execute_until(
        &self,
        call: &CallSpec,
        endpoint: &Endpoint,
        deadline: Instant,
    ) -> CallResult {
        let started = Instant::now();
        let mut meta = HttpMeta::default();

        let prepared = match prepare(call, endpoint) {
            Ok(p) => p,
            Err(e) => return CallResult::failed(CallErrorKind::Validation, e, meta),
        };

        if let Err(e) = self.safety.check_url(&prepared.url).await {
            let kind = match e {
                HttpToolsError::Blocked(_) => CallErrorKind::Blocked,
                _ => CallErrorKind::Network,
            };
            return CallResult::failed(kind, e.to_string(), meta);
        }

        let target = redact_url(&prepared.url);
        let mut attempt: u32 = 1;
        let max_attempts = self.retry.max_attempts();

        let result = loop {
            meta.attempts = attempt;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break CallResult::failed(
                    CallErrorKind::Network,
                    format!("request to {target} timed out"),
                    meta.clone(),
                );
            }

            let outcome = tokio::time::timeout(
                remaining.min(self.call_timeout),
                self.send_once(&prepared, endpoint),
            )
            .await;

            // Arms that do not `break` are retryable; the second value is a server delay hint.
            let (failure, retry_hint) = match outcome {
                Ok(Ok(raw)) => {
                    meta.status = Some(raw.status.as_u16());
                    if raw.status == StatusCode::TOO_MANY_REQUESTS
                        && !self.retry.disallows("rate_limited")
                    {
                        let hint = raw.retry_after;
                        (classify(raw, &prepared, &mut meta), hint)
                    } else if raw.status.is_server_error()
                        && prepared.replay_safe
                        && !self.retry.disallows("upstream_5xx")
                    {
                        (classify(raw, &prepared, &mut meta), None)
                    } else {
                        break classify(raw, &prepared, &mut meta);
                    }
                }
                Ok(Err(AttemptFailure::Transport(msg))) => {
                    let res = CallResult::failed(
                        CallErrorKind::Network,
                        format!("request to {target} failed: {msg}"),
                        meta.clone(),
                    );
                    if prepared.replay_safe && !self.retry.disallows("transport") {
                        (res, None)
                    } else {
                        break res;
                    }
                }
                Ok(Err(AttemptFailure::TooLarge(msg))) => {
                    break CallResult::failed(
                        CallErrorKind::Upstream,
                        format!("response too large: {msg}"),
                        meta.clone(),
                    );
                }
                Ok(Err(AttemptFailure::Blocked(msg))) => {
                    break CallResult::failed(CallErrorKind::Blocked, msg, meta.clone());
                }
                Err(_) => {
                    let res = CallResult::failed(
                        CallErrorKind::Network,
                        format!("request to {target} timed out"),
                        meta.clone(),
                    );
                    if !prepared.replay_safe || self.retry.disallows("timeout") {
                        break res;
                    }
                    (res, None)
                }
            };

            if attempt >= max_attempts {
                break failure;
            }

            let delay = retry_hint.unwrap_or_else(|| self.retry.delay_after(attempt));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if delay >= remaining {
                break failure;
            }
            tracing::debug!(
                url = %target,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = ?failure.error.as_ref().map(|e| &e.message),
                "retrying call"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt = attempt.saturating_add(1);
        };

        let mut result = result;
        result.meta.attempts = attempt;
        result.meta.latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            call = %call.describe(),
            url = %target,
            status = ?result.meta.status,
            outcome = ?result.status,
            attempts = result.meta.attempts,
            latency_ms = result.meta.latency_ms,
            "call finished"
        );
        result
    }

    async fn send_once(
        &self,
        prepared: &PreparedRequest,
        endpoint: &Endpoint,
    ) -> Result<RawResponse, AttemptFailure> {
        let mut request = self
            .client
            .request(prepared.method.clone(), prepared.url.clone());
        for (name, value) in &endpoint.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &prepared.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| match HttpToolsError::from(e) {
            HttpToolsError::Blocked(m) => AttemptFailure::Blocked(m),
            other => AttemptFailure::Transport(other.to_string()),
        })?;

        let status = response.status();
        let headers = response.headers();
        let location = headers
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = read_body_limited(response, self.safety.max_response_bytes)
            .await
            .map_err(|e| match e {
                HttpToolsError::TooLarge(m) => AttemptFailure::TooLarge(m),
                other => AttemptFailure::Transport(other.to_string()),
            })?;

        Ok(RawResponse {
            status,
            location,
            retry_after,
            content_type,
            bytes,
        })
    }
}

fn prepare(call: &CallSpec, endpoint: &Endpoint) -> Result<PreparedRequest, String> {
    match call {
        CallSpec::Rest(c) => prepare_rest(c, endpoint),
        CallSpec::Graphql(c) => prepare_graphql(c, endpoint),
    }
}

fn prepare_rest(call: &RestCall, endpoint: &Endpoint) -> Result<PreparedRequest, String> {
    let method = Method::from_bytes(call.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("Invalid HTTP method '{}'", call.method))?;
    let path = substitute_path_params(&call.path, &call.path_params).map_err(|e| e.to_string())?;
    let url = build_url(
        endpoint.base_url.as_deref(),
        &path,
        &query_pairs(&call.query_params),
    )
    .map_err(|e| e.to_string())?;
    let replay_safe = is_idempotent(&method);
    Ok(PreparedRequest {
        method,
        url,
        body: call.body.clone(),
        graphql: false,
        replay_safe,
    })
}

fn prepare_graphql(call: &GraphqlCall, endpoint: &Endpoint) -> Result<PreparedRequest, String> {
    let Some(endpoint_url) = endpoint.base_url.as_deref().filter(|u| !u.trim().is_empty()) else {
        return Err("No base URL provided for the GraphQL endpoint".to_string());
    };
    let url = Url::parse(endpoint_url.trim()).map_err(|e| format!("Invalid URL: {e}"))?;
    let replay_safe = parse_graphql_operations(&call.query)
        .is_ok_and(|ops| strongest_kind(&ops) == GraphqlOperationKind::Query);

    let mut body = Map::new();
    body.insert("query".to_string(), Value::String(call.query.clone()));
    if let Some(vars) = &call.variables {
        body.insert("variables".to_string(), vars.clone());
    }
    if let Some(op) = &call.operation_name {
        body.insert("operationName".to_string(), Value::String(op.clone()));
    }

    Ok(PreparedRequest {
        method: Method::POST,
        url,
        body: Some(Value::Object(body)),
        graphql: true,
        replay_safe,
    })
}

fn classify(raw: RawResponse, prepared: &PreparedRequest, meta: &mut HttpMeta) -> CallResult {
    let status = raw.status;
    meta.status = Some(status.as_u16());
    meta.location.clone_from(&raw.location);
    let body = decode_body(&raw.bytes, raw.content_type.as_deref());

    if status.is_success() {
        if prepared.graphql {
            return classify_graphql(body, meta);
        }
        let pending = status == StatusCode::ACCEPTED || has_pending_marker(&body);
        return CallResult {
            status: if pending {
                CallStatus::Pending
            } else {
                CallStatus::Ok
            },
            payload: body,
            meta: meta.clone(),
            error: None,
        };
    }

    let code = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let message = format!("API returned {code} {reason}: {}", compact(&body));
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CallErrorKind::Auth,
        StatusCode::TOO_MANY_REQUESTS => CallErrorKind::RateLimited,
        s if s.is_client_error() => CallErrorKind::Validation,
        _ => CallErrorKind::Upstream,
    };
    let mut result = CallResult::failed(kind, message, meta.clone());
    result.payload = body;
    result
}

fn classify_graphql(body: Value, meta: &mut HttpMeta) -> CallResult {
    let Value::Object(mut obj) = body else {
        return CallResult::failed(
            CallErrorKind::Upstream,
            format!("GraphQL endpoint returned a non-object body: {}", compact(&body)),
            meta.clone(),
        );
    };
    let data = obj.remove("data").unwrap_or(Value::Null);
    let errors = obj.remove("errors").filter(|e| !e.is_null());

    if !data.is_null() {
        meta.graphql_errors = errors;
        return CallResult {
            status: CallStatus::Ok,
            payload: data,
            meta: meta.clone(),
            error: None,
        };
    }

    let message = match &errors {
        Some(Value::Array(items)) => {
            let msgs: Vec<String> = items
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| e.to_string(), str::to_string)
                })
                .collect();
            format!("GraphQL errors: {}", msgs.join("; "))
        }
        Some(other) => format!("GraphQL errors: {other}"),
        None => "GraphQL response contained neither data nor errors".to_string(),
    };
    meta.graphql_errors = errors;
    CallResult::failed(CallErrorKind::Validation, message, meta.clone())
}

/// Whether a successful body says the work is not finished yet.
#[must_use]
pub fn has_pending_marker(body: &Value) -> bool {
    let Some(obj) = body.as_object() else {
        return false;
    };
    ["status", "state"].iter().any(|k| {
        obj.get(*k)
            .and_then(Value::as_str)
            .is_some_and(|s| PENDING_MARKERS.contains(&s.to_ascii_lowercase().as_str()))
    })
}

fn compact(body: &Value) -> String {
    let s = match body {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if s.chars().count() > 500 {
        let mut out: String = s.chars().take(500).collect();
        out.push_str("...");
        out
    } else {
        s
    }
}
