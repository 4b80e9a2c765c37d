//! Poll coordinator for asynchronous upstream operations.
//!
//! A poll starts from a `pending` (or not-yet-done) call result and re-checks the operation on
//! a capped exponential interval until it is done, fails, runs out of time or polls, or is
//! cancelled. Every check call is bounded by the remaining poll time.

use crate::template::{render, value_at_path};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use unrelated_http_tools::call::{CallResult, CallSpec, CallStatus, Endpoint, RestCall};
use unrelated_http_tools::executor::CallExecutor;
use unrelated_http_tools::glob::matches_any;
use unrelated_http_tools::request::value_to_string;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_duration: Duration,
    pub max_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1_000),
            backoff_coefficient: 1.5,
            max_interval: Duration::from_secs(10),
            max_duration: Duration::from_secs(120),
            max_polls: 20,
        }
    }
}

impl PollSettings {
    fn next_interval(&self, current: Duration) -> Duration {
        let coefficient = if self.backoff_coefficient.is_finite() && self.backoff_coefficient >= 1.0
        {
            self.backoff_coefficient
        } else {
            1.0
        };
        current.mul_f64(coefficient).min(self.max_interval)
    }
}

/// Poll-path patterns plus the interval policy; present only when `Poll-Paths` is non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PollRegistration {
    pub patterns: Vec<String>,
    pub settings: PollSettings,
}

impl PollRegistration {
    #[must_use]
    pub fn new(patterns: Vec<String>, settings: PollSettings) -> Option<Self> {
        (!patterns.is_empty()).then_some(Self { patterns, settings })
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        matches_any(&self.patterns, path)
    }
}

/// Per-call polling options supplied with a planned or explicit call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollOptions {
    /// Explicit check call; may reference the pending payload as `${pending.<path>}`.
    pub check: Option<CallSpec>,
    /// Dot path whose value signals completion.
    pub done_field: Option<String>,
    pub done_value: Option<String>,
    /// Fixed delay between polls; overrides the interval policy.
    pub delay_ms: Option<u64>,
}

impl PollOptions {
    fn done_condition(&self) -> Option<(&str, &str)> {
        Some((self.done_field.as_deref()?, self.done_value.as_deref()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Pending,
    Done,
    TimedOut,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub state: PollState,
    /// Last observed call result.
    pub result: CallResult,
    pub polls: u32,
    pub message: Option<String>,
}

impl PollOutcome {
    fn finish(state: PollState, result: CallResult, polls: u32, message: Option<String>) -> Self {
        Self {
            state,
            result,
            polls,
            message,
        }
    }
}

/// Whether a call result should be handed to the coordinator.
#[must_use]
pub fn should_poll(
    registration: Option<&PollRegistration>,
    call: &CallSpec,
    result: &CallResult,
    options: &PollOptions,
) -> bool {
    let Some(reg) = registration else {
        return false;
    };
    let path_matches = reg.matches(&call.match_target())
        || options
            .check
            .as_ref()
            .is_some_and(|c| reg.matches(&c.match_target()))
        || result
            .meta
            .location
            .as_deref()
            .is_some_and(|l| reg.matches(&location_path(l)))
        || created_job_path(call, &result.payload).is_some_and(|p| reg.matches(&p));
    if !path_matches {
        return false;
    }
    match result.status {
        CallStatus::Pending => true,
        CallStatus::Ok => options.done_condition().is_some(),
        CallStatus::Error => false,
    }
}

#[derive(Clone)]
pub struct PollCoordinator {
    executor: CallExecutor,
    registration: PollRegistration,
}

/// Handle to a spawned poll; dropping it cancels the poll.
pub struct PollHandle {
    task: JoinHandle<PollOutcome>,
    guard: DropGuard,
    fallback: CallResult,
}

impl PollHandle {
    pub async fn join(self) -> PollOutcome {
        let Self {
            task,
            guard,
            fallback,
        } = self;
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => PollOutcome::finish(
                PollState::Error,
                fallback,
                0,
                Some(format!("poll task failed: {e}")),
            ),
        };
        drop(guard);
        outcome
    }
}

impl PollCoordinator {
    #[must_use]
    pub fn new(executor: CallExecutor, registration: PollRegistration) -> Self {
        Self {
            executor,
            registration,
        }
    }

    #[must_use]
    pub fn registration(&self) -> &PollRegistration {
        &self.registration
    }

    /// Run the poll on its own task, cancelled by `parent` or by dropping the handle.
    #[must_use]
    pub fn spawn(
        &self,
        call: CallSpec,
        initial: CallResult,
        endpoint: Endpoint,
        options: PollOptions,
        parent: &CancellationToken,
    ) -> PollHandle {
        let token = parent.child_token();
        let guard = token.clone().drop_guard();
        let this = self.clone();
        let fallback = initial.clone();
        let task = tokio::spawn(async move {
            this.await_completion(&call, initial, &endpoint, &options, &token)
                .await
        });
        PollHandle {
            task,
            guard,
            fallback,
        }
    }

    /// Drive `Pending -> {Pending, Done, TimedOut, Error, Cancelled}` starting from `initial`.
    pub async fn await_completion(
        &self,
        call: &CallSpec,
        initial: CallResult,
        endpoint: &Endpoint,
        options: &PollOptions,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let settings = &self.registration.settings;
        let started = Instant::now();
        let deadline = started + settings.max_duration;
        let mut interval = options
            .delay_ms
            .map_or(settings.initial_interval, Duration::from_millis);

        let (check, check_endpoint) = match derive_check(call, &initial, endpoint, options) {
            Ok(c) => c,
            Err(message) => {
                return PollOutcome::finish(PollState::Error, initial, 0, Some(message));
            }
        };
        let reissue =
            options.check.is_none() && initial.meta.location.is_none() && check == *call;
        let mut check = check;

        let mut current = initial;
        let mut polls: u32 = 0;
        let mut field_checked = false;
        let mut last_value: Option<String> = None;

        loop {
            match evaluate(&current, options, &mut field_checked, &mut last_value) {
                PollState::Done => {
                    tracing::info!(call = %call.describe(), polls, "poll finished");
                    return PollOutcome::finish(PollState::Done, current, polls, None);
                }
                PollState::Error => {
                    let message = current
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .or_else(|| last_value.take());
                    return PollOutcome::finish(PollState::Error, current, polls, message);
                }
                _ => {}
            }

            if polls >= settings.max_polls {
                let message = timeout_message(options, last_value.as_deref(), || {
                    format!("max polls ({}) exceeded", settings.max_polls)
                });
                return PollOutcome::finish(PollState::TimedOut, current, polls, Some(message));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.timed_out(current, polls, options, last_value.as_deref());
            }
            let wait = interval.min(remaining);
            tokio::select! {
                () = cancel.cancelled() => {
                    return PollOutcome::finish(
                        PollState::Cancelled,
                        current,
                        polls,
                        Some("poll cancelled".to_string()),
                    );
                }
                () = tokio::time::sleep(wait) => {}
            }
            if Instant::now() >= deadline {
                return self.timed_out(current, polls, options, last_value.as_deref());
            }

            if reissue {
                increment_polling_count(&mut check);
            }
            polls += 1;
            let call_deadline = deadline.min(Instant::now() + self.executor.call_timeout());
            tracing::debug!(check = %check.describe(), poll = polls, "checking pending operation");
            current = tokio::select! {
                () = cancel.cancelled() => {
                    return PollOutcome::finish(
                        PollState::Cancelled,
                        current,
                        polls,
                        Some("poll cancelled".to_string()),
                    );
                }
                r = self.executor.execute_until(&check, &check_endpoint, call_deadline) => r,
            };
            interval = if options.delay_ms.is_some() {
                interval
            } else {
                settings.next_interval(interval)
            };
        }
    }

    fn timed_out(
        &self,
        current: CallResult,
        polls: u32,
        options: &PollOptions,
        last_value: Option<&str>,
    ) -> PollOutcome {
        let secs = self.registration.settings.max_duration.as_secs_f64();
        let message = timeout_message(options, last_value, || {
            format!("operation still pending after {secs:.1}s")
        });
        tracing::warn!(polls, "poll timed out");
        PollOutcome::finish(PollState::TimedOut, current, polls, Some(message))
    }
}

fn timeout_message(
    options: &PollOptions,
    last_value: Option<&str>,
    head: impl FnOnce() -> String,
) -> String {
    match options.done_condition() {
        Some((field, expected)) => format!(
            "{}. Last {field} value: {} (expected: {expected})",
            head(),
            last_value.unwrap_or("none")
        ),
        None => head(),
    }
}

fn evaluate(
    result: &CallResult,
    options: &PollOptions,
    field_checked: &mut bool,
    last_value: &mut Option<String>,
) -> PollState {
    if result.status == CallStatus::Error {
        return PollState::Error;
    }
    let Some((field, expected)) = options.done_condition() else {
        return if result.status == CallStatus::Ok {
            PollState::Done
        } else {
            PollState::Pending
        };
    };
    // A bare 202 carries no operation state yet.
    if result.meta.status == Some(202) {
        return PollState::Pending;
    }
    let value = value_at_path(&result.payload, field);
    let first = !*field_checked;
    *field_checked = true;
    match value {
        Some(v) => {
            let s = value_to_string(v);
            let done = s.to_lowercase() == expected.to_lowercase();
            *last_value = Some(s);
            if done { PollState::Done } else { PollState::Pending }
        }
        None if first => {
            let keys: Vec<&str> = result
                .payload
                .as_object()
                .map(|m| m.keys().map(String::as_str).collect())
                .unwrap_or_default();
            *last_value = Some(format!(
                "done field '{field}' not found in response. Available keys: {keys:?}"
            ));
            PollState::Error
        }
        None => {
            *last_value = None;
            PollState::Pending
        }
    }
}

/// Pick the check call: explicit, `Location`, `GET {path}/{id}` for a created job, or re-issue.
fn derive_check(
    call: &CallSpec,
    initial: &CallResult,
    endpoint: &Endpoint,
    options: &PollOptions,
) -> Result<(CallSpec, Endpoint), String> {
    if let Some(check) = &options.check {
        let spec = serde_json::to_value(check).map_err(|e| e.to_string())?;
        let payload = &initial.payload;
        let rendered = render(&spec, &|name| (name == "pending").then_some(payload))?;
        let check = serde_json::from_value(rendered)
            .map_err(|e| format!("invalid check call after substitution: {e}"))?;
        return Ok((check, endpoint.clone()));
    }

    if let Some(location) = &initial.meta.location {
        return Ok(location_check(location, endpoint));
    }

    if let Some(path) = created_job_path(call, &initial.payload) {
        return Ok((CallSpec::rest("GET", &path), endpoint.clone()));
    }

    Ok((call.clone(), endpoint.clone()))
}

/// `{path}/{id}` for a POST whose pending payload carries `id`, `jobId` or `job_id`.
fn created_job_path(call: &CallSpec, payload: &Value) -> Option<String> {
    let CallSpec::Rest(rest) = call else {
        return None;
    };
    if !rest.method.eq_ignore_ascii_case("POST") {
        return None;
    }
    let id = ["id", "jobId", "job_id"]
        .iter()
        .find_map(|k| payload.get(*k))
        .filter(|v| v.is_string() || v.is_number())?;
    Some(format!(
        "{}/{}",
        rest.path.trim_end_matches('/'),
        value_to_string(id)
    ))
}

fn location_path(location: &str) -> String {
    match Url::parse(location) {
        Ok(url) => url.path().to_string(),
        Err(_) => location.split('?').next().unwrap_or(location).to_string(),
    }
}

fn location_check(location: &str, endpoint: &Endpoint) -> (CallSpec, Endpoint) {
    let (endpoint, path, query) = match Url::parse(location) {
        Ok(url) => {
            let origin = url.origin().ascii_serialization();
            let same_origin = endpoint
                .base_url
                .as_deref()
                .and_then(|b| Url::parse(b).ok())
                .is_some_and(|b| b.origin().ascii_serialization() == origin);
            let endpoint = Endpoint {
                base_url: Some(origin),
                // Credentials only travel to the origin they were configured for.
                headers: if same_origin {
                    endpoint.headers.clone()
                } else {
                    Default::default()
                },
            };
            (endpoint, url.path().to_string(), url.query().map(str::to_string))
        }
        Err(_) => {
            let (path, query) = location
                .split_once('?')
                .map_or((location, None), |(p, q)| (p, Some(q)));
            // Relative locations resolve against the base URL's host, not its path prefix.
            let endpoint = match endpoint.base_url.as_deref().and_then(|b| Url::parse(b).ok()) {
                Some(base) if path.starts_with('/') => Endpoint {
                    base_url: Some(base.origin().ascii_serialization()),
                    headers: endpoint.headers.clone(),
                },
                _ => endpoint.clone(),
            };
            (endpoint, path.to_string(), query.map(str::to_string))
        }
    };

    let mut query_params = Map::new();
    if let Some(q) = query {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            query_params.insert(k.into_owned(), Value::String(v.into_owned()));
        }
    }
    let check = CallSpec::Rest(RestCall {
        method: "GET".to_string(),
        path,
        path_params: Map::new(),
        query_params,
        body: None,
        name: None,
    });
    (check, endpoint)
}

fn increment_polling_count(call: &mut CallSpec) {
    let CallSpec::Rest(rest) = call else {
        return;
    };
    if let Some(count) = rest
        .body
        .as_mut()
        .and_then(|b| b.get_mut("polling"))
        .and_then(|p| p.get_mut("count"))
        && let Some(n) = count.as_i64()
    {
        *count = Value::from(n + 1);
    }
}
