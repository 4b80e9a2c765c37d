//! Running calls for a session: policy gate, executor, poller and ingestion, plus plan waves.

use crate::error::{BridgeError, ErrorBody, Result};
use crate::ingest::store::is_fatal;
use crate::ingest::{self, IngestionResult};
use crate::planner::PlannedCall;
use crate::poll::{PollCoordinator, PollOptions, PollState, should_poll};
use crate::session::SessionContext;
use crate::template::{referenced_names, render};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use unrelated_http_tools::call::{CallResult, CallSpec, CallStatus};
use unrelated_http_tools::executor::CallExecutor;

/// A call that went through to ingestion.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub result: CallResult,
    pub ingestion: IngestionResult,
}

#[derive(Clone)]
pub struct CallRunner {
    executor: CallExecutor,
    max_rows: usize,
}

impl CallRunner {
    #[must_use]
    pub fn new(executor: CallExecutor, max_rows: usize) -> Self {
        Self { executor, max_rows }
    }

    #[must_use]
    pub fn executor(&self) -> &CallExecutor {
        &self.executor
    }

    /// Authorize, execute (polling when registered) and ingest one call.
    ///
    /// # Errors
    ///
    /// `PolicyDenied` before any network access; classified call errors; `PollTimeout`;
    /// `Cancelled`; ingestion and store errors.
    pub async fn run(
        &self,
        session: &SessionContext,
        call: &CallSpec,
        poll: Option<&PollOptions>,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome> {
        session.policy.authorize(call)?;

        let endpoint = session.endpoint();
        let result = tokio::select! {
            () = cancel.cancelled() => {
                return Err(BridgeError::Cancelled(format!("{} cancelled", call.describe())));
            }
            r = self.executor.execute(call, &endpoint) => r,
        };
        tracing::info!(
            call = %call.describe(),
            status = ?result.status,
            http_status = ?result.meta.status,
            attempts = result.meta.attempts,
            latency_ms = result.meta.latency_ms,
            "call finished"
        );

        let options = poll.cloned().unwrap_or_default();
        let result = match session
            .poll
            .as_ref()
            .filter(|reg| should_poll(Some(*reg), call, &result, &options))
        {
            Some(registration) => {
                let coordinator =
                    PollCoordinator::new(self.executor.clone(), registration.clone());
                let outcome = coordinator
                    .spawn(call.clone(), result, endpoint, options, cancel)
                    .join()
                    .await;
                let message = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("poll ended in state {:?}", outcome.state));
                match outcome.state {
                    PollState::Done => outcome.result,
                    PollState::TimedOut | PollState::Pending => {
                        return Err(BridgeError::PollTimeout(message));
                    }
                    PollState::Cancelled => return Err(BridgeError::Cancelled(message)),
                    PollState::Error => {
                        return Err(match outcome.result.error {
                            Some(e) => e.into(),
                            None => BridgeError::Validation(message),
                        });
                    }
                }
            }
            None => result,
        };

        if result.status == CallStatus::Error {
            return Err(match result.error {
                Some(e) => e.into(),
                None => BridgeError::Validation(format!("{} failed", call.describe())),
            });
        }

        let signature = signature(session, call);
        let ingested =
            ingest::ingest(&session.store, &result.payload, &signature, self.max_rows).await;
        let ingestion = match ingested {
            Ok(i) => i,
            Err(e) => {
                if is_fatal(&e) {
                    session.mark_failed();
                }
                return Err(e);
            }
        };
        Ok(CallOutcome { result, ingestion })
    }

    /// Run `calls` in dependency waves; calls within a wave run concurrently.
    ///
    /// A call whose dependency did not succeed is skipped and reported as failed.
    ///
    /// # Errors
    ///
    /// `PlanningError` for duplicate ids, unknown or cyclic dependencies. Per-call failures are
    /// reported in the returned [`CallReport`]s.
    pub async fn execute_plan(
        &self,
        session: &SessionContext,
        calls: &[PlannedCall],
        cancel: &CancellationToken,
    ) -> Result<Vec<CallReport>> {
        let (waves, deps) = plan_waves(calls)?;
        let mut payloads: HashMap<String, Value> = HashMap::new();
        let mut reports: Vec<Option<CallReport>> = vec![None; calls.len()];

        for wave in waves {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled("plan cancelled".to_string()));
            }
            let done = {
                let payloads = &payloads;
                futures::future::join_all(wave.iter().map(|&i| {
                    let planned = &calls[i];
                    let deps = &deps[i];
                    async move {
                        let report = match deps.iter().find(|d| !payloads.contains_key(*d)) {
                            Some(dep) => CallReport::failed(
                                planned,
                                planned.call.clone(),
                                &BridgeError::Planning(format!(
                                    "skipped: dependency '{dep}' did not succeed"
                                )),
                            ),
                            None => self.run_planned(session, planned, payloads, cancel).await,
                        };
                        (i, report)
                    }
                }))
                .await
            };
            for (i, report) in done {
                if let Some(payload) = &report.payload {
                    payloads.insert(report.id.clone(), payload.clone());
                }
                reports[i] = Some(report);
            }
        }
        Ok(reports.into_iter().flatten().collect())
    }

    async fn run_planned(
        &self,
        session: &SessionContext,
        planned: &PlannedCall,
        payloads: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> CallReport {
        let call = match bind_call(&planned.call, payloads) {
            Ok(c) => c,
            Err(e) => return CallReport::failed(planned, planned.call.clone(), &e),
        };
        match self.run(session, &call, planned.poll.as_ref(), cancel).await {
            Ok(outcome) => CallReport {
                id: planned.id.clone(),
                call,
                ok: true,
                ingestion: Some(outcome.ingestion),
                error: None,
                payload: Some(outcome.result.payload),
            },
            Err(e) => {
                tracing::warn!(id = %planned.id, call = %call.describe(), error = %e, "planned call failed");
                CallReport::failed(planned, call, &e)
            }
        }
    }
}

/// Result of one planned call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReport {
    pub id: String,
    /// The call as sent, with dependency placeholders substituted.
    pub call: CallSpec,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<IngestionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip)]
    pub payload: Option<Value>,
}

impl CallReport {
    fn failed(planned: &PlannedCall, call: CallSpec, err: &BridgeError) -> Self {
        Self {
            id: planned.id.clone(),
            call,
            ok: false,
            ingestion: None,
            error: Some(err.body()),
            payload: None,
        }
    }
}

/// Table signature: explicit name, matched REST operation, then the call's own label.
#[must_use]
pub fn signature(session: &SessionContext, call: &CallSpec) -> String {
    if let Some(name) = call.name_override() {
        return name.to_string();
    }
    if let CallSpec::Rest(rest) = call
        && let Some(op) = session
            .descriptor
            .capability
            .match_rest(&rest.method, &rest.path)
    {
        return op.name.clone();
    }
    call.default_signature()
}

fn bind_call(call: &CallSpec, payloads: &HashMap<String, Value>) -> Result<CallSpec> {
    let spec = serde_json::to_value(call)
        .map_err(|e| BridgeError::Planning(format!("invalid call: {e}")))?;
    if referenced_names(&spec).is_empty() {
        return Ok(call.clone());
    }
    let rendered = render(&spec, &|name| payloads.get(name)).map_err(BridgeError::Planning)?;
    serde_json::from_value(rendered)
        .map_err(|e| BridgeError::Planning(format!("invalid call after substitution: {e}")))
}

/// Group `calls` into waves (indices) and return each call's dependency ids.
///
/// Dependencies are the declared `dependsOn` plus any call id referenced by a placeholder.
///
/// # Errors
///
/// `PlanningError` for duplicate ids, unknown dependencies or cycles.
pub fn plan_waves(calls: &[PlannedCall]) -> Result<(Vec<Vec<usize>>, Vec<Vec<String>>)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, c) in calls.iter().enumerate() {
        if index.insert(c.id.as_str(), i).is_some() {
            return Err(BridgeError::Planning(format!("duplicate call id '{}'", c.id)));
        }
    }

    let mut deps: Vec<Vec<String>> = Vec::with_capacity(calls.len());
    for c in calls {
        let mut own: Vec<String> = Vec::new();
        for dep in &c.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(BridgeError::Planning(format!(
                    "call '{}' depends on unknown call '{dep}'",
                    c.id
                )));
            }
            if !own.contains(dep) {
                own.push(dep.clone());
            }
        }
        let spec = serde_json::to_value(&c.call).unwrap_or(Value::Null);
        for name in referenced_names(&spec) {
            if index.contains_key(name.as_str()) && !own.contains(&name) {
                own.push(name);
            }
        }
        deps.push(own);
    }

    let mut placed: HashSet<usize> = HashSet::new();
    let mut waves: Vec<Vec<usize>> = Vec::new();
    while placed.len() < calls.len() {
        let wave: Vec<usize> = (0..calls.len())
            .filter(|i| !placed.contains(i))
            .filter(|&i| deps[i].iter().all(|d| placed.contains(&index[d.as_str()])))
            .collect();
        if wave.is_empty() {
            let stuck: Vec<&str> = (0..calls.len())
                .filter(|i| !placed.contains(i))
                .map(|i| calls[i].id.as_str())
                .collect();
            return Err(BridgeError::Planning(format!(
                "cyclic dependencies between calls: {}",
                stuck.join(", ")
            )));
        }
        placed.extend(wave.iter().copied());
        waves.push(wave);
    }
    Ok((waves, deps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn planned(id: &str, depends_on: &[&str], call: Value) -> PlannedCall {
        PlannedCall {
            id: id.to_string(),
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            call: serde_json::from_value(call).expect("call"),
            poll: None,
        }
    }

    #[test]
    fn independent_calls_share_a_wave() {
        let calls = vec![
            planned("users", &[], json!({"method": "GET", "path": "/users"})),
            planned("teams", &[], json!({"method": "GET", "path": "/teams"})),
            planned(
                "posts",
                &[],
                json!({"method": "GET", "path": "/users/${users.0.id}/posts"}),
            ),
            planned("summary", &["posts", "teams"], json!({"method": "GET", "path": "/stats"})),
        ];
        let (waves, deps) = plan_waves(&calls).expect("waves");
        assert_eq!(waves, vec![vec![0, 1], vec![2], vec![3]]);
        assert_eq!(deps[2], vec!["users"]);
    }

    #[test]
    fn unknown_and_cyclic_dependencies_are_planning_errors() {
        let unknown = vec![planned("a", &["ghost"], json!({"method": "GET", "path": "/a"}))];
        let err = plan_waves(&unknown).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::PlanningError);
        assert!(err.to_string().contains("ghost"));

        let cyclic = vec![
            planned("a", &["b"], json!({"method": "GET", "path": "/a"})),
            planned("b", &[], json!({"method": "GET", "path": "/b/${a.id}"})),
        ];
        let err = plan_waves(&cyclic).expect_err("cycle");
        assert!(err.to_string().contains("cyclic"));

        let dup = vec![
            planned("a", &[], json!({"method": "GET", "path": "/a"})),
            planned("a", &[], json!({"method": "GET", "path": "/b"})),
        ];
        assert!(plan_waves(&dup).is_err());
    }

    #[test]
    fn placeholders_bind_dependency_payloads() {
        let call: CallSpec = serde_json::from_value(json!({
            "method": "GET",
            "path": "/users/{id}/posts",
            "pathParams": {"id": "${users.results.0.id}"}
        }))
        .expect("call");
        let mut payloads = HashMap::new();
        payloads.insert("users".to_string(), json!({"results": [{"id": 42}]}));
        let bound = bind_call(&call, &payloads).expect("bind");
        let CallSpec::Rest(rest) = bound else {
            panic!("expected REST call");
        };
        assert_eq!(rest.path_params["id"], json!(42));

        let err = bind_call(&call, &HashMap::new()).expect_err("unbound");
        assert_eq!(err.kind(), ErrorKind::PlanningError);
    }
}
