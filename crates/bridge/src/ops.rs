//! The two public operations, `query` and `execute`, over a bound target.

use crate::binding::RequestBinding;
use crate::config::BridgeSettings;
use crate::error::{BridgeError, ErrorBody, ErrorKind, Result};
use crate::ingest::IngestionResult;
use crate::ingest::shaping::truncate_for_context;
use crate::ingest::store::is_fatal;
use crate::plan::{CallReport, CallRunner};
use crate::planner::{Observation, Plan, PlanRequest, Planner, RemotePlanner};
use crate::poll::PollOptions;
use crate::session::{SessionContext, SessionManager};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use unrelated_api_descriptor::cache::DescriptorCache;
use unrelated_api_descriptor::capability::{ApiKind, TargetDescriptor};
use unrelated_api_descriptor::resolve::Resolver;
use unrelated_http_tools::call::{CallSpec, RestCall};
use unrelated_http_tools::error::HttpToolsError;
use unrelated_http_tools::executor::CallExecutor;

/// `execute` input: a call plus optional polling options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteRequest {
    pub call: CallSpec,
    #[serde(default)]
    pub poll: Option<PollOptions>,
}

impl From<CallSpec> for ExecuteRequest {
    fn from(call: CallSpec) -> Self {
        Self { call, poll: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteResponse {
    pub ok: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorBody>,
    /// Raw upstream payload; only with `Include-Result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ExecuteResponse {
    #[must_use]
    pub fn failed(err: &BridgeError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.body()),
            result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallErrorReport {
    pub id: String,
    pub call: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResponse {
    pub ok: bool,
    pub data: Option<Value>,
    /// GraphQL targets: the query documents sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<String>>,
    /// REST targets: `{method, path, pathParams?, query?, body?}` per call sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<Vec<Value>>,
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The plan timeout cut the run short.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
    #[serde(rename = "callErrors", skip_serializing_if = "Vec::is_empty")]
    pub call_errors: Vec<CallErrorReport>,
}

impl QueryResponse {
    #[must_use]
    pub fn failed(err: &BridgeError) -> Self {
        Self {
            error: Some(err.body()),
            ..Self::default()
        }
    }
}

/// Progress of one `query`, kept outside the timed future so a timeout keeps what was done.
#[derive(Default)]
struct QueryRun {
    round: u32,
    history: Vec<Observation>,
    sent: Vec<CallSpec>,
    call_errors: Vec<CallErrorReport>,
    last_data: Option<Value>,
    answer: Option<String>,
    finished: bool,
}

pub struct Bridge {
    sessions: Arc<SessionManager>,
    runner: CallRunner,
    planner: Option<Arc<dyn Planner>>,
    settings: BridgeSettings,
}

impl Bridge {
    /// Build the bridge with an explicit planner (or none).
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound HTTP client cannot be built.
    pub fn new(
        settings: BridgeSettings,
        planner: Option<Arc<dyn Planner>>,
    ) -> std::result::Result<Self, HttpToolsError> {
        let executor = CallExecutor::new(
            settings.safety.clone(),
            settings.retry.clone(),
            settings.call_timeout,
        )?;
        let resolver = Resolver::new(
            executor.client().clone(),
            Arc::new(settings.safety.clone()),
            settings.resolver.clone(),
        );
        let descriptors = DescriptorCache::new(resolver, settings.descriptor_ttl);
        let sessions = Arc::new(SessionManager::new(
            descriptors,
            settings.poll.clone(),
            settings.session_idle_ttl,
        ));
        Ok(Self {
            sessions,
            runner: CallRunner::new(executor, settings.max_rows_per_ingest),
            planner,
            settings,
        })
    }

    /// Build the bridge with a [`RemotePlanner`] when a planner URL is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_settings(settings: BridgeSettings) -> std::result::Result<Self, HttpToolsError> {
        let planner: Option<Arc<dyn Planner>> = match &settings.planner {
            Some(planner) => {
                let client = reqwest::Client::builder().build()?;
                Some(Arc::new(RemotePlanner::new(client, planner.clone())))
            }
            None => None,
        };
        Self::new(settings, planner)
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Start the idle-session sweeper.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.sessions
            .spawn_sweeper(self.settings.sweep_interval, cancel)
    }

    /// Re-resolve the bound target and drop its session.
    ///
    /// # Errors
    ///
    /// Propagates the resolution error.
    pub async fn refresh(&self, binding: &RequestBinding) -> Result<Arc<TargetDescriptor>> {
        self.sessions.refresh(binding).await
    }

    /// Run one call through policy, executor, poller and ingestion.
    pub async fn execute(
        &self,
        binding: &RequestBinding,
        request: ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecuteResponse {
        match self.try_execute(binding, &request, cancel).await {
            Ok((data, payload)) => ExecuteResponse {
                ok: true,
                data: Some(data),
                error: None,
                result: binding.include_result.then_some(payload),
            },
            Err(e) => {
                tracing::warn!(
                    call = %request.call.describe(),
                    kind = ?e.kind(),
                    error = %e,
                    "execute failed"
                );
                ExecuteResponse::failed(&e)
            }
        }
    }

    async fn try_execute(
        &self,
        binding: &RequestBinding,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<(Value, Value)> {
        let session = self.sessions.get_or_create(binding).await?;
        let outcome = self
            .runner
            .run(&session, &request.call, request.poll.as_ref(), cancel)
            .await?;
        let data = self.table_view(&session, &outcome.ingestion).await?;
        Ok((data, outcome.result.payload))
    }

    async fn table_view(&self, session: &SessionContext, ingestion: &IngestionResult) -> Result<Value> {
        let rows = match session.store.read_table(&ingestion.table).await {
            Ok(rows) => rows,
            Err(e) => {
                if is_fatal(&e) {
                    session.mark_failed();
                }
                return Err(e);
            }
        };
        let mut view = truncate_for_context(&rows, &ingestion.table, self.settings.max_context_chars);
        if ingestion.truncated
            && let Some(obj) = view.as_object_mut()
        {
            obj.insert("rowCapReached".to_string(), Value::Bool(true));
        }
        Ok(view)
    }

    /// Answer `question` with planner rounds of schema searches, calls and SQL.
    ///
    /// Stops when the planner answers or finishes, rounds run out, or the plan timeout elapses.
    /// Data retrieved before a failure is still returned, marked `[Partial …]`.
    pub async fn query(
        &self,
        binding: &RequestBinding,
        question: &str,
        cancel: &CancellationToken,
    ) -> QueryResponse {
        let session = match self.sessions.get_or_create(binding).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(kind = ?e.kind(), error = %e, "query failed before planning");
                return QueryResponse::failed(&e);
            }
        };

        let mut run = QueryRun::default();
        let outcome = tokio::time::timeout(
            self.settings.plan_timeout,
            self.plan_rounds(&session, question, cancel, &mut run),
        )
        .await;
        let response = self.finish_query(binding, run, outcome);
        tracing::info!(
            ok = response.ok,
            incomplete = response.incomplete,
            call_errors = response.call_errors.len(),
            "query finished"
        );
        response
    }

    async fn plan_rounds(
        &self,
        session: &SessionContext,
        question: &str,
        cancel: &CancellationToken,
        run: &mut QueryRun,
    ) -> Result<()> {
        let planner = self
            .planner
            .as_ref()
            .ok_or_else(|| BridgeError::Planning("no planner configured".to_string()))?;
        let max_rounds = self.settings.max_plan_rounds;

        for round in 1..=max_rounds {
            run.round = round;
            let plan = {
                let request = PlanRequest {
                    question,
                    api_kind: session.descriptor.kind,
                    schema_context: session.descriptor.schema_context(),
                    current_date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
                    round,
                    max_rounds,
                    history: &run.history,
                };
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(BridgeError::Cancelled("query cancelled".to_string()));
                    }
                    plan = planner.plan(&request) => plan?,
                }
            };
            self.apply_plan(session, round, plan, cancel, run).await?;
            if run.finished {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn apply_plan(
        &self,
        session: &SessionContext,
        round: u32,
        plan: Plan,
        cancel: &CancellationToken,
        run: &mut QueryRun,
    ) -> Result<()> {
        for search in &plan.searches {
            let output = session
                .descriptor
                .search_schema(&search.pattern, &search.options)
                .unwrap_or_else(|e| e.to_string());
            run.history.push(Observation {
                round,
                kind: "search",
                detail: json!({"pattern": search.pattern, "output": output}),
            });
        }

        if !plan.calls.is_empty() {
            match self.runner.execute_plan(session, &plan.calls, cancel).await {
                Ok(reports) => {
                    for report in reports {
                        self.record_call(session, round, report, run).await;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => run.history.push(Observation {
                    round,
                    kind: "error",
                    detail: json!({"error": e.body()}),
                }),
            }
        }

        if let Some(sql) = &plan.sql {
            match session.store.run_sql(sql).await {
                Ok(rows) => {
                    let view = truncate_for_context(&rows, "sql_result", self.settings.max_context_chars);
                    run.history.push(Observation {
                        round,
                        kind: "sql",
                        detail: json!({"sql": sql, "result": view}),
                    });
                    run.last_data = Some(Value::Array(rows.into_iter().map(Value::Object).collect()));
                }
                Err(e) if is_fatal(&e) => {
                    session.mark_failed();
                    return Err(e);
                }
                Err(e) => run.history.push(Observation {
                    round,
                    kind: "error",
                    detail: json!({"sql": sql, "error": e.body()}),
                }),
            }
        }

        if plan.answer.is_some() || plan.finish {
            run.answer = plan.answer;
            run.finished = true;
        } else if plan.is_empty() {
            return Err(BridgeError::Planning(
                "planner returned neither actions nor an answer".to_string(),
            ));
        }
        Ok(())
    }

    async fn record_call(
        &self,
        session: &SessionContext,
        round: u32,
        report: CallReport,
        run: &mut QueryRun,
    ) {
        let mut detail = json!({
            "id": report.id,
            "call": report.call,
            "ok": report.ok,
        });
        match (&report.ingestion, &report.error) {
            (Some(ingestion), _) => {
                detail["ingestion"] = json!(ingestion);
                match self.table_view(session, ingestion).await {
                    Ok(view) => detail["data"] = view,
                    Err(e) => detail["error"] = json!(e.body()),
                }
            }
            (None, Some(error)) => {
                detail["error"] = json!(error);
                run.call_errors.push(CallErrorReport {
                    id: report.id.clone(),
                    call: report.call.describe(),
                    error: error.clone(),
                });
            }
            (None, None) => {}
        }
        run.history.push(Observation {
            round,
            kind: "call",
            detail,
        });

        let sent = report.ok
            || !matches!(
                report.error.as_ref().map(|e| e.kind),
                Some(ErrorKind::PolicyDenied | ErrorKind::PlanningError)
            );
        if sent {
            run.sent.push(report.call);
        }
        if let Some(payload) = report.payload {
            run.last_data = Some(payload);
        }
    }

    fn finish_query(
        &self,
        binding: &RequestBinding,
        run: QueryRun,
        outcome: std::result::Result<Result<()>, tokio::time::error::Elapsed>,
    ) -> QueryResponse {
        let progress = format!("round {}/{}", run.round, self.settings.max_plan_rounds);
        let mut response = QueryResponse {
            call_errors: run.call_errors,
            ..QueryResponse::default()
        };
        match binding.api_kind {
            ApiKind::Graphql => {
                response.queries = Some(
                    run.sent
                        .iter()
                        .filter_map(|c| match c {
                            CallSpec::Graphql(g) => Some(g.query.clone()),
                            CallSpec::Rest(_) => None,
                        })
                        .collect(),
                );
            }
            ApiKind::Rest => {
                response.api_calls = Some(
                    run.sent
                        .iter()
                        .filter_map(|c| match c {
                            CallSpec::Rest(r) => Some(api_call_entry(r)),
                            CallSpec::Graphql(_) => None,
                        })
                        .collect(),
                );
            }
        }

        let has_data = run.last_data.is_some();
        let partial = |what: &str| Some(Value::String(format!("[Partial - {progress}] {what}")));
        match outcome {
            Ok(Ok(())) if run.finished => {
                response.ok = true;
                response.data = run
                    .answer
                    .map(Value::String)
                    .or_else(|| run.last_data.clone());
            }
            Ok(Ok(())) if has_data => {
                response.ok = true;
                response.data = partial("Max rounds exceeded but data retrieved.");
            }
            Ok(Ok(())) => {
                response.error = Some(
                    BridgeError::Planning(format!(
                        "Max rounds exceeded ({progress}), no data retrieved"
                    ))
                    .body(),
                );
            }
            Ok(Err(e)) if has_data && e.kind() != ErrorKind::Cancelled => {
                tracing::warn!(error = %e, "planning stopped early, returning partial data");
                response.ok = true;
                response.data = partial("Data retrieved but planning did not complete.");
            }
            Ok(Err(e)) => response.error = Some(e.body()),
            Err(_) => {
                let secs = self.settings.plan_timeout.as_secs_f64();
                tracing::warn!(secs, "plan timed out");
                response.incomplete = true;
                if has_data {
                    response.ok = true;
                    response.data = partial(&format!("Plan timed out after {secs:.0}s but data retrieved."));
                } else {
                    response.error = Some(
                        BridgeError::Planning(format!(
                            "plan timed out after {secs:.0}s, no data retrieved"
                        ))
                        .body(),
                    );
                }
            }
        }
        if binding.include_result {
            response.result = run.last_data;
        }
        response
    }
}

fn api_call_entry(call: &RestCall) -> Value {
    let mut entry = Map::new();
    entry.insert("method".to_string(), Value::String(call.method.to_ascii_uppercase()));
    entry.insert("path".to_string(), Value::String(call.path.clone()));
    if !call.path_params.is_empty() {
        entry.insert("pathParams".to_string(), Value::Object(call.path_params.clone()));
    }
    if !call.query_params.is_empty() {
        entry.insert("query".to_string(), Value::Object(call.query_params.clone()));
    }
    if let Some(body) = &call.body {
        entry.insert("body".to_string(), body.clone());
    }
    Value::Object(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_call_entries_omit_empty_parts() {
        let CallSpec::Rest(mut call) = CallSpec::rest("get", "/users/{id}") else {
            panic!("expected REST call");
        };
        assert_eq!(
            api_call_entry(&call),
            json!({"method": "GET", "path": "/users/{id}"})
        );
        call.path_params.insert("id".to_string(), json!(7));
        call.query_params.insert("fields".to_string(), json!("name"));
        assert_eq!(
            api_call_entry(&call),
            json!({"method": "GET", "path": "/users/{id}", "pathParams": {"id": 7}, "query": {"fields": "name"}})
        );
    }

    #[test]
    fn execute_requests_accept_poll_options() {
        let req: ExecuteRequest = serde_json::from_value(json!({
            "call": {"method": "POST", "path": "/jobs"},
            "poll": {"doneField": "status", "doneValue": "done"}
        }))
        .expect("request");
        let poll = req.poll.expect("poll");
        assert_eq!(poll.done_field.as_deref(), Some("status"));

        let response = QueryResponse::failed(&BridgeError::Planning("no planner configured".to_string()));
        let v = serde_json::to_value(&response).expect("serialize");
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["kind"], "PlanningError");
        assert!(v.get("incomplete").is_none());
        assert!(v.get("callErrors").is_none());
    }
}
