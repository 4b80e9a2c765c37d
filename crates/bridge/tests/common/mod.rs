#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use unrelated_api_bridge::binding::RequestBinding;
use unrelated_api_bridge::config::BridgeSettings;
use unrelated_api_bridge::error::{BridgeError, Result};
use unrelated_api_bridge::planner::{Plan, PlanRequest, Planner};
use unrelated_api_bridge::poll::PollSettings;
use unrelated_api_descriptor::capability::ApiKind;
use unrelated_http_tools::retry::RetryPolicy;
use unrelated_http_tools::safety::OutboundHttpSafety;

pub use unrelated_test_support::{KillOnDrop, MockServer, pick_unused_port, wait_http_ok};

pub const CHARACTER_PAGES: u64 = 3;
pub const CHARACTERS_PER_PAGE: u64 = 20;

/// Loopback-friendly settings with fast polling and no retries.
pub fn settings() -> BridgeSettings {
    BridgeSettings {
        call_timeout: Duration::from_secs(5),
        retry: RetryPolicy::none(),
        plan_timeout: Duration::from_secs(20),
        max_plan_rounds: 5,
        poll: PollSettings {
            initial_interval: Duration::from_millis(30),
            backoff_coefficient: 1.5,
            max_interval: Duration::from_millis(100),
            max_duration: Duration::from_secs(5),
            max_polls: 20,
        },
        safety: OutboundHttpSafety::permissive(),
        ..BridgeSettings::default()
    }
}

pub fn binding(kind: ApiKind, target_url: &str) -> RequestBinding {
    RequestBinding {
        target_url: target_url.to_string(),
        api_kind: kind,
        target_headers: BTreeMap::new(),
        api_name: None,
        base_url: None,
        allow_unsafe_paths: Vec::new(),
        poll_paths: Vec::new(),
        include_result: false,
    }
}

/// Planner that replays canned plans and records every request it saw.
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Value>>,
    requests: Mutex<Vec<Value>>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Plan> {
        let recorded = serde_json::to_value(request).map_err(|e| BridgeError::Planning(e.to_string()))?;
        self.requests.lock().push(recorded);
        let next = self
            .plans
            .lock()
            .pop_front()
            .ok_or_else(|| BridgeError::Planning("script exhausted".to_string()))?;
        serde_json::from_value(next).map_err(|e| BridgeError::Planning(e.to_string()))
    }
}

#[derive(Default)]
pub struct Hits {
    pub introspection: AtomicUsize,
    pub spec: AtomicUsize,
    pub graphql: AtomicUsize,
    pub users: AtomicUsize,
    pub job_gets: AtomicUsize,
    pub report_gets: AtomicUsize,
}

impl Hits {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub fn episode_count(id: u64) -> u64 {
    (id * 37) % 41
}

pub fn character(id: u64) -> Value {
    json!({"id": id, "name": format!("Character {id}"), "episodeCount": episode_count(id)})
}

fn page_arg(query: &str) -> u64 {
    query
        .split_once("page:")
        .map(|(_, rest)| {
            rest.trim_start()
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(1)
}

fn introspection() -> Value {
    let scalar = |name: &str| json!({"kind": "SCALAR", "name": name, "ofType": null});
    json!({"data": {"__schema": {
        "queryType": {
            "name": "Query",
            "fields": [{
                "name": "characters",
                "description": "Paginated characters",
                "args": [{"name": "page", "type": scalar("Int"), "defaultValue": null}],
                "type": {"kind": "OBJECT", "name": "Characters", "ofType": null}
            }]
        },
        "mutationType": null,
        "subscriptionType": null,
        "types": [
            {"name": "Query", "kind": "OBJECT", "fields": []},
            {"name": "Characters", "kind": "OBJECT", "fields": [
                {"name": "info", "args": [], "type": {"kind": "OBJECT", "name": "Info", "ofType": null}},
                {"name": "results", "args": [], "type": {"kind": "LIST", "name": null,
                    "ofType": {"kind": "OBJECT", "name": "Character", "ofType": null}}}
            ]},
            {"name": "Info", "kind": "OBJECT", "fields": [
                {"name": "pages", "args": [], "type": scalar("Int")},
                {"name": "next", "args": [], "type": scalar("Int")}
            ]},
            {"name": "Character", "kind": "OBJECT", "fields": [
                {"name": "id", "args": [], "type": scalar("ID")},
                {"name": "name", "args": [], "type": scalar("String")},
                {"name": "episodeCount", "args": [], "type": scalar("Int")}
            ]}
        ]
    }}})
}

async fn graphql(State(hits): State<Arc<Hits>>, Json(body): Json<Value>) -> Json<Value> {
    let query = body.get("query").and_then(Value::as_str).unwrap_or_default();
    if query.contains("__schema") {
        hits.introspection.fetch_add(1, Ordering::SeqCst);
        return Json(introspection());
    }
    hits.graphql.fetch_add(1, Ordering::SeqCst);
    let page = page_arg(query).clamp(1, CHARACTER_PAGES);
    let first = (page - 1) * CHARACTERS_PER_PAGE + 1;
    let results: Vec<Value> = (first..first + CHARACTERS_PER_PAGE).map(character).collect();
    let next = (page < CHARACTER_PAGES).then_some(page + 1);
    Json(json!({"data": {"characters": {
        "info": {"pages": CHARACTER_PAGES, "next": next},
        "results": results
    }}}))
}

/// GraphQL API at `/graphql` serving introspection and `characters(page)`.
pub fn graphql_api(hits: Arc<Hits>) -> Router {
    Router::new().route("/graphql", post(graphql)).with_state(hits)
}

fn openapi_spec() -> Value {
    let id_param = json!([{"name": "id", "in": "path", "required": true, "schema": {"type": "string"}}]);
    let ok = |description: &str| json!({"200": {"description": description}});
    json!({
        "openapi": "3.0.3",
        "info": {"title": "Users API", "version": "1.0.0"},
        "servers": [{"url": "/"}],
        "paths": {
            "/users/{id}": {
                "get": {"summary": "Fetch a user", "parameters": id_param, "responses": ok("user")},
                "delete": {"summary": "Delete a user", "parameters": id_param, "responses": ok("deleted")}
            },
            "/jobs": {
                "post": {"summary": "Start a report job", "responses": {"202": {"description": "accepted"}}}
            },
            "/jobs/{id}": {
                "get": {"summary": "Job status", "parameters": id_param, "responses": ok("job")}
            }
        }
    })
}

async fn spec(State(hits): State<Arc<Hits>>) -> Json<Value> {
    hits.spec.fetch_add(1, Ordering::SeqCst);
    Json(openapi_spec())
}

async fn user(State(hits): State<Arc<Hits>>, Path(id): Path<String>) -> Json<Value> {
    hits.users.fetch_add(1, Ordering::SeqCst);
    match id.as_str() {
        "1" => Json(json!({"id": 1, "name": "Rick", "score": 10})),
        _ => Json(json!({"id": 2, "name": "Morty", "score": 7.5, "email": "morty@example.com"})),
    }
}

async fn delete_user(State(hits): State<Arc<Hits>>, Path(_id): Path<String>) -> StatusCode {
    hits.users.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn start_job() -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, "/jobs/j1")],
        Json(json!({"id": "j1", "status": "queued"})),
    )
}

async fn start_stuck_job() -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, "/jobs/stuck")],
        Json(json!({"id": "stuck", "status": "queued"})),
    )
}

/// `j1` is running for two checks and then done; `stuck` never finishes.
async fn job(State(hits): State<Arc<Hits>>, Path(id): Path<String>) -> Json<Value> {
    let n = hits.job_gets.fetch_add(1, Ordering::SeqCst);
    if id == "j1" && n >= 2 {
        Json(json!({"id": "j1", "status": "done", "rows": [
            {"city": "Paris", "temp": 21.5},
            {"city": "Oslo", "temp": 12}
        ]}))
    } else {
        Json(json!({"id": id, "status": "running"}))
    }
}

async fn start_report() -> impl IntoResponse {
    (StatusCode::ACCEPTED, Json(json!({"id": 42, "status": "pending"})))
}

/// Report `42` is pending for two checks and then done.
async fn report(State(hits): State<Arc<Hits>>, Path(id): Path<String>) -> Json<Value> {
    let n = hits.report_gets.fetch_add(1, Ordering::SeqCst);
    if n >= 2 {
        Json(json!({"id": id, "status": "done", "rows": [{"region": "eu", "total": 3}]}))
    } else {
        Json(json!({"id": id, "status": "pending"}))
    }
}

async fn broken() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "database unavailable"})))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!([{"late": true}]))
}

/// REST API with its OpenAPI document at `/openapi.json`.
pub fn rest_api(hits: Arc<Hits>) -> Router {
    Router::new()
        .route("/openapi.json", get(spec))
        .route("/users/{id}", get(user).delete(delete_user))
        .route("/jobs", post(start_job))
        .route("/stuck-jobs", post(start_stuck_job))
        .route("/jobs/{id}", get(job))
        .route("/reports", post(start_report))
        .route("/reports/{id}", get(report))
        .route("/broken", get(broken))
        .route("/slow", get(slow))
        .with_state(hits)
}
