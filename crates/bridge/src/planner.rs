//! Planner seam: the external reasoning collaborator that turns a question into calls and SQL.
//!
//! The bridge never interprets questions itself. Each round it sends the question, the schema
//! context and the observations so far, and receives a [`Plan`].

use crate::error::{BridgeError, Result};
use crate::poll::PollOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use unrelated_api_descriptor::capability::ApiKind;
use unrelated_api_descriptor::search::SearchOptions;
use unrelated_http_tools::call::CallSpec;
use unrelated_http_tools::safety::sanitize_reqwest_error;

/// One call in a plan. `id` is how dependents reference its payload (`${id.path}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedCall {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub call: CallSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaSearch {
    pub pattern: String,
    #[serde(flatten)]
    pub options: SearchOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Plan {
    pub calls: Vec<PlannedCall>,
    pub searches: Vec<SchemaSearch>,
    /// Read-only SQL over the session store.
    pub sql: Option<String>,
    /// Final natural-language answer, if the planner has one.
    pub answer: Option<String>,
    /// No further rounds are needed.
    pub finish: bool,
}

impl Plan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.searches.is_empty() && self.sql.is_none()
    }
}

/// What happened in a previous round, fed back to the planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub round: u32,
    /// `search`, `call`, `sql` or `error`.
    pub kind: &'static str,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest<'a> {
    pub question: &'a str,
    pub api_kind: ApiKind,
    pub schema_context: &'a str,
    pub current_date: String,
    pub round: u32,
    pub max_rounds: u32,
    pub history: &'a [Observation],
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce the next plan for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Planning`] when no usable plan can be produced.
    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Plan>;
}

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

/// Planner reached over HTTP: `POST <url>` with the [`PlanRequest`] and model as JSON.
pub struct RemotePlanner {
    client: reqwest::Client,
    settings: PlannerSettings,
}

impl RemotePlanner {
    #[must_use]
    pub fn new(client: reqwest::Client, settings: PlannerSettings) -> Self {
        Self { client, settings }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.settings.model
    }
}

#[derive(Serialize)]
struct RemotePlanBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a PlanRequest<'a>,
}

#[async_trait]
impl Planner for RemotePlanner {
    async fn plan(&self, request: &PlanRequest<'_>) -> Result<Plan> {
        let mut req = self
            .client
            .post(&self.settings.url)
            .timeout(self.settings.timeout)
            .json(&RemotePlanBody {
                model: &self.settings.model,
                request,
            });
        if let Some(key) = &self.settings.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| {
            BridgeError::Planning(format!(
                "planner request failed: {}",
                sanitize_reqwest_error(&e)
            ))
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(300).collect();
            return Err(BridgeError::Planning(format!(
                "planner returned {status}: {body}"
            )));
        }
        let plan: Plan = resp.json().await.map_err(|e| {
            BridgeError::Planning(format!("invalid plan: {}", sanitize_reqwest_error(&e)))
        })?;
        tracing::debug!(
            round = request.round,
            calls = plan.calls.len(),
            searches = plan.searches.len(),
            sql = plan.sql.is_some(),
            finish = plan.finish,
            "plan received"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn spawn(router: Router) -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await;
        });
        (format!("http://{addr}/plan"), tx)
    }

    fn planner(url: String) -> RemotePlanner {
        RemotePlanner::new(
            reqwest::Client::new(),
            PlannerSettings {
                url,
                api_key: Some("sk-test".to_string()),
                model: "planner-small".to_string(),
                timeout: Duration::from_secs(5),
            },
        )
    }

    fn request<'a>(history: &'a [Observation]) -> PlanRequest<'a> {
        PlanRequest {
            question: "top 5 characters",
            api_kind: ApiKind::Graphql,
            schema_context: "<queries>\ncharacters(page: Int) -> Characters",
            current_date: "2026-01-01".to_string(),
            round: 1,
            max_rounds: 5,
            history,
        }
    }

    #[tokio::test]
    async fn posts_request_with_bearer_and_parses_plan() {
        let router = Router::new().route(
            "/plan",
            post(|headers: HeaderMap, axum::Json(body): axum::Json<Value>| async move {
                assert_eq!(
                    headers.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer sk-test")
                );
                assert_eq!(body["apiKind"], "graphql");
                assert_eq!(body["maxRounds"], 5);
                assert_eq!(body["model"], "planner-small");
                axum::Json(json!({
                    "calls": [{"id": "page1", "call": {"query": "{ characters(page: 1) { results { id } } }"}}],
                    "searches": [{"pattern": "Character", "context": 2}],
                    "finish": false
                }))
            }),
        );
        let (url, shutdown) = spawn(router).await;

        let plan = planner(url).plan(&request(&[])).await.expect("plan");
        assert_eq!(plan.calls.len(), 1);
        assert!(matches!(plan.calls[0].call, CallSpec::Graphql(_)));
        assert_eq!(plan.searches[0].options.context, 2);
        assert!(!plan.finish);
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn non_success_is_a_planning_error() {
        let router = Router::new().route(
            "/plan",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream model unavailable") }),
        );
        let (url, shutdown) = spawn(router).await;

        let err = planner(url).plan(&request(&[])).await.expect_err("error");
        assert!(matches!(err, BridgeError::Planning(_)));
        assert!(err.to_string().contains("502"));
        let _ = shutdown.send(());
    }
}
