mod common;

use anyhow::Context as _;
use common::{
    CHARACTER_PAGES, CHARACTERS_PER_PAGE, Hits, MockServer, ScriptedPlanner, binding, character,
    graphql_api, rest_api, settings,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use unrelated_api_bridge::error::ErrorKind;
use unrelated_api_bridge::ops::{Bridge, ExecuteRequest};
use unrelated_api_bridge::planner::Planner;
use unrelated_api_bridge::poll::PollSettings;
use unrelated_api_descriptor::capability::ApiKind;
use unrelated_http_tools::call::CallSpec;

fn page_call(id: &str, page: u64) -> Value {
    json!({
        "id": id,
        "call": {"query": format!("{{ characters(page: {page}) {{ info {{ next }} results {{ id name episodeCount }} }} }}")}
    })
}

fn bridge_with(planner: Arc<ScriptedPlanner>) -> anyhow::Result<Bridge> {
    let planner: Arc<dyn Planner> = planner;
    Bridge::new(settings(), Some(planner)).context("build bridge")
}

#[tokio::test]
async fn graphql_pagination_then_top_five_by_sql() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(graphql_api(hits.clone())).await?;

    let sql = "SELECT name, episodeCount FROM characters ORDER BY episodeCount DESC, id ASC LIMIT 5";
    let planner = ScriptedPlanner::new(vec![
        json!({"calls": [page_call("p1", 1)]}),
        json!({"calls": [page_call("p2", 2), page_call("p3", 3)]}),
        json!({"sql": sql, "answer": "Here are the five characters with the most episodes."}),
    ]);
    let bridge = bridge_with(planner.clone())?;
    let mut target = binding(ApiKind::Graphql, &mock.url("/graphql"));
    target.include_result = true;

    let response = bridge
        .query(&target, "Top 5 characters by episode count?", &CancellationToken::new())
        .await;

    assert!(response.ok, "query failed: {:?}", response.error);
    assert_eq!(
        response.data,
        Some(json!("Here are the five characters with the most episodes."))
    );
    let queries = response.queries.context("queries")?;
    assert_eq!(queries.len(), 3);
    assert!(queries[0].contains("characters(page: 1)"));
    assert!(response.api_calls.is_none());
    assert!(response.call_errors.is_empty());

    let mut all: Vec<Value> = (1..=CHARACTER_PAGES * CHARACTERS_PER_PAGE).map(character).collect();
    all.sort_by(|a, b| {
        b["episodeCount"]
            .as_u64()
            .cmp(&a["episodeCount"].as_u64())
            .then(a["id"].as_u64().cmp(&b["id"].as_u64()))
    });
    let expected: Vec<Value> = all
        .iter()
        .take(5)
        .map(|c| json!({"name": c["name"], "episodeCount": c["episodeCount"]}))
        .collect();
    assert_eq!(response.result, Some(Value::Array(expected)));

    assert_eq!(Hits::get(&hits.introspection), 1);
    assert_eq!(Hits::get(&hits.graphql), 3);

    let requests = planner.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0]["apiKind"], "graphql");
    assert!(
        requests[0]["schemaContext"]
            .as_str()
            .is_some_and(|s| s.contains("characters"))
    );
    let history = requests[1]["history"].as_array().context("history")?;
    assert_eq!(history[0]["kind"], "call");
    assert_eq!(history[0]["detail"]["ok"], true);
    assert_eq!(history[0]["detail"]["ingestion"]["table"], "characters");
    assert_eq!(requests[2]["history"].as_array().map(Vec::len), Some(3));

    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rest_delete_is_denied_without_reaching_the_target() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let planner = ScriptedPlanner::new(vec![
        json!({"calls": [{"id": "del", "call": {"method": "DELETE", "path": "/users/1"}}]}),
        json!({"answer": "Deleting users is not permitted.", "finish": true}),
    ]);
    let bridge = bridge_with(planner)?;
    let target = binding(ApiKind::Rest, &mock.url("/openapi.json"));
    let cancel = CancellationToken::new();

    let response = bridge
        .execute(&target, CallSpec::rest("DELETE", "/users/1").into(), &cancel)
        .await;
    assert!(!response.ok);
    let error = response.error.context("error body")?;
    assert_eq!(error.kind, ErrorKind::PolicyDenied);
    assert!(error.message.contains("not allowed"), "{}", error.message);

    let response = bridge.query(&target, "Delete user 1", &cancel).await;
    assert!(response.ok);
    assert_eq!(response.api_calls, Some(Vec::new()));
    assert_eq!(response.call_errors.len(), 1);
    assert_eq!(response.call_errors[0].id, "del");
    assert_eq!(response.call_errors[0].call, "DELETE /users/1");
    assert_eq!(response.call_errors[0].error.kind, ErrorKind::PolicyDenied);

    assert_eq!(Hits::get(&hits.users), 0);
    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn accepted_job_is_polled_until_done() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let bridge = Bridge::new(settings(), None).context("build bridge")?;
    let mut target = binding(ApiKind::Rest, &mock.url("/openapi.json"));
    target.allow_unsafe_paths = vec!["/jobs".to_string()];
    target.poll_paths = vec!["/jobs/*".to_string()];
    target.include_result = true;

    let response = bridge
        .execute(
            &target,
            CallSpec::rest("POST", "/jobs").into(),
            &CancellationToken::new(),
        )
        .await;

    assert!(response.ok, "execute failed: {:?}", response.error);
    assert_eq!(Hits::get(&hits.job_gets), 3);
    let data = response.data.context("data")?;
    assert_eq!(data["table"], "post_jobs");
    assert_eq!(data["rows"], 2);
    assert_eq!(data["data"][0]["city"], "Paris");
    let result = response.result.context("raw result")?;
    assert_eq!(result["status"], "done");

    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn polling_stops_at_the_duration_bound() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let mut config = settings();
    config.poll = PollSettings {
        initial_interval: Duration::from_millis(50),
        backoff_coefficient: 1.0,
        max_interval: Duration::from_millis(50),
        max_duration: Duration::from_millis(300),
        max_polls: 1_000,
    };
    let bridge = Bridge::new(config, None).context("build bridge")?;
    let mut target = binding(ApiKind::Rest, &mock.url("/openapi.json"));
    target.allow_unsafe_paths = vec!["/stuck-jobs".to_string()];
    target.poll_paths = vec!["/jobs/*".to_string()];

    let started = Instant::now();
    let response = bridge
        .execute(
            &target,
            CallSpec::rest("POST", "/stuck-jobs").into(),
            &CancellationToken::new(),
        )
        .await;
    let elapsed = started.elapsed();

    assert!(!response.ok);
    assert_eq!(response.error.context("error body")?.kind, ErrorKind::PollTimeout);
    assert!(Hits::get(&hits.job_gets) >= 1);
    assert!(elapsed < Duration::from_millis(1_500), "took {elapsed:?}");

    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_first_calls_resolve_the_target_once() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let bridge = Bridge::new(settings(), None).context("build bridge")?;
    let target = binding(ApiKind::Rest, &mock.url("/openapi.json"));
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        bridge.execute(&target, CallSpec::rest("GET", "/users/1").into(), &cancel),
        bridge.execute(&target, CallSpec::rest("GET", "/users/2").into(), &cancel),
    );

    assert!(first.ok, "first failed: {:?}", first.error);
    assert!(second.ok, "second failed: {:?}", second.error);
    assert_eq!(Hits::get(&hits.spec), 1);
    assert_eq!(Hits::get(&hits.users), 2);
    assert_eq!(bridge.sessions().len(), 1);

    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn later_payloads_widen_the_table() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let bridge = Bridge::new(settings(), None).context("build bridge")?;
    let target = binding(ApiKind::Rest, &mock.url("/openapi.json"));
    let cancel = CancellationToken::new();

    let first = bridge
        .execute(&target, CallSpec::rest("GET", "/users/1").into(), &cancel)
        .await;
    assert!(first.ok, "first failed: {:?}", first.error);
    assert!(first.result.is_none());

    let request: ExecuteRequest = serde_json::from_value(json!({
        "call": {"method": "GET", "path": "/users/{id}", "pathParams": {"id": 2}}
    }))?;
    let second = bridge.execute(&target, request, &cancel).await;
    assert!(second.ok, "second failed: {:?}", second.error);
    let data = second.data.context("data")?;
    assert_eq!(data["table"], "get_users_id");
    assert_eq!(data["rows"], 2);

    let session = bridge.sessions().get_or_create(&target).await?;
    let schema = session
        .store
        .schema("get_users_id")
        .await
        .context("table schema")?
        .describe();
    assert!(schema.contains("score REAL"), "{schema}");
    assert!(schema.contains("email TEXT"), "{schema}");

    let rows = session
        .store
        .run_sql("SELECT SUM(score) AS total, COUNT(email) AS with_email FROM get_users_id")
        .await?;
    assert_eq!(rows[0]["total"], json!(17.5));
    assert_eq!(rows[0]["with_email"], json!(1));

    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn created_job_without_location_is_polled_by_id() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let bridge = Bridge::new(settings(), None).context("build bridge")?;
    let mut target = binding(ApiKind::Rest, &mock.url("/openapi.json"));
    target.allow_unsafe_paths = vec!["/reports".to_string()];
    target.poll_paths = vec!["/reports/*".to_string()];
    target.include_result = true;

    let response = bridge
        .execute(
            &target,
            CallSpec::rest("POST", "/reports").into(),
            &CancellationToken::new(),
        )
        .await;

    assert!(response.ok, "execute failed: {:?}", response.error);
    assert_eq!(Hits::get(&hits.report_gets), 3);
    let data = response.data.context("data")?;
    assert_eq!(data["table"], "post_reports");
    assert_eq!(data["rows"], 1);
    assert_eq!(data["data"][0]["region"], "eu");
    assert_eq!(response.result.context("raw result")?["status"], "done");

    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn failed_call_keeps_sibling_data() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let planner = ScriptedPlanner::new(vec![
        json!({"calls": [
            {"id": "user", "call": {"method": "GET", "path": "/users/1"}},
            {"id": "broken", "call": {"method": "GET", "path": "/broken"}}
        ]}),
        json!({"finish": true}),
    ]);
    let bridge = bridge_with(planner)?;
    let mut target = binding(ApiKind::Rest, &mock.url("/openapi.json"));
    target.include_result = true;

    let response = bridge
        .query(&target, "Who is user 1?", &CancellationToken::new())
        .await;

    assert!(response.ok, "query failed: {:?}", response.error);
    assert_eq!(response.call_errors.len(), 1);
    assert_eq!(response.call_errors[0].id, "broken");
    assert_eq!(response.call_errors[0].error.kind, ErrorKind::UpstreamError);
    assert_eq!(response.api_calls.map(|c| c.len()), Some(2));
    let data = response.data.context("data")?;
    assert_eq!(data["name"], "Rick");
    assert_eq!(response.result, Some(data));

    mock.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn plan_timeout_returns_partial_data() -> anyhow::Result<()> {
    let hits = Arc::new(Hits::default());
    let mock = MockServer::start(rest_api(hits.clone())).await?;
    let planner = ScriptedPlanner::new(vec![
        json!({"calls": [{"id": "user", "call": {"method": "GET", "path": "/users/1"}}]}),
        json!({"calls": [{"id": "late", "call": {"method": "GET", "path": "/slow"}}]}),
        json!({"answer": "unreachable"}),
    ]);
    let planner: Arc<dyn Planner> = planner;
    let mut config = settings();
    config.plan_timeout = Duration::from_secs(1);
    let bridge = Bridge::new(config, Some(planner)).context("build bridge")?;
    let target = binding(ApiKind::Rest, &mock.url("/openapi.json"));

    let started = Instant::now();
    let response = bridge
        .query(&target, "Everything about user 1", &CancellationToken::new())
        .await;

    assert!(started.elapsed() < Duration::from_millis(2_500));
    assert!(response.ok, "query failed: {:?}", response.error);
    assert!(response.incomplete);
    let message = response.data.context("data")?;
    let message = message.as_str().context("partial message")?;
    assert!(message.starts_with("[Partial - round 2/5]"), "{message}");
    assert!(message.contains("timed out"), "{message}");

    mock.shutdown().await;
    Ok(())
}
