mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::{fast_settings, memory_queue, FakePersistence, FakeRenderer, RenderMode};
use serp_tracker::api::{router, AppState};
use serp_tracker::config::QueueSettings;
use serp_tracker::queue::{DegradedQueue, SerpQueue};
use serp_tracker::worker::Pipeline;

struct TestApp {
    app: Router,
    queue: SerpQueue,
    persistence: Arc<FakePersistence>,
}

/// Router over a memory queue whose jobs stay delayed for a minute.
async fn test_app() -> TestApp {
    let renderer = FakeRenderer::new(RenderMode::Serp, Duration::ZERO);
    let persistence = FakePersistence::new(
        &["pizza delivery", "pizza near me", "late night pizza"],
        &["Manhattan, NY", "Brooklyn, NY"],
    );
    let settings = QueueSettings {
        max_initial_delay: Duration::from_secs(60),
        ..fast_settings()
    };
    let queue = SerpQueue::Active(memory_queue(settings, renderer.clone(), persistence.clone()).await);

    let state = Arc::new(AppState {
        queue: queue.clone(),
        pipeline: Arc::new(Pipeline::new(renderer, persistence.clone())),
        persistence: persistence.clone(),
    });

    TestApp {
        app: router(state),
        queue,
        persistence,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn track_returns_job_id_and_shows_up_in_stats() {
    let t = test_app().await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/serp/track",
        Some(json!({"keyword": "pizza delivery", "location": {"name": "Manhattan, NY"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let job_id = body["jobId"].as_str().unwrap().to_string();
    assert!(!job_id.is_empty());

    let (status, body) = send(&t.app, "GET", "/api/serp/queue-stats", None).await;
    assert_eq!(status, StatusCode::OK);
    let stats = &body["stats"];
    let pending = stats["waiting"].as_u64().unwrap() + stats["active"].as_u64().unwrap();
    assert!(pending >= 1);

    let (status, body) = send(&t.app, "GET", &format!("/api/serp/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["payload"]["keyword"], "pizza delivery");

    t.queue.close().await;
}

#[tokio::test]
async fn track_rejects_blank_keyword() {
    let t = test_app().await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/serp/track",
        Some(json!({"keyword": "  ", "location": "Manhattan, NY"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(t.queue.stats().await.waiting, 0);

    t.queue.close().await;
}

#[tokio::test]
async fn test_search_with_empty_keyword_is_rejected_and_enqueues_nothing() {
    let t = test_app().await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/serp/test-search",
        Some(json!({"keyword": "", "location": {"name": "Manhattan, NY"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("required"));

    let stats = t.queue.stats().await;
    assert_eq!(stats.waiting + stats.active + stats.completed + stats.failed, 0);

    t.queue.close().await;
}

#[tokio::test]
async fn test_search_returns_parsed_results() {
    let t = test_app().await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/serp/test-search",
        Some(json!({"keyword": "pizza delivery", "location": "Manhattan, NY"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["degraded"], false);
    assert_eq!(body["results"]["location"], "Manhattan, NY");
    assert_eq!(body["results"]["organic"][0]["position"], 1);
    assert_eq!(body["results"]["organic"][0]["domain"], "joespizza.example");

    t.queue.close().await;
}

#[tokio::test]
async fn schedule_all_enqueues_one_job_per_pair() {
    let t = test_app().await;

    let uri = format!("/api/serp/schedule-all/{}", t.persistence.client_id);
    let (status, body) = send(&t.app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["jobCount"], 6);

    t.queue.close().await;
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let t = test_app().await;

    let (status, body) = send(&t.app, "GET", "/api/serp/jobs/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    t.queue.close().await;
}

#[tokio::test]
async fn tracking_routes_return_data_arrays() {
    let t = test_app().await;

    let uri = format!(
        "/api/tracking/results/{}?from=2026-10-01&to=2026-10-16",
        t.persistence.client_id
    );
    let (status, body) = send(&t.app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_array());

    let uri = format!(
        "/api/tracking/trends/{}/{}",
        uuid::Uuid::new_v4(),
        uuid::Uuid::new_v4()
    );
    let (status, body) = send(&t.app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_array());

    t.queue.close().await;
}

#[tokio::test]
async fn degraded_queue_still_hands_out_job_ids() {
    let renderer = FakeRenderer::new(RenderMode::Serp, Duration::ZERO);
    let persistence = FakePersistence::new(&[], &[]);
    let state = Arc::new(AppState {
        queue: SerpQueue::Degraded(DegradedQueue::new("redis unreachable")),
        pipeline: Arc::new(Pipeline::new(renderer, persistence.clone())),
        persistence,
    });
    let app = router(state);

    let (status, body) = send(
        &app,
        "POST",
        "/api/serp/track",
        Some(json!({"keyword": "pizza delivery", "location": "Manhattan, NY"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["jobId"].as_str().unwrap().starts_with("degraded-"));

    let (_, body) = send(&app, "GET", "/api/health", None).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue"], "degraded");

    let (_, body) = send(&app, "GET", "/api/serp/queue-stats", None).await;
    assert_eq!(body["stats"]["waiting"], 0);
    assert_eq!(body["stats"]["error"], "redis unreachable");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let t = test_app().await;

    let (status, body) = send(&t.app, "GET", "/api-docs/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/serp/track"].is_object());

    t.queue.close().await;
}
