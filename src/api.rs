use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::db::PersistenceAdapter;
use crate::error::ApiError;
use crate::models::{Location, RankingFilter, RankingRow, SearchResult, TrendPoint};
use crate::queue::{JobOutcome, JobState, Priority, QueueStats, SerpQueue, TrackingJob};
use crate::worker::{self, Pipeline};

pub struct AppState {
    pub queue: SerpQueue,
    pub pipeline: Arc<Pipeline>,
    pub persistence: Arc<dyn PersistenceAdapter>,
}

/// Location as posted by the dashboard: a bare name or a full object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LocationInput {
    Name(String),
    Detailed(Location),
}

impl From<LocationInput> for Location {
    fn from(input: LocationInput) -> Self {
        match input {
            LocationInput::Name(name) => Location::named(name),
            LocationInput::Detailed(location) => location,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchRequest {
    pub keyword: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub location: Option<LocationInput>,
}

#[derive(Serialize, ToSchema)]
pub struct SearchResponse {
    pub success: bool,
    pub degraded: bool,
    pub results: SearchResult,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackRequest {
    pub keyword_id: Option<Uuid>,
    pub keyword: Option<String>,
    pub location_id: Option<Uuid>,
    #[schema(value_type = Option<Object>)]
    pub location: Option<LocationInput>,
    pub client_id: Option<Uuid>,
    pub priority: Option<Priority>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackResponse {
    pub success: bool,
    pub job_id: String,
    pub priority: Priority,
    pub delay_ms: u64,
}

#[derive(Serialize, ToSchema)]
pub struct StatsResponse {
    pub success: bool,
    pub stats: QueueStats,
}

#[derive(Serialize, ToSchema)]
pub struct JobResponse {
    pub success: bool,
    pub job: TrackingJob,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub success: bool,
    pub job_count: usize,
}

#[derive(Serialize, ToSchema)]
pub struct RankingRowsResponse {
    pub success: bool,
    pub data: Vec<RankingRow>,
}

#[derive(Serialize, ToSchema)]
pub struct TrendResponse {
    pub success: bool,
    pub data: Vec<TrendPoint>,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub queue: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        test_search,
        track_keyword,
        queue_stats,
        get_job,
        schedule_all,
        tracking_results,
        ranking_trend,
        health
    ),
    components(
        schemas(
            SearchRequest,
            SearchResponse,
            TrackRequest,
            TrackResponse,
            StatsResponse,
            JobResponse,
            ScheduleResponse,
            RankingRowsResponse,
            TrendResponse,
            HealthResponse,
            Location,
            SearchResult,
            crate::models::OrganicResult,
            crate::models::MapPackResult,
            crate::models::TrackingPayload,
            RankingRow,
            TrendPoint,
            QueueStats,
            TrackingJob,
            JobState,
            JobOutcome,
            Priority
        )
    ),
    tags(
        (name = "serp", description = "SERP scraping and job queue"),
        (name = "tracking", description = "Stored ranking history")
    )
)]
pub struct ApiDoc;

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/serp/test-search", post(test_search))
        .route("/serp/track", post(track_keyword))
        .route("/serp/queue-stats", get(queue_stats))
        .route("/serp/jobs/:job_id", get(get_job))
        .route("/serp/schedule-all/:client_id", post(schedule_all))
        .route("/tracking/results/:client_id", get(tracking_results))
        .route("/tracking/trends/:keyword_id/:location_id", get(ranking_trend))
        .route("/health", get(health));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    ApiError::internal("Internal server error", worker::panic_message(&*panic)).into_response()
}

fn required_keyword(keyword: Option<String>) -> Result<String, ApiError> {
    match keyword.map(|k| k.trim().to_string()) {
        Some(k) if !k.is_empty() => Ok(k),
        _ => Err(ApiError::BadRequest("Keyword is required".to_string())),
    }
}

/// Scrape one results page synchronously and return the parsed rankings.
#[utoipa::path(
    post,
    path = "/api/serp/test-search",
    request_body = SearchRequest,
    responses(
        (status = 200, description = "Parsed results page", body = SearchResponse),
        (status = 400, description = "Keyword or location missing"),
        (status = 500, description = "Scrape failed")
    ),
    tag = "serp"
)]
pub async fn test_search(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let keyword = required_keyword(payload.keyword)
        .map_err(|_| ApiError::BadRequest("Keyword and location are required".to_string()))?;
    let location: Location = payload
        .location
        .map(Location::from)
        .filter(|l| l.display_name().is_some())
        .ok_or_else(|| ApiError::BadRequest("Keyword and location are required".to_string()))?;

    info!("🔎 Test search for '{}' in {}", keyword, location.label());
    let extraction = state
        .pipeline
        .search(&keyword, &location)
        .await
        .map_err(|e| ApiError::internal("Search failed", e))?;

    Ok(Json(SearchResponse {
        success: true,
        degraded: extraction.is_degraded(),
        results: extraction.into_result(),
    }))
}

/// Queue a tracking job for one keyword and location.
#[utoipa::path(
    post,
    path = "/api/serp/track",
    request_body = TrackRequest,
    responses(
        (status = 200, description = "Job queued", body = TrackResponse),
        (status = 400, description = "Keyword missing"),
        (status = 500, description = "Job store rejected the job")
    ),
    tag = "serp"
)]
pub async fn track_keyword(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TrackRequest>,
) -> Result<Json<TrackResponse>, ApiError> {
    let keyword = required_keyword(payload.keyword)?;
    let job = crate::models::TrackingPayload {
        keyword_id: payload.keyword_id,
        keyword,
        location_id: payload.location_id,
        location: payload.location.map(Location::from).unwrap_or_default(),
        client_id: payload.client_id,
    };

    let handle = state
        .queue
        .enqueue(job, payload.priority.unwrap_or_default())
        .await
        .map_err(|e| ApiError::internal("Failed to queue tracking job", e))?;

    Ok(Json(TrackResponse {
        success: true,
        job_id: handle.id,
        priority: handle.priority,
        delay_ms: handle.delay_ms,
    }))
}

/// Current job counts. Reports zeros with an error when the store is down.
#[utoipa::path(
    get,
    path = "/api/serp/queue-stats",
    responses((status = 200, description = "Queue counts", body = StatsResponse)),
    tag = "serp"
)]
pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        success: true,
        stats: state.queue.stats().await,
    })
}

#[utoipa::path(
    get,
    path = "/api/serp/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job id returned by track")),
    responses(
        (status = 200, description = "Job record", body = JobResponse),
        (status = 404, description = "Unknown or purged job")
    ),
    tag = "serp"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .queue
        .job(&job_id)
        .await
        .map_err(|e| ApiError::internal("Failed to load job", e))?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))?;

    Ok(Json(JobResponse { success: true, job }))
}

/// Queue one job per keyword × location of the client.
#[utoipa::path(
    post,
    path = "/api/serp/schedule-all/{client_id}",
    params(("client_id" = Uuid, Path, description = "Client id")),
    responses(
        (status = 200, description = "Jobs queued", body = ScheduleResponse),
        (status = 500, description = "Scheduling failed")
    ),
    tag = "serp"
)]
pub async fn schedule_all(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let job_count = state
        .queue
        .schedule_for_client(state.persistence.as_ref(), client_id)
        .await
        .map_err(|e| ApiError::internal("Failed to schedule tracking jobs", e))?;

    info!("📅 Scheduled {} tracking jobs for client {}", job_count, client_id);
    Ok(Json(ScheduleResponse {
        success: true,
        job_count,
    }))
}

#[utoipa::path(
    get,
    path = "/api/tracking/results/{client_id}",
    params(("client_id" = Uuid, Path, description = "Client id"), RankingFilter),
    responses(
        (status = 200, description = "Ranking rows, newest first", body = RankingRowsResponse),
        (status = 500, description = "Query failed")
    ),
    tag = "tracking"
)]
pub async fn tracking_results(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<Uuid>,
    Query(filter): Query<RankingFilter>,
) -> Result<Json<RankingRowsResponse>, ApiError> {
    let data = state
        .persistence
        .tracking_results(client_id, &filter)
        .await
        .map_err(|e| ApiError::internal("Failed to fetch results", e))?;

    Ok(Json(RankingRowsResponse { success: true, data }))
}

#[utoipa::path(
    get,
    path = "/api/tracking/trends/{keyword_id}/{location_id}",
    params(
        ("keyword_id" = Uuid, Path, description = "Keyword id"),
        ("location_id" = Uuid, Path, description = "Location id"),
        RankingFilter
    ),
    responses(
        (status = 200, description = "Daily best ranks", body = TrendResponse),
        (status = 500, description = "Query failed")
    ),
    tag = "tracking"
)]
pub async fn ranking_trend(
    State(state): State<Arc<AppState>>,
    Path((keyword_id, location_id)): Path<(Uuid, Uuid)>,
    Query(filter): Query<RankingFilter>,
) -> Result<Json<TrendResponse>, ApiError> {
    let data = state
        .persistence
        .ranking_trend(keyword_id, location_id, &filter)
        .await
        .map_err(|e| ApiError::internal("Failed to fetch trend", e))?;

    Ok(Json(TrendResponse { success: true, data }))
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "serp"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let queue = if state.queue.is_degraded() { "degraded" } else { "active" };
    Json(HealthResponse {
        status: "ok".to_string(),
        queue: queue.to_string(),
        timestamp: Utc::now(),
    })
}
