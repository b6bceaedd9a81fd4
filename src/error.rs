//! Error types shared across the pipeline.
//!
//! Renderer and persistence failures bubble into `JobError`, which the queue
//! turns into a retry or a terminal failure. `ApiError` is the only type that
//! reaches HTTP clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Page renderer failures.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render timed out during {stage} after {timeout:?}")]
    Timeout { stage: &'static str, timeout: Duration },

    #[error("results container missing, page looks like a challenge: {marker}")]
    Blocked { marker: String },

    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("render task aborted: {0}")]
    Task(String),
}

/// Persistence adapter failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no tracking pair for keyword {keyword_id} at location {location_id}")]
    TrackingPairNotFound {
        keyword_id: uuid::Uuid,
        location_id: uuid::Uuid,
    },
}

/// Job store (queue backing store) failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("job record encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("lease on job {0} is no longer held")]
    LeaseLost(String),
}

impl StoreError {
    /// Worth retrying the same call: the backend hiccupped, not the job.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::LeaseLost(_) | StoreError::Serde(_))
    }
}

/// Failure while fanning tracking pairs out into jobs.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a single job attempt failed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("attempt exceeded {0:?}")]
    Timeout(Duration),

    #[error("attempt panicked: {0}")]
    Panicked(String),
}

/// Errors surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{context}: {message}")]
    Internal { context: &'static str, message: String },
}

impl ApiError {
    pub fn internal(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Internal {
            context,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), msg.clone()),
            ApiError::Internal { context, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                (*context).to_string(),
                message.clone(),
            ),
        };

        if status.is_server_error() {
            tracing::error!("❌ {}", self);
        }

        (
            status,
            Json(json!({
                "success": false,
                "error": error,
                "message": message,
            })),
        )
            .into_response()
    }
}
