use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::models::TrackingPayload;

/// Dispatch priority. Lower weight dispatches first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn weight(self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Delayed,
    Waiting,
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Delayed => write!(f, "delayed"),
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Summary kept on a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub organic: usize,
    pub map_pack: usize,
    pub total_results: u64,
    pub rows_written: usize,
    pub degraded: bool,
}

/// A queued scrape of one tracking pair, as held by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackingJob {
    pub id: String,
    pub payload: TrackingPayload,
    pub priority: Priority,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub backoff_ms: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub outcome: Option<JobOutcome>,
    /// Token of the claim currently working this job. Only the holder may
    /// move the job out of `active`.
    #[serde(skip)]
    pub lease: Option<String>,
}

impl TrackingJob {
    pub fn new(payload: TrackingPayload, priority: Priority, settings: &QueueSettings) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority,
            state: JobState::Delayed,
            attempts_made: 0,
            max_attempts: settings.max_attempts,
            timeout_ms: settings.attempt_timeout.as_millis() as u64,
            backoff_ms: settings.backoff_base.as_millis() as u64,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            outcome: None,
            lease: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Exponential backoff after the given (1-based) failed attempt:
    /// base, 2×base, 4×base, ...
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exponent))
    }
}

/// What `enqueue` hands back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: String,
    pub priority: Priority,
    pub delay_ms: u64,
}

/// Point-in-time job counts. `waiting` includes delayed jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueStats {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Location;

    fn job() -> TrackingJob {
        TrackingJob::new(
            TrackingPayload::adhoc("pizza delivery", Location::named("Manhattan, NY")),
            Priority::Normal,
            &QueueSettings::default(),
        )
    }

    #[test]
    fn priority_weights_order_high_first() {
        assert!(Priority::High.weight() < Priority::Normal.weight());
        assert!(Priority::Normal.weight() < Priority::Low.weight());
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "\"low\"");
        let p: Priority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, Priority::High);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let job = job();
        assert_eq!(job.backoff_after(1), Duration::from_secs(2));
        assert_eq!(job.backoff_after(2), Duration::from_secs(4));
        assert_eq!(job.backoff_after(3), Duration::from_secs(8));
    }

    #[test]
    fn retry_budget() {
        let mut job = job();
        assert_eq!(job.max_attempts, 3);
        job.attempts_made = 2;
        assert!(job.can_retry());
        job.attempts_made = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn lease_token_stays_out_of_the_record() {
        let mut job = job();
        job.lease = Some("claim-1".to_string());

        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("lease").is_none());

        let back: TrackingJob = serde_json::from_value(json).unwrap();
        assert!(back.lease.is_none());
    }

    #[test]
    fn stats_error_is_omitted_when_healthy() {
        let json = serde_json::to_value(QueueStats::default()).unwrap();
        assert!(json.get("error").is_none());

        let json = serde_json::to_value(QueueStats::unavailable("redis down")).unwrap();
        assert_eq!(json["waiting"], 0);
        assert_eq!(json["error"], "redis down");
    }
}
