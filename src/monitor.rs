use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::JobEvent;

/// Log queue events until the channel closes.
pub fn spawn_monitor(mut events: Receiver<JobEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("⚠️ [Monitor] Fell behind, {} queue events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &JobEvent) {
    match event {
        JobEvent::Enqueued {
            job_id,
            keyword,
            priority,
            delay,
        } => debug!(
            "📥 [Queue] Job {} added for '{}' ({}, starts in {:?})",
            job_id, keyword, priority, delay
        ),
        JobEvent::Active {
            job_id,
            attempt,
            worker,
        } => info!("👷 [Worker {}] Picked up job {} (attempt {})", worker, job_id, attempt),
        JobEvent::Completed { job_id, outcome } => info!(
            "✅ [Queue] Job {} completed: {} organic, {} map pack, {} rows saved",
            job_id, outcome.organic, outcome.map_pack, outcome.rows_written
        ),
        JobEvent::ExtractionDegraded {
            job_id,
            keyword,
            location,
        } => warn!(
            "⚠️ [Extractor] No results parsed for '{}' in {} (job {})",
            keyword, location, job_id
        ),
        JobEvent::AttemptFailed {
            job_id,
            attempt,
            backoff,
            error,
        } => warn!(
            "⚠️ [Queue] Job {} attempt {} failed: {}. Retrying in {:?}",
            job_id, attempt, error, backoff
        ),
        JobEvent::Failed {
            job_id,
            attempts,
            error,
        } => error!("❌ [Queue] Job {} failed after {} attempts: {}", job_id, attempts, error),
        JobEvent::Stalled { job_id } => warn!("⚠️ [Queue] Job {} stalled, re-queued", job_id),
        JobEvent::StoreError { operation, error } => {
            error!("🔥 [Queue] Job store error during {}: {}", operation, error)
        }
    }
}
