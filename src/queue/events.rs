use std::time::Duration;

use super::job::{JobOutcome, Priority};

/// Lifecycle notifications published by the queue.
///
/// Delivery is best effort: with no subscriber the event is dropped, and a
/// slow subscriber may observe `RecvError::Lagged`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Enqueued {
        job_id: String,
        keyword: String,
        priority: Priority,
        delay: Duration,
    },
    Active {
        job_id: String,
        attempt: u32,
        worker: usize,
    },
    Completed {
        job_id: String,
        outcome: JobOutcome,
    },
    ExtractionDegraded {
        job_id: String,
        keyword: String,
        location: String,
    },
    AttemptFailed {
        job_id: String,
        attempt: u32,
        backoff: Duration,
        error: String,
    },
    Failed {
        job_id: String,
        attempts: u32,
        error: String,
    },
    Stalled {
        job_id: String,
    },
    StoreError {
        operation: &'static str,
        error: String,
    },
}
