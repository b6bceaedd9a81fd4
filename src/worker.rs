use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::db::PersistenceAdapter;
use crate::error::{JobError, RenderError, StoreError};
use crate::extractor::{self, Extraction};
use crate::models::{Location, TrackingPayload};
use crate::queue::{JobEvent, JobOutcome, JobState, QueueCore, TrackingJob};
use crate::renderer::Renderer;

const TRANSITION_ATTEMPTS: u32 = 3;
const TRANSITION_BACKOFF: Duration = Duration::from_millis(50);

/// Render → extract → persist for one tracking payload.
pub struct Pipeline {
    renderer: Arc<dyn Renderer>,
    persistence: Arc<dyn PersistenceAdapter>,
}

impl Pipeline {
    pub fn new(renderer: Arc<dyn Renderer>, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self { renderer, persistence }
    }

    /// Render and parse a results page without touching the database.
    pub async fn search(&self, keyword: &str, location: &Location) -> Result<Extraction, RenderError> {
        let html = self.renderer.render(keyword, location).await?;
        Ok(extractor::extract(&html, keyword, location))
    }

    pub async fn run(&self, payload: &TrackingPayload) -> Result<JobOutcome, JobError> {
        let extraction = self.search(&payload.keyword, &payload.location).await?;
        let degraded = extraction.is_degraded();
        let results = extraction.into_result();

        // Ad-hoc payloads carry no stored pair, so there is nothing to append to.
        let rows_written = match payload.tracking_ids() {
            Some((keyword_id, location_id, client_id)) => {
                self.persistence
                    .save_tracking_results(keyword_id, location_id, client_id, &results)
                    .await?
            }
            None => 0,
        };

        Ok(JobOutcome {
            organic: results.organic.len(),
            map_pack: results.map_pack.len(),
            total_results: results.total_results,
            rows_written,
            degraded,
        })
    }
}

/// Claim and process jobs until the queue shuts down.
pub(crate) async fn start_worker(index: usize, core: Arc<QueueCore>, pipeline: Arc<Pipeline>) {
    loop {
        if core.shutdown.is_cancelled() {
            break;
        }

        match core.store.claim(core.settings.lease).await {
            Ok(Some(job)) => process_job(index, &core, &pipeline, job).await,
            Ok(None) => idle(&core).await,
            Err(e) => {
                core.emit(JobEvent::StoreError {
                    operation: "claim",
                    error: e.to_string(),
                });
                idle(&core).await;
            }
        }
    }
}

/// Wait for an enqueue, the next poll tick or shutdown, whichever comes first.
async fn idle(core: &QueueCore) {
    tokio::select! {
        _ = core.shutdown.cancelled() => {}
        _ = core.wake.notified() => {}
        _ = sleep(poll_with_jitter(core.settings.poll_interval)) => {}
    }
}

fn poll_with_jitter(poll_interval: Duration) -> Duration {
    let jitter_cap = (poll_interval.as_millis() as u64 / 10).max(1);
    poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
}

async fn process_job(index: usize, core: &QueueCore, pipeline: &Pipeline, mut job: TrackingJob) {
    core.emit(JobEvent::Active {
        job_id: job.id.clone(),
        attempt: job.attempts_made,
        worker: index,
    });

    let timeout = job.timeout();
    let result = {
        let attempt = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(pipeline.run(&job.payload)).catch_unwind(),
        );
        tokio::pin!(attempt);

        let mut renew = interval(core.settings.lease / 3);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        loop {
            tokio::select! {
                finished = &mut attempt => break match finished {
                    Err(_) => Err(JobError::Timeout(timeout)),
                    Ok(Err(panic)) => Err(JobError::Panicked(panic_message(&*panic))),
                    Ok(Ok(result)) => result,
                },
                _ = renew.tick() => match core.store.renew(&job, core.settings.lease).await {
                    Ok(()) => {}
                    Err(e @ StoreError::LeaseLost(_)) => {
                        // Another claim owns the job now; drop this attempt.
                        core.emit(JobEvent::StoreError {
                            operation: "renew",
                            error: e.to_string(),
                        });
                        return;
                    }
                    Err(e) => core.emit(JobEvent::StoreError {
                        operation: "renew",
                        error: e.to_string(),
                    }),
                },
            }
        }
    };

    match result {
        Ok(outcome) => {
            if outcome.degraded {
                core.emit(JobEvent::ExtractionDegraded {
                    job_id: job.id.clone(),
                    keyword: job.payload.keyword.clone(),
                    location: job.payload.location.label(),
                });
            }

            job.state = JobState::Completed;
            job.finished_at = Some(Utc::now());
            job.failed_reason = None;
            job.outcome = Some(outcome.clone());

            if transition(core, "complete", || core.store.complete(&job)).await {
                core.emit(JobEvent::Completed { job_id: job.id, outcome });
            }
        }
        Err(error) => {
            let error = error.to_string();
            job.failed_reason = Some(error.clone());

            if job.can_retry() {
                let backoff = job.backoff_after(job.attempts_made);
                job.state = JobState::Delayed;

                if transition(core, "retry", || core.store.retry(&job, backoff)).await {
                    core.emit(JobEvent::AttemptFailed {
                        job_id: job.id,
                        attempt: job.attempts_made,
                        backoff,
                        error,
                    });
                }
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());

                if transition(core, "fail", || core.store.fail(&job)).await {
                    core.emit(JobEvent::Failed {
                        job_id: job.id,
                        attempts: job.attempts_made,
                        error,
                    });
                }
            }
        }
    }
}

/// Run a store transition, retrying transient errors with a short doubling
/// pause. When it still fails the job keeps its lease, stops being renewed and
/// is re-queued by the stalled-job reaper once the lease runs out.
async fn transition<F, Fut>(core: &QueueCore, operation: &'static str, mut call: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(()) => return true,
            Err(e) => {
                core.emit(JobEvent::StoreError {
                    operation,
                    error: e.to_string(),
                });
                if !e.is_transient() || attempt >= TRANSITION_ATTEMPTS {
                    return false;
                }
                sleep(TRANSITION_BACKOFF * 2u32.pow(attempt - 1)).await;
                attempt += 1;
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_a_tenth_of_the_interval() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let d = poll_with_jitter(base);
            assert!(d >= base && d <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}
