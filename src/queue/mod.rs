//! Durable job queue driving the SERP pipeline.
//!
//! `SerpQueue` is either an active service with a worker pool, or a degraded
//! stand-in used when the backing store cannot be reached at start-up.

mod events;
mod job;
mod redis_store;
mod store;

pub use events::JobEvent;
pub use job::{JobHandle, JobOutcome, JobState, Priority, QueueStats, TrackingJob};
pub use redis_store::RedisJobStore;
pub use store::{JobStore, MemoryJobStore};

use futures::future::join_all;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{QueueSettings, QueueStoreKind};
use crate::db::PersistenceAdapter;
use crate::error::{ScheduleError, StoreError};
use crate::models::TrackingPayload;
use crate::worker::{self, Pipeline};

const EVENT_CAPACITY: usize = 1024;

/// State shared between the queue handle and its workers.
pub(crate) struct QueueCore {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) settings: QueueSettings,
    pub(crate) events: broadcast::Sender<JobEvent>,
    pub(crate) wake: Notify,
    pub(crate) shutdown: CancellationToken,
}

impl QueueCore {
    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscriber is not an error.
        let _ = self.events.send(event);
    }
}

/// Queue backed by a live job store.
///
/// Built idle by `new` so callers can subscribe before `start` publishes the
/// start-up recovery events.
#[derive(Clone)]
pub struct QueueService {
    core: Arc<QueueCore>,
    pipeline: Arc<Pipeline>,
    started: Arc<AtomicBool>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl QueueService {
    pub fn new(store: Arc<dyn JobStore>, settings: QueueSettings, pipeline: Pipeline) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core: Arc::new(QueueCore {
                store,
                settings,
                events,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            pipeline: Arc::new(pipeline),
            started: Arc::new(AtomicBool::new(false)),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Re-queue jobs whose lease ran out, then spawn `settings.concurrency`
    /// workers and the stalled-job reaper. A second call does nothing.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) || self.core.shutdown.is_cancelled() {
            return;
        }

        recover_stalled(&self.core).await;

        let mut handles: Vec<JoinHandle<()>> = (1..=self.core.settings.concurrency)
            .map(|index| {
                tokio::spawn(worker::start_worker(index, self.core.clone(), self.pipeline.clone()))
            })
            .collect();
        handles.push(tokio::spawn(reap_stalled(self.core.clone())));
        self.workers().extend(handles);
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.workers.lock() {
            Ok(workers) => workers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.core.events.subscribe()
    }

    pub async fn enqueue(&self, payload: TrackingPayload, priority: Priority) -> Result<JobHandle, StoreError> {
        let max_delay = self.core.settings.max_initial_delay.as_millis() as u64;
        let delay_ms = rand::thread_rng().gen_range(0..=max_delay);
        let delay = Duration::from_millis(delay_ms);

        let job = TrackingJob::new(payload, priority, &self.core.settings);
        self.core.store.add(&job, delay).await?;

        self.core.emit(JobEvent::Enqueued {
            job_id: job.id.clone(),
            keyword: job.payload.keyword.clone(),
            priority,
            delay,
        });
        if delay.is_zero() {
            self.core.wake.notify_one();
        }

        Ok(JobHandle {
            id: job.id,
            priority,
            delay_ms,
        })
    }

    pub async fn stats(&self) -> QueueStats {
        match self.core.store.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                self.core.emit(JobEvent::StoreError {
                    operation: "stats",
                    error: e.to_string(),
                });
                QueueStats::unavailable(e.to_string())
            }
        }
    }

    pub async fn job(&self, id: &str) -> Result<Option<TrackingJob>, StoreError> {
        self.core.store.get(id).await
    }

    fn pacing(&self) -> Duration {
        self.core.settings.schedule_pacing
    }

    /// Stop the workers after their current attempt. Safe to call repeatedly.
    pub async fn close(&self) {
        self.core.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.workers().drain(..).collect();
        // A worker that panicked has nothing left to clean up.
        let _ = join_all(handles).await;
    }
}

async fn recover_stalled(core: &QueueCore) {
    match core.store.recover_stalled().await {
        Ok(ids) => {
            if !ids.is_empty() {
                core.wake.notify_waiters();
            }
            for job_id in ids {
                core.emit(JobEvent::Stalled { job_id });
            }
        }
        Err(e) => core.emit(JobEvent::StoreError {
            operation: "recover_stalled",
            error: e.to_string(),
        }),
    }
}

/// Sweep for expired leases twice per lease period until shutdown.
async fn reap_stalled(core: Arc<QueueCore>) {
    let period = core.settings.lease / 2;
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => recover_stalled(&core).await,
        }
    }
}

/// Stand-in used when the job store is unreachable. Accepts work and drops it.
#[derive(Clone)]
pub struct DegradedQueue {
    reason: String,
    events: broadcast::Sender<JobEvent>,
}

impl DegradedQueue {
    pub fn new(reason: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1);
        Self {
            reason: reason.into(),
            events,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn enqueue(&self, priority: Priority) -> JobHandle {
        JobHandle {
            id: format!("degraded-{}", Uuid::new_v4()),
            priority,
            delay_ms: 0,
        }
    }
}

#[derive(Clone)]
pub enum SerpQueue {
    Active(QueueService),
    Degraded(DegradedQueue),
}

impl SerpQueue {
    /// Build the configured store and an idle worker pool; `start` runs it.
    /// Falls back to `Degraded` when the store cannot be reached.
    pub async fn connect(
        kind: QueueStoreKind,
        redis_url: &str,
        settings: QueueSettings,
        pipeline: Pipeline,
    ) -> Self {
        let store: Arc<dyn JobStore> = match kind {
            QueueStoreKind::Memory => Arc::new(MemoryJobStore::new(settings.keep_completed, settings.keep_failed)),
            QueueStoreKind::Redis => {
                match RedisJobStore::connect(redis_url, settings.keep_completed, settings.keep_failed).await {
                    Ok(store) => Arc::new(store),
                    Err(e) => return SerpQueue::Degraded(DegradedQueue::new(e.to_string())),
                }
            }
        };
        SerpQueue::Active(QueueService::new(store, settings, pipeline))
    }

    /// Start the worker pool. Subscribe first to see start-up recovery.
    pub async fn start(&self) {
        if let SerpQueue::Active(queue) = self {
            queue.start().await;
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, SerpQueue::Degraded(_))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        match self {
            SerpQueue::Active(queue) => queue.subscribe(),
            SerpQueue::Degraded(queue) => queue.events.subscribe(),
        }
    }

    pub async fn enqueue(&self, payload: TrackingPayload, priority: Priority) -> Result<JobHandle, StoreError> {
        match self {
            SerpQueue::Active(queue) => queue.enqueue(payload, priority).await,
            SerpQueue::Degraded(queue) => Ok(queue.enqueue(priority)),
        }
    }

    /// Never fails: a store error yields zero counts with `error` set.
    pub async fn stats(&self) -> QueueStats {
        match self {
            SerpQueue::Active(queue) => queue.stats().await,
            SerpQueue::Degraded(queue) => QueueStats::unavailable(queue.reason()),
        }
    }

    pub async fn job(&self, id: &str) -> Result<Option<TrackingJob>, StoreError> {
        match self {
            SerpQueue::Active(queue) => queue.job(id).await,
            SerpQueue::Degraded(_) => Ok(None),
        }
    }

    /// One normal-priority job per active tracking pair. Returns the count.
    pub async fn schedule_all(&self, persistence: &dyn PersistenceAdapter) -> Result<usize, ScheduleError> {
        let pairs = persistence.active_tracking_pairs().await?;
        let payloads: Vec<TrackingPayload> = pairs.iter().map(|pair| pair.payload()).collect();
        self.enqueue_paced(payloads).await
    }

    /// One normal-priority job per (keyword, location) of the client.
    pub async fn schedule_for_client(
        &self,
        persistence: &dyn PersistenceAdapter,
        client_id: Uuid,
    ) -> Result<usize, ScheduleError> {
        let keywords = persistence.client_keywords(client_id).await?;
        let locations = persistence.client_locations(client_id).await?;

        let mut payloads = Vec::with_capacity(keywords.len() * locations.len());
        for keyword in &keywords {
            for location in &locations {
                payloads.push(TrackingPayload {
                    keyword_id: Some(keyword.id),
                    keyword: keyword.keyword.clone(),
                    location_id: Some(location.id),
                    location: location.location(),
                    client_id: Some(client_id),
                });
            }
        }
        self.enqueue_paced(payloads).await
    }

    async fn enqueue_paced(&self, payloads: Vec<TrackingPayload>) -> Result<usize, ScheduleError> {
        let queue = match self {
            SerpQueue::Active(queue) => queue,
            SerpQueue::Degraded(_) => return Ok(payloads.len()),
        };

        let count = payloads.len();
        for (i, payload) in payloads.into_iter().enumerate() {
            if i > 0 && !queue.pacing().is_zero() {
                tokio::time::sleep(queue.pacing()).await;
            }
            queue.enqueue(payload, Priority::Normal).await?;
        }
        Ok(count)
    }

    pub async fn close(&self) {
        if let SerpQueue::Active(queue) = self {
            queue.close().await;
        }
    }
}
