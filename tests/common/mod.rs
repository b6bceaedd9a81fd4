#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use uuid::Uuid;

use serp_tracker::config::QueueSettings;
use serp_tracker::db::PersistenceAdapter;
use serp_tracker::error::{PersistenceError, RenderError, StoreError};
use serp_tracker::models::{
    ClientKeyword, ClientLocation, Location, RankingFilter, RankingRow, SearchResult, TrackingPair,
    TrendPoint,
};
use serp_tracker::queue::{JobEvent, JobStore, MemoryJobStore, QueueService, QueueStats, TrackingJob};
use serp_tracker::renderer::Renderer;
use serp_tracker::worker::Pipeline;

pub const SERP_HTML: &str = r#"
    <html><body>
      <div id="result-stats">About 48,200 results</div>
      <div id="search"><div id="rso">
        <div class="g">
          <a href="/url?url=https://www.joespizza.example/&amp;sa=U"><h3>Joe's Pizza</h3></a>
          <div class="VwiC3b">Best slice in the Village.</div>
        </div>
        <div class="g">
          <a href="https://slice.example/nyc"><h3>Slice NYC</h3></a>
        </div>
      </div></div>
      <div class="rllt__details">
        <div class="dbg0pd">Joe's Pizza</div>
        <div>7 Carmine St</div>
      </div>
    </body></html>
"#;

#[derive(Clone, Copy)]
pub enum RenderMode {
    Serp,
    Empty,
    Fail,
}

/// Renderer returning canned HTML, tracking how many renders overlap.
pub struct FakeRenderer {
    mode: RenderMode,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRenderer {
    pub fn new(mode: RenderMode, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, _keyword: &str, _location: &Location) -> Result<String, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.mode {
            RenderMode::Serp => Ok(SERP_HTML.to_string()),
            RenderMode::Empty => Ok("<html><body></body></html>".to_string()),
            RenderMode::Fail => Err(RenderError::Navigation("net::ERR_CONNECTION_RESET".to_string())),
        }
    }

    async fn shutdown(&self) {}
}

/// In-memory client data: keywords × locations, all tracked.
pub struct FakePersistence {
    pub client_id: Uuid,
    keywords: Vec<ClientKeyword>,
    locations: Vec<ClientLocation>,
    saved: Mutex<Vec<(Uuid, Uuid, Uuid, usize)>>,
}

impl FakePersistence {
    pub fn new(keywords: &[&str], locations: &[&str]) -> Arc<Self> {
        let client_id = Uuid::new_v4();
        Arc::new(Self {
            client_id,
            keywords: keywords
                .iter()
                .map(|k| ClientKeyword {
                    id: Uuid::new_v4(),
                    keyword: k.to_string(),
                    client_id,
                })
                .collect(),
            locations: locations
                .iter()
                .map(|name| ClientLocation {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    latitude: None,
                    longitude: None,
                    client_id,
                })
                .collect(),
            saved: Mutex::new(Vec::new()),
        })
    }

    pub fn saved(&self) -> Vec<(Uuid, Uuid, Uuid, usize)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceAdapter for FakePersistence {
    async fn active_tracking_pairs(&self) -> Result<Vec<TrackingPair>, PersistenceError> {
        let mut pairs = Vec::new();
        for keyword in &self.keywords {
            for location in &self.locations {
                pairs.push(TrackingPair {
                    tracking_id: Uuid::new_v4(),
                    keyword_id: keyword.id,
                    keyword: keyword.keyword.clone(),
                    location_id: location.id,
                    location: location.location(),
                    client_id: self.client_id,
                });
            }
        }
        Ok(pairs)
    }

    async fn save_tracking_results(
        &self,
        keyword_id: Uuid,
        location_id: Uuid,
        client_id: Uuid,
        results: &SearchResult,
    ) -> Result<usize, PersistenceError> {
        let rows = results.organic.len() + results.map_pack.len();
        self.saved
            .lock()
            .unwrap()
            .push((keyword_id, location_id, client_id, rows));
        Ok(rows)
    }

    async fn client_keywords(&self, client_id: Uuid) -> Result<Vec<ClientKeyword>, PersistenceError> {
        Ok(self.keywords.iter().filter(|k| k.client_id == client_id).cloned().collect())
    }

    async fn client_locations(&self, client_id: Uuid) -> Result<Vec<ClientLocation>, PersistenceError> {
        Ok(self.locations.iter().filter(|l| l.client_id == client_id).cloned().collect())
    }

    async fn tracking_results(
        &self,
        _client_id: Uuid,
        _filter: &RankingFilter,
    ) -> Result<Vec<RankingRow>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn ranking_trend(
        &self,
        _keyword_id: Uuid,
        _location_id: Uuid,
        _filter: &RankingFilter,
    ) -> Result<Vec<TrendPoint>, PersistenceError> {
        Ok(Vec::new())
    }
}

/// Job store whose backend is always down.
pub struct FailingStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl JobStore for FailingStore {
    async fn add(&self, _job: &TrackingJob, _delay: Duration) -> Result<(), StoreError> {
        Err(down())
    }

    async fn claim(&self, _lease: Duration) -> Result<Option<TrackingJob>, StoreError> {
        Err(down())
    }

    async fn renew(&self, _job: &TrackingJob, _lease: Duration) -> Result<(), StoreError> {
        Err(down())
    }

    async fn retry(&self, _job: &TrackingJob, _delay: Duration) -> Result<(), StoreError> {
        Err(down())
    }

    async fn complete(&self, _job: &TrackingJob) -> Result<(), StoreError> {
        Err(down())
    }

    async fn fail(&self, _job: &TrackingJob) -> Result<(), StoreError> {
        Err(down())
    }

    async fn get(&self, _id: &str) -> Result<Option<TrackingJob>, StoreError> {
        Err(down())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        Err(down())
    }

    async fn recover_stalled(&self) -> Result<Vec<String>, StoreError> {
        Err(down())
    }
}

/// Memory store whose `complete` fails the first `complete_failures` calls.
pub struct FlakyStore {
    inner: MemoryJobStore,
    complete_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(complete_failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryJobStore::new(10, 5),
            complete_failures: AtomicUsize::new(complete_failures),
        })
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn add(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError> {
        self.inner.add(job, delay).await
    }

    async fn claim(&self, lease: Duration) -> Result<Option<TrackingJob>, StoreError> {
        self.inner.claim(lease).await
    }

    async fn renew(&self, job: &TrackingJob, lease: Duration) -> Result<(), StoreError> {
        self.inner.renew(job, lease).await
    }

    async fn retry(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError> {
        self.inner.retry(job, delay).await
    }

    async fn complete(&self, job: &TrackingJob) -> Result<(), StoreError> {
        let failing = self
            .complete_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("connection reset by peer".to_string()));
        }
        self.inner.complete(job).await
    }

    async fn fail(&self, job: &TrackingJob) -> Result<(), StoreError> {
        self.inner.fail(job).await
    }

    async fn get(&self, id: &str) -> Result<Option<TrackingJob>, StoreError> {
        self.inner.get(id).await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.inner.stats().await
    }

    async fn recover_stalled(&self) -> Result<Vec<String>, StoreError> {
        self.inner.recover_stalled().await
    }
}

/// Fast settings: no initial delay, no pacing, short backoff and polling.
pub fn fast_settings() -> QueueSettings {
    QueueSettings {
        concurrency: 2,
        max_attempts: 3,
        backoff_base: Duration::from_millis(20),
        attempt_timeout: Duration::from_secs(5),
        max_initial_delay: Duration::ZERO,
        schedule_pacing: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        lease: Duration::from_millis(500),
        keep_completed: 10,
        keep_failed: 5,
    }
}

/// Started queue over a fresh memory store.
pub async fn memory_queue(
    settings: QueueSettings,
    renderer: Arc<FakeRenderer>,
    persistence: Arc<FakePersistence>,
) -> QueueService {
    let store = Arc::new(MemoryJobStore::new(settings.keep_completed, settings.keep_failed));
    let queue = queue_over(store, settings, renderer, persistence);
    queue.start().await;
    queue
}

/// Idle queue over the given store; call `start` to run it.
pub fn queue_over(
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
    renderer: Arc<FakeRenderer>,
    persistence: Arc<FakePersistence>,
) -> QueueService {
    QueueService::new(store, settings, Pipeline::new(renderer, persistence))
}

/// Collect events until `done` matches one, or fail after `limit`.
pub async fn collect_until<F>(events: &mut Receiver<JobEvent>, limit: Duration, mut done: F) -> Vec<JobEvent>
where
    F: FnMut(&JobEvent, &[JobEvent]) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = done(&event, &seen);
                    seen.push(event);
                    if finished {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;

    assert!(result.is_ok(), "timed out waiting for queue events: {:?}", seen);
    seen
}
