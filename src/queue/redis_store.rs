use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use uuid::Uuid;

use super::job::{JobState, QueueStats, TrackingJob};
use super::store::JobStore;
use crate::error::StoreError;

const DEFAULT_PREFIX: &str = "serp";

// Sequence numbers stay below this, so weight always dominates the score.
const WEIGHT_STRIDE: f64 = 1e12;

/// Promote due delayed jobs into the waiting set, pop the lowest score and
/// lease it. Returns the job id or nil.
///
/// KEYS: waiting, delayed, scores, active, leases.
/// ARGV: now (ms), lease expiry (ms), lease token.
static CLAIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
        for _, id in ipairs(due) do
            local score = redis.call('HGET', KEYS[3], id)
            if score then
                redis.call('ZADD', KEYS[1], score, id)
            end
            redis.call('ZREM', KEYS[2], id)
        end
        local popped = redis.call('ZPOPMIN', KEYS[1])
        if #popped == 0 then
            return false
        end
        redis.call('ZADD', KEYS[4], ARGV[2], popped[1])
        redis.call('HSET', KEYS[5], popped[1], ARGV[3])
        return popped[1]
        "#,
    )
});

/// Extend a lease held under the given token. Returns 0 when it is not held.
///
/// KEYS: active, leases. ARGV: job id, lease token, lease expiry (ms).
static RENEW_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
            return 0
        end
        redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
        return 1
        "#,
    )
});

/// Drop the lease, store the record and file the id under its next state:
/// pushed onto a finished list, or into the delayed set when a ready time is
/// given. Returns 0 when the token no longer holds the lease.
///
/// KEYS: active, leases, job record, target list or delayed set.
/// ARGV: job id, lease token, record json, ready time (ms) or ''.
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
            return 0
        end
        redis.call('ZREM', KEYS[1], ARGV[1])
        redis.call('HDEL', KEYS[2], ARGV[1])
        redis.call('SET', KEYS[3], ARGV[3])
        if ARGV[4] == '' then
            redis.call('LPUSH', KEYS[4], ARGV[1])
        else
            redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
        end
        return 1
        "#,
    )
});

/// Move active jobs whose lease expired back to waiting. Returns the moved ids.
///
/// KEYS: active, waiting, scores, leases. ARGV: now (ms).
static RECOVER_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        for _, id in ipairs(ids) do
            local score = redis.call('HGET', KEYS[3], id)
            if score then
                redis.call('ZADD', KEYS[2], score, id)
            end
            redis.call('ZREM', KEYS[1], id)
            redis.call('HDEL', KEYS[4], id)
        end
        return ids
        "#,
    )
});

/// Redis-backed job store. Job records and dispatch order survive restarts
/// and are shared by every instance pointed at the same prefix.
///
/// Layout under the prefix (`serp` by default): one JSON string per job, a
/// waiting sorted set scored by `weight * 1e12 + seq`, a delayed sorted set
/// scored by the ready time in ms, a hash of dispatch scores, an active sorted
/// set scored by lease expiry with a hash of lease tokens, and capped
/// completed/failed lists.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    prefix: String,
    keep_completed: usize,
    keep_failed: usize,
}

fn prefixed(prefix: &str, name: &str) -> String {
    format!("{}:{}", prefix, name)
}

impl RedisJobStore {
    pub async fn connect(
        redis_url: &str,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            keep_completed,
            keep_failed,
        })
    }

    /// Keep this store's keys under another prefix, e.g. one per environment.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        prefixed(&self.prefix, name)
    }

    fn job_key(&self, id: &str) -> String {
        prefixed(&self.prefix, &format!("job:{}", id))
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn after(delay: Duration) -> i64 {
        Self::now_ms() + delay.as_millis() as i64
    }

    fn token(job: &TrackingJob) -> Result<&str, StoreError> {
        job.lease
            .as_deref()
            .ok_or_else(|| StoreError::LeaseLost(job.id.clone()))
    }

    async fn load(&self, id: &str) -> Result<Option<TrackingJob>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.job_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn release(
        &self,
        job: &TrackingJob,
        target: &str,
        ready_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let token = Self::token(job)?;
        let mut record = job.clone();
        record.lease = None;
        let json = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let released: i32 = RELEASE_SCRIPT
            .key(self.key("active"))
            .key(self.key("leases"))
            .key(self.job_key(&job.id))
            .key(self.key(target))
            .arg(&job.id)
            .arg(token)
            .arg(json)
            .arg(ready_at.map(|ms| ms.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            return Err(StoreError::LeaseLost(job.id.clone()));
        }
        Ok(())
    }

    async fn finish(
        &self,
        job: &TrackingJob,
        state: JobState,
        list: &str,
        keep: usize,
    ) -> Result<(), StoreError> {
        let mut job = job.clone();
        job.state = state;
        self.release(&job, list, None).await?;

        let mut conn = self.conn.clone();
        let list_key = self.key(list);
        let purged: Vec<String> = conn.lrange(&list_key, keep as isize, -1).await?;
        if purged.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic().ltrim(&list_key, 0, keep as isize - 1).ignore();
        for id in &purged {
            pipe.del(self.job_key(id)).ignore();
            pipe.hdel(self.key("scores"), id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn add(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn.incr(self.key("seq"), 1).await?;
        let score = job.priority.weight() as f64 * WEIGHT_STRIDE + seq as f64;

        let mut job = job.clone();
        job.state = JobState::Delayed;
        job.lease = None;
        let json = serde_json::to_string(&job)?;

        redis::pipe()
            .atomic()
            .set(self.job_key(&job.id), json)
            .ignore()
            .hset(self.key("scores"), &job.id, score)
            .ignore()
            .zadd(self.key("delayed"), &job.id, Self::after(delay))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim(&self, lease: Duration) -> Result<Option<TrackingJob>, StoreError> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();
        let claimed: Option<String> = CLAIM_SCRIPT
            .key(self.key("waiting"))
            .key(self.key("delayed"))
            .key(self.key("scores"))
            .key(self.key("active"))
            .key(self.key("leases"))
            .arg(Self::now_ms())
            .arg(Self::after(lease))
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = claimed else {
            return Ok(None);
        };

        let Some(mut job) = self.load(&id).await? else {
            redis::pipe()
                .zrem(self.key("active"), &id)
                .ignore()
                .hdel(self.key("leases"), &id)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            return Err(StoreError::Unavailable(format!("job record {} missing", id)));
        };

        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_at = Some(Utc::now());
        let json = serde_json::to_string(&job)?;
        let _: () = conn.set(self.job_key(&id), json).await?;

        job.lease = Some(token);
        Ok(Some(job))
    }

    async fn renew(&self, job: &TrackingJob, lease: Duration) -> Result<(), StoreError> {
        let token = Self::token(job)?;
        let mut conn = self.conn.clone();
        let renewed: i32 = RENEW_SCRIPT
            .key(self.key("active"))
            .key(self.key("leases"))
            .arg(&job.id)
            .arg(token)
            .arg(Self::after(lease))
            .invoke_async(&mut conn)
            .await?;

        if renewed == 0 {
            return Err(StoreError::LeaseLost(job.id.clone()));
        }
        Ok(())
    }

    async fn retry(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError> {
        let mut job = job.clone();
        job.state = JobState::Delayed;
        self.release(&job, "delayed", Some(Self::after(delay))).await
    }

    async fn complete(&self, job: &TrackingJob) -> Result<(), StoreError> {
        self.finish(job, JobState::Completed, "completed", self.keep_completed).await
    }

    async fn fail(&self, job: &TrackingJob) -> Result<(), StoreError> {
        self.finish(job, JobState::Failed, "failed", self.keep_failed).await
    }

    async fn get(&self, id: &str) -> Result<Option<TrackingJob>, StoreError> {
        self.load(id).await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .zcard(self.key("waiting"))
            .zcard(self.key("delayed"))
            .zcard(self.key("active"))
            .llen(self.key("completed"))
            .llen(self.key("failed"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            waiting: waiting + delayed,
            active,
            completed,
            failed,
            error: None,
        })
    }

    async fn recover_stalled(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = RECOVER_SCRIPT
            .key(self.key("active"))
            .key(self.key("waiting"))
            .key(self.key("scores"))
            .key(self.key("leases"))
            .arg(Self::now_ms())
            .invoke_async(&mut conn)
            .await?;

        for id in &ids {
            if let Some(mut job) = self.load(id).await? {
                job.state = JobState::Waiting;
                let json = serde_json::to_string(&job)?;
                let _: () = conn.set(self.job_key(id), json).await?;
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::models::{Location, TrackingPayload};
    use crate::queue::job::Priority;

    const LEASE: Duration = Duration::from_secs(30);

    /// Store under a throwaway prefix, or `None` when `REDIS_URL` is unset.
    async fn test_store(keep_completed: usize, keep_failed: usize) -> Option<RedisJobStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        let store = RedisJobStore::connect(&url, keep_completed, keep_failed)
            .await
            .expect("REDIS_URL is set but Redis is unreachable");
        Some(store.with_prefix(format!("serp-test-{}", Uuid::new_v4())))
    }

    async fn cleanup(store: &RedisJobStore) {
        let mut conn = store.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}:*", store.prefix)).await.unwrap();
        if !keys.is_empty() {
            let _: () = conn.del(keys).await.unwrap();
        }
    }

    fn job(keyword: &str, priority: Priority) -> TrackingJob {
        TrackingJob::new(
            TrackingPayload::adhoc(keyword, Location::named("Austin, TX")),
            priority,
            &QueueSettings::default(),
        )
    }

    #[test]
    fn keys_share_one_prefix() {
        assert_eq!(prefixed(DEFAULT_PREFIX, "waiting"), "serp:waiting");
        assert_eq!(prefixed(DEFAULT_PREFIX, "job:abc"), "serp:job:abc");
    }

    #[test]
    fn weight_dominates_sequence() {
        let late_high = 1.0 * WEIGHT_STRIDE + 999_999.0;
        let early_normal = 2.0 * WEIGHT_STRIDE + 1.0;
        assert!(late_high < early_normal);
    }

    #[tokio::test]
    async fn claims_by_priority_then_fifo() {
        let Some(store) = test_store(10, 5).await else { return };
        for (keyword, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("high", Priority::High),
            ("normal-2", Priority::Normal),
        ] {
            store.add(&job(keyword, priority), Duration::ZERO).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(job) = store.claim(LEASE).await.unwrap() {
            assert_eq!(job.state, JobState::Active);
            assert_eq!(job.attempts_made, 1);
            assert!(job.lease.is_some());
            order.push(job.payload.keyword);
        }
        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
        assert_eq!(store.stats().await.unwrap().active, 4);

        cleanup(&store).await;
    }

    #[tokio::test]
    async fn delayed_and_retried_jobs_wait_their_turn() {
        let Some(store) = test_store(10, 5).await else { return };
        store.add(&job("later", Priority::High), Duration::from_secs(60)).await.unwrap();
        assert!(store.claim(LEASE).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().waiting, 1);

        store.add(&job("now", Priority::Normal), Duration::ZERO).await.unwrap();
        let claimed = store.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.payload.keyword, "now");

        store.retry(&claimed, Duration::from_millis(50)).await.unwrap();
        let stored = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert!(store.claim(LEASE).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let retried = store.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(retried.id, claimed.id);
        assert_eq!(retried.attempts_made, 2);

        cleanup(&store).await;
    }

    #[tokio::test]
    async fn retention_purges_oldest_finished_jobs() {
        let Some(store) = test_store(2, 1).await else { return };
        let mut ids = Vec::new();
        for i in 0..3 {
            store.add(&job(&format!("kw-{}", i), Priority::Normal), Duration::ZERO).await.unwrap();
        }
        for _ in 0..3 {
            let job = store.claim(LEASE).await.unwrap().unwrap();
            ids.push(job.id.clone());
            store.complete(&job).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.active, stats.completed), (0, 2));
        assert!(store.get(&ids[0]).await.unwrap().is_none());
        assert_eq!(store.get(&ids[2]).await.unwrap().unwrap().state, JobState::Completed);

        let mut conn = store.conn.clone();
        let score: Option<String> = conn.hget(store.key("scores"), &ids[0]).await.unwrap();
        assert!(score.is_none());

        for i in 0..2 {
            store.add(&job(&format!("bad-{}", i), Priority::Normal), Duration::ZERO).await.unwrap();
        }
        while let Some(job) = store.claim(LEASE).await.unwrap() {
            store.fail(&job).await.unwrap();
        }
        assert_eq!(store.stats().await.unwrap().failed, 1);

        cleanup(&store).await;
    }

    #[tokio::test]
    async fn recovers_only_expired_leases() {
        let Some(store) = test_store(10, 5).await else { return };
        store.add(&job("stuck", Priority::Normal), Duration::ZERO).await.unwrap();
        store.add(&job("busy", Priority::Normal), Duration::ZERO).await.unwrap();
        let stuck = store.claim(Duration::ZERO).await.unwrap().unwrap();
        let busy = store.claim(LEASE).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let stalled = store.recover_stalled().await.unwrap();
        assert_eq!(stalled, vec![stuck.id.clone()]);
        assert_eq!(store.get(&stuck.id).await.unwrap().unwrap().state, JobState::Waiting);

        assert!(matches!(store.complete(&stuck).await, Err(StoreError::LeaseLost(_))));
        assert!(matches!(store.renew(&stuck, LEASE).await, Err(StoreError::LeaseLost(_))));

        let again = store.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, stuck.id);
        assert_eq!(again.attempts_made, 2);

        store.renew(&busy, LEASE).await.unwrap();
        store.complete(&busy).await.unwrap();
        store.complete(&again).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.waiting, stats.active, stats.completed), (0, 0, 2));

        cleanup(&store).await;
    }
}
