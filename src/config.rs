use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Queue tuning. Every field is a default that can be overridden from the
/// environment; none of them is known to be tuned for the target site.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub attempt_timeout: Duration,
    pub max_initial_delay: Duration,
    pub schedule_pacing: Duration,
    pub poll_interval: Duration,
    /// How long a claimed job stays owned without a renewal. Jobs whose lease
    /// runs out are put back in the waiting set by any instance.
    pub lease: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(60),
            max_initial_delay: Duration::from_secs(30),
            schedule_pacing: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
            keep_completed: 10,
            keep_failed: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    pub viewport: (u32, u32),
    pub user_agent: String,
    pub results_per_page: u32,
    pub navigation_timeout: Duration,
    pub results_timeout: Duration,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            viewport: (1366, 768),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36".to_string(),
            results_per_page: 100,
            navigation_timeout: Duration::from_secs(30),
            results_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStoreKind {
    Redis,
    Memory,
}

impl FromStr for QueueStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown queue store '{}', expected redis or memory", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub port: u16,
    pub redis_url: String,
    pub queue_store: QueueStoreKind,
    pub schedule_cron: String,
    pub queue: QueueSettings,
    pub renderer: RendererSettings,
}

impl Config {
    /// Read configuration from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let queue_defaults = QueueSettings::default();
        let queue = QueueSettings {
            concurrency: env_parse("WORKER_CONCURRENCY", queue_defaults.concurrency)?,
            max_attempts: env_parse("QUEUE_MAX_ATTEMPTS", queue_defaults.max_attempts)?,
            backoff_base: env_millis("QUEUE_BACKOFF_MS", queue_defaults.backoff_base)?,
            attempt_timeout: env_millis("QUEUE_JOB_TIMEOUT_MS", queue_defaults.attempt_timeout)?,
            max_initial_delay: env_millis("QUEUE_MAX_DELAY_MS", queue_defaults.max_initial_delay)?,
            schedule_pacing: env_millis("SCHEDULE_PACING_MS", queue_defaults.schedule_pacing)?,
            lease: env_millis("QUEUE_LEASE_MS", queue_defaults.lease)?,
            ..queue_defaults
        };
        if queue.concurrency == 0 || queue.max_attempts == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY and QUEUE_MAX_ATTEMPTS must be at least 1"));
        }
        if queue.lease < Duration::from_millis(30) {
            return Err(anyhow!("QUEUE_LEASE_MS must be at least 30"));
        }

        let renderer_defaults = RendererSettings::default();
        let renderer = RendererSettings {
            chrome_path: env::var("CHROME_EXECUTABLE_PATH").ok().map(PathBuf::from),
            headless: env_parse("CHROME_HEADLESS", renderer_defaults.headless)?,
            results_per_page: env_parse("SERP_RESULTS_PER_PAGE", renderer_defaults.results_per_page)?,
            ..renderer_defaults
        };

        Ok(Self {
            database_url,
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5)?,
            port: env_parse("PORT", 3001)?,
            redis_url: redis_url_from_env(),
            queue_store: env_parse("QUEUE_STORE", QueueStoreKind::Redis)?,
            schedule_cron: env::var("SCHEDULE_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            queue,
            renderer,
        })
    }
}

/// `REDIS_URL` wins; otherwise the URL is assembled from host, port and password.
fn redis_url_from_env() -> String {
    if let Ok(url) = env::var("REDIS_URL") {
        return url;
    }
    let host = env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
    let password = env::var("REDIS_PASSWORD").ok();
    build_redis_url(&host, &port, password.as_deref())
}

fn build_redis_url(host: &str, port: &str, password: Option<&str>) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(pw) => format!("redis://:{}@{}:{}", urlencoding::encode(pw), host, port),
        None => format!("redis://{}:{}", host, port),
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => parse_value::<u64>(key, &raw).map(Duration::from_millis),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow!("invalid value for {}: '{}' ({})", key, raw, e))
}
