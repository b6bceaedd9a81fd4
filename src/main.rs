use anyhow::Context;
use dotenv::dotenv;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use serp_tracker::api::{self, AppState};
use serp_tracker::config::Config;
use serp_tracker::db::{self, PersistenceAdapter, PgPersistence};
use serp_tracker::monitor;
use serp_tracker::queue::SerpQueue;
use serp_tracker::renderer::{ChromeRenderer, Renderer};
use serp_tracker::scheduler;
use serp_tracker::worker::Pipeline;

const DB_CONNECT_ATTEMPTS: u32 = 15;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let pool = connect_db(&config).await?;
    db::init_db(&pool).await.context("failed to initialise schema")?;

    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(PgPersistence::new(pool));
    let renderer: Arc<dyn Renderer> = Arc::new(ChromeRenderer::new(config.renderer.clone()));
    let pipeline = Pipeline::new(renderer.clone(), persistence.clone());

    let queue = SerpQueue::connect(
        config.queue_store,
        &config.redis_url,
        config.queue.clone(),
        Pipeline::new(renderer.clone(), persistence.clone()),
    )
    .await;
    match &queue {
        SerpQueue::Active(_) => info!(
            "✅ Job queue ready ({} workers, {:?} store)",
            config.queue.concurrency, config.queue_store
        ),
        SerpQueue::Degraded(degraded) => warn!(
            "⚠️ Job queue unavailable, running degraded: {}",
            degraded.reason()
        ),
    }
    let monitor = monitor::spawn_monitor(queue.subscribe());
    queue.start().await;

    let mut sched = match scheduler::start_scheduler(&config.schedule_cron, queue.clone(), persistence.clone()).await {
        Ok(sched) => Some(sched),
        Err(e) => {
            error!("🔥 Scheduler Error: {}", e);
            None
        }
    };

    let state = Arc::new(AppState {
        queue: queue.clone(),
        pipeline: Arc::new(pipeline),
        persistence,
    });
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    if let Some(sched) = sched.as_mut() {
        if let Err(e) = sched.shutdown().await {
            warn!("⚠️ Scheduler shutdown failed: {}", e);
        }
    }
    queue.close().await;
    renderer.shutdown().await;
    monitor.abort();
    info!("👋 Bye");

    Ok(())
}

async fn connect_db(config: &Config) -> anyhow::Result<PgPool> {
    info!("🔌 Connecting to Database...");
    let mut attempts = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                info!("✅ Database Connected!");
                return Ok(pool);
            }
            Err(e) => {
                attempts += 1;
                if attempts >= DB_CONNECT_ATTEMPTS {
                    error!(
                        "🔥 CRITICAL: Failed to connect to DB after {} attempts.",
                        DB_CONNECT_ATTEMPTS
                    );
                    return Err(e).context("database connection failed");
                }
                warn!(
                    "⚠️ DB Connect failed ({}), retrying in 2s... (Attempt {}/{})",
                    e, attempts, DB_CONNECT_ATTEMPTS
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
