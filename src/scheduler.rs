use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::db::PersistenceAdapter;
use crate::queue::SerpQueue;

/// Start the daily tracking run. The caller owns the returned handle and shuts
/// it down with the rest of the service.
pub async fn start_scheduler(
    cron: &str,
    queue: SerpQueue,
    persistence: Arc<dyn PersistenceAdapter>,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await?;

    sched
        .add(Job::new_async(cron, move |_uuid, _l| {
            let queue = queue.clone();
            let persistence = persistence.clone();
            Box::pin(async move {
                info!("⏰ [Scheduler] Triggering daily tracking run...");
                match queue.schedule_all(persistence.as_ref()).await {
                    Ok(count) => info!("✅ [Scheduler] Queued {} tracking jobs", count),
                    Err(e) => error!("❌ [Scheduler] Daily tracking run failed: {}", e),
                }
            })
        })?)
        .await?;

    sched.start().await?;
    info!("✅ Scheduler started ({})", cron);

    Ok(sched)
}
