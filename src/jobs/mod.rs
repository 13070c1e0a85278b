//! Background job scheduling and workers

pub mod auto_scanner;
pub mod transcode_gc;

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::media::mediastream::MediastreamRepository;
use crate::services::playback::PlaybackManager;

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    mediastream: Arc<MediastreamRepository>,
    playback: Arc<PlaybackManager>,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Transcode output cleanup - run every hour
    let gc_mediastream = mediastream.clone();
    let gc_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let mediastream = gc_mediastream.clone();
        Box::pin(async move {
            if let Err(e) = transcode_gc::cleanup_cache(&mediastream).await {
                tracing::error!("Transcode GC error: {}", e);
            }
        })
    })?;
    scheduler.add(gc_job).await?;

    // User collection refresh - run every 15 minutes so progress checks
    // see changes made from other clients
    let refresh_playback = playback.clone();
    let refresh_job = Job::new_async("0 */15 * * * *", move |_uuid, _l| {
        let playback = refresh_playback.clone();
        Box::pin(async move {
            if let Err(e) = playback.refresh_collection().await {
                tracing::warn!("Collection refresh error: {:#}", e);
            }
        })
    })?;
    scheduler.add(refresh_job).await?;

    scheduler.start().await?;

    info!("Job scheduler started");
    Ok(scheduler)
}
