//! anilib - local anime library backend
//!
//! Serves the REST API under /api and keeps the background workers
//! (player tracking, auto-scan, transcode cleanup) running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anilib::config::Config;
use anilib::jobs::{self, auto_scanner::AutoScanner};
use anilib::media::mediastream::{MediastreamOptions, MediastreamRepository};
use anilib::services::anilist::{AnilistClient, Catalogue};
use anilib::services::anizip::{AnizipClient, EpisodeDb};
use anilib::services::events::EventBus;
use anilib::services::library_store::LibraryStore;
use anilib::services::mal::{MalClient, MalSync};
use anilib::services::media_entry::MediaEntryBuilder;
use anilib::services::playback::players::{PlayerTracker, create_player};
use anilib::services::playback::{PlaybackManager, PlaybackManagerOptions};
use anilib::services::rate_limiter::RateLimiter;
use anilib::services::scanner::Scanner;
use anilib::{AppState, build_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anilib=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!("Starting anilib");
    tracing::info!(library = %config.library_path.display(), "Configuration loaded");

    let events = EventBus::default();
    let cancel = CancellationToken::new();

    // Remote services
    let catalogue: Arc<dyn Catalogue> = Arc::new(AnilistClient::new(
        config.catalogue_url.clone(),
        config.anilist_token.clone(),
        config.anilist_username.clone(),
        RateLimiter::for_catalogue(),
    )?);
    let episode_db: Arc<dyn EpisodeDb> = Arc::new(AnizipClient::new(
        config.episode_db_url.clone(),
        RateLimiter::for_episode_db(),
    )?);
    let mal: Option<Arc<dyn MalSync>> = match &config.mal_token {
        Some(token) => Some(Arc::new(MalClient::new(config.mal_api_url.clone(), token.clone())?)),
        None => None,
    };

    let store = Arc::new(
        LibraryStore::open(&config.data_path)
            .await
            .context("Failed to open library store")?,
    );
    tracing::info!(files = store.local_files().len(), "Library store opened");

    let scanner = Arc::new(Scanner::new(
        config.library_path.clone(),
        catalogue.clone(),
        episode_db.clone(),
        store.clone(),
        events.clone(),
    ));
    let entries = Arc::new(MediaEntryBuilder::new(catalogue.clone(), episode_db.clone()));

    // Player tracking
    let player = create_player(&config)?;
    tracing::info!(player = %config.player, "Media player adapter created");
    let tracker = Arc::new(PlayerTracker::new(player));
    let playback = Arc::new(PlaybackManager::new(PlaybackManagerOptions {
        catalogue: catalogue.clone(),
        mal,
        store: store.clone(),
        entries: entries.clone(),
        tracker,
        events: events.clone(),
        auto_update_progress: config.auto_update_progress,
    }));
    if let Err(e) = playback.refresh_collection().await {
        tracing::warn!(error = %e, "Could not load the user collection, will retry on schedule");
    }
    tokio::spawn(playback.clone().run(cancel.clone()));

    // Streaming
    let mediastream = Arc::new(MediastreamRepository::new(
        MediastreamOptions::from_config(&config),
        store.clone(),
        events.clone(),
    ));
    if mediastream.init_transcoder().await {
        tracing::info!("Transcoder initialized");
    }

    // Auto-scan
    let _auto_scanner = if config.auto_scan {
        let auto_scanner = AutoScanner::new(
            scanner.clone(),
            Duration::from_secs(config.auto_scan_debounce_secs),
        );
        match auto_scanner.watch(&config.library_path, cancel.clone()) {
            Ok(()) => tracing::info!("Watching library for changes"),
            Err(e) => tracing::warn!(error = %e, "Auto-scan disabled"),
        }
        Some(auto_scanner)
    } else {
        None
    };

    let mut scheduler = jobs::start_scheduler(mediastream.clone(), playback.clone()).await?;
    tracing::info!("Job scheduler started");

    let state = AppState {
        config: config.clone(),
        store,
        scanner,
        entries,
        playback,
        mediastream: mediastream.clone(),
        events,
    };
    let app = build_app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid HOST/PORT")?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    cancel.cancel();
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Job scheduler did not shut down cleanly");
    }
    mediastream.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
