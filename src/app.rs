//! Application state and HTTP router construction.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::config::Config;
use crate::media::mediastream::MediastreamRepository;
use crate::services::events::EventBus;
use crate::services::library_store::LibraryStore;
use crate::services::media_entry::MediaEntryBuilder;
use crate::services::playback::PlaybackManager;
use crate::services::scanner::Scanner;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<LibraryStore>,
    pub scanner: Arc<Scanner>,
    pub entries: Arc<MediaEntryBuilder>,
    pub playback: Arc<PlaybackManager>,
    pub mediastream: Arc<MediastreamRepository>,
    pub events: EventBus,
}

/// Build the full Axum router: `/api`, `/healthz` and layers.
/// Returns `Router<()>` (state fully applied) for use with `axum::serve`.
pub fn build_app(state: AppState) -> Router<()> {
    Router::new()
        .nest("/api", api::router())
        .merge(api::health::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
