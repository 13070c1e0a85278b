//! API route definitions
//!
//! Everything but the health check is nested under `/api` by [`crate::app::build_app`].

pub mod events;
pub mod health;
pub mod library;
pub mod mediastream;
pub mod playback;

use axum::Router;

use crate::AppState;

/// Routes served under `/api`
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(library::router())
        .merge(playback::router())
        .merge(mediastream::router())
        .merge(events::router())
}
