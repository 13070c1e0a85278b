//! Library REST endpoints: scanning, local files and media entries

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::AppState;
use crate::services::local_file::LocalFile;
use crate::services::media_entry::MediaEntry;
use crate::services::scanner::{ScanError, ScanOptions, ScanSummary};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    /// Overrides the configured enhanced scanning
    pub enhanced: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub local_files: Vec<LocalFile>,
    pub summary: ScanSummary,
}

fn scan_error(e: ScanError) -> (StatusCode, String) {
    let status = match &e {
        ScanError::NoLocalFiles => StatusCode::NOT_FOUND,
        ScanError::Cancelled => StatusCode::CONFLICT,
        ScanError::CollectionUnavailable(_) => StatusCode::BAD_GATEWAY,
        ScanError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Run a full scan and return the new local files
async fn scan(
    State(state): State<AppState>,
    body: Option<Json<ScanRequest>>,
) -> Result<Json<ScanResponse>, (StatusCode, String)> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let options = ScanOptions {
        enhanced: request.enhanced.unwrap_or(state.config.enhanced_scan),
    };
    let outcome = state
        .scanner
        .scan(options, CancellationToken::new())
        .await
        .map_err(scan_error)?;
    Ok(Json(ScanResponse {
        local_files: outcome.files,
        summary: outcome.summary,
    }))
}

async fn local_files(State(state): State<AppState>) -> Json<Vec<LocalFile>> {
    Json(state.store.local_files())
}

/// Media entry of a matched media
async fn entry(
    State(state): State<AppState>,
    Path(media_id): Path<i32>,
) -> Result<Json<MediaEntry>, (StatusCode, String)> {
    let mut collection = state.playback.collection();
    if collection.lists.is_empty() {
        if let Err(e) = state.playback.refresh_collection().await {
            warn!(error = %e, "Could not refresh the collection for a media entry");
        }
        collection = state.playback.collection();
    }

    let files = state.store.files_for_media(media_id);
    state
        .entries
        .build(media_id, &files, &collection)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::NOT_FOUND, format!("{e:#}")))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/library/scan", post(scan))
        .route("/library/local-files", get(local_files))
        .route("/library/entry/{media_id}", get(entry))
}
