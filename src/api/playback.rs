//! Playback REST endpoints: external player control, playlists and
//! progress sync

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::services::local_file::LocalFile;
use crate::services::playback::PlaybackError;
use crate::services::playback::playlist::PlaylistSnapshot;

#[derive(Debug, Deserialize)]
pub struct PlayRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistRequest {
    pub name: Option<String>,
    /// Explicit files, in order
    #[serde(default)]
    pub paths: Vec<String>,
    /// Every main episode of a media, in episode order
    pub media_id: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
}

fn playback_error(e: PlaybackError) -> (StatusCode, String) {
    let status = match &e {
        PlaybackError::NoCurrentEntry
        | PlaybackError::MediaNotInCollection(_)
        | PlaybackError::LocalFileNotFound(_)
        | PlaybackError::NotMatched(_) => StatusCode::BAD_REQUEST,
        PlaybackError::ProgressUpdateAnilist(_) | PlaybackError::ProgressUpdateMal(_) => {
            StatusCode::BAD_GATEWAY
        }
        PlaybackError::Entry(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn bad_request(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, format!("{e:#}"))
}

/// Push the current episode's progress to the catalogue
async fn sync(State(state): State<AppState>) -> Result<Json<ActionResponse>, (StatusCode, String)> {
    state
        .playback
        .sync_current_progress()
        .await
        .map_err(playback_error)?;
    Ok(Json(ActionResponse { success: true }))
}

/// Open a single file in the external player
async fn play(
    State(state): State<AppState>,
    Json(body): Json<PlayRequest>,
) -> Result<Json<ActionResponse>, (StatusCode, String)> {
    state.playback.play(&body.path).await.map_err(bad_request)?;
    Ok(Json(ActionResponse { success: true }))
}

async fn start_playlist(
    State(state): State<AppState>,
    Json(body): Json<PlaylistRequest>,
) -> Result<Json<PlaylistSnapshot>, (StatusCode, String)> {
    let files: Vec<LocalFile> = match body.media_id {
        Some(media_id) => {
            let mut files: Vec<LocalFile> = state
                .store
                .files_for_media(media_id)
                .into_iter()
                .filter(LocalFile::is_main)
                .collect();
            files.sort_by_key(|f| f.metadata.episode);
            files
        }
        None => body
            .paths
            .iter()
            .filter_map(|p| state.store.find(p))
            .collect(),
    };
    if files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "playlist is empty".to_string()));
    }

    let name = body.name.unwrap_or_else(|| "Playlist".to_string());
    let playlist = state.playback.playlist();
    playlist.start(name, files).await.map_err(bad_request)?;
    playlist
        .snapshot()
        .map(Json)
        .ok_or_else(|| (StatusCode::CONFLICT, "playlist stopped".to_string()))
}

async fn resume_playlist(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, (StatusCode, String)> {
    state.playback.playlist().resume().await.map_err(bad_request)?;
    Ok(Json(ActionResponse { success: true }))
}

async fn current_playlist(State(state): State<AppState>) -> Json<Option<PlaylistSnapshot>> {
    Json(state.playback.playlist().snapshot())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/playback/sync", post(sync))
        .route("/playback/play", post(play))
        .route("/playback/playlist", post(start_playlist).get(current_playlist))
        .route("/playback/playlist/resume", post(resume_playlist))
}
