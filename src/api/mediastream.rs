//! Media streaming endpoints
//!
//! - `POST /mediastream/request` picks the file and stream type
//! - `/mediastream/transcode/...` serves HLS playlists and segments
//! - `/mediastream/direct` serves the file itself, with range support
//! - `/mediastream/subs/{name}` and `/mediastream/att/{name}` serve extracted
//!   subtitles and fonts

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use crate::AppState;
use crate::media::mediastream::{MediaContainer, StreamType};
use crate::media::transcoder::{self, Quality, TranscodeError, Transcoder};

const CLIENT_ID_HEADER: &str = "x-client-id";
const DEFAULT_CLIENT: &str = "default";
const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContainer {
    pub path: String,
    pub stream_type: StreamType,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    /// Source file; defaults to the current container
    pub file: Option<String>,
    pub client_id: Option<String>,
}

fn transcode_error(e: TranscodeError) -> ApiError {
    let status = match &e {
        TranscodeError::InvalidPath
        | TranscodeError::NoMediaRequested
        | TranscodeError::NotInitialized
        | TranscodeError::UnknownQuality(_)
        | TranscodeError::UnknownAudio(_) => StatusCode::BAD_REQUEST,
        TranscodeError::SegmentTimeout(_)
        | TranscodeError::FfmpegFailed(_)
        | TranscodeError::StreamKilled(_)
        | TranscodeError::Probe(_)
        | TranscodeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "Mediastream request failed");
    }
    (status, e.to_string())
}

fn client_id(headers: &HeaderMap, query: &StreamQuery) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.client_id.clone())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CLIENT.to_string())
}

fn playlist(body: String) -> Response {
    ([(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], body).into_response()
}

async fn segment(path: PathBuf) -> Result<Response, ApiError> {
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| transcode_error(e.into()))?;
    Ok(([(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)], bytes).into_response())
}

async fn serve_file(path: PathBuf, request: Request) -> Response {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Transcoder and container for a transcode request
async fn transcode_target(
    state: &AppState,
    query: &StreamQuery,
) -> Result<(Arc<Transcoder>, Arc<MediaContainer>), ApiError> {
    let transcoder = state.mediastream.transcoder().map_err(transcode_error)?;
    let container = state
        .mediastream
        .container_for(query.file.as_deref())
        .await
        .map_err(transcode_error)?;
    Ok((transcoder, container))
}

async fn request_container(
    State(state): State<AppState>,
    Json(body): Json<RequestContainer>,
) -> Result<Json<MediaContainer>, ApiError> {
    state
        .mediastream
        .request_media_container(&body.path, body.stream_type)
        .await
        .map(|container| Json(container.as_ref().clone()))
        .map_err(transcode_error)
}

async fn shutdown_stream(State(state): State<AppState>) -> StatusCode {
    state.mediastream.shutdown_transcode_stream().await;
    StatusCode::NO_CONTENT
}

async fn master(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (transcoder, container) = transcode_target(&state, &query).await?;
    let client = client_id(&headers, &query);
    transcoder
        .get_master(&container.filepath, &container.media_info, &client)
        .await
        .map(playlist)
        .map_err(transcode_error)
}

async fn video_index(
    State(state): State<AppState>,
    Path(quality): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let quality: Quality = quality.parse().map_err(transcode_error)?;
    let (transcoder, container) = transcode_target(&state, &query).await?;
    let client = client_id(&headers, &query);
    transcoder
        .get_video_index(&container.filepath, &container.media_info, quality, &client)
        .await
        .map(playlist)
        .map_err(transcode_error)
}

async fn audio_index(
    State(state): State<AppState>,
    Path(audio): Path<usize>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (transcoder, container) = transcode_target(&state, &query).await?;
    let client = client_id(&headers, &query);
    transcoder
        .get_audio_index(&container.filepath, &container.media_info, audio, &client)
        .await
        .map(playlist)
        .map_err(transcode_error)
}

async fn video_segment(
    State(state): State<AppState>,
    Path((quality, name)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let quality: Quality = quality.parse().map_err(transcode_error)?;
    let number = transcoder::parse_segment(&name).map_err(transcode_error)?;
    let (transcoder, container) = transcode_target(&state, &query).await?;
    let client = client_id(&headers, &query);
    let path = transcoder
        .get_video_segment(&container.filepath, &container.media_info, quality, number, &client)
        .await
        .map_err(transcode_error)?;
    segment(path).await
}

async fn audio_segment(
    State(state): State<AppState>,
    Path((audio, name)): Path<(usize, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let number = transcoder::parse_segment(&name).map_err(transcode_error)?;
    let (transcoder, container) = transcode_target(&state, &query).await?;
    let client = client_id(&headers, &query);
    let path = transcoder
        .get_audio_segment(&container.filepath, &container.media_info, audio, number, &client)
        .await
        .map_err(transcode_error)?;
    segment(path).await
}

/// The current container's file, for `direct` and `optimized` playback
async fn direct(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let container = state
        .mediastream
        .current_container()
        .map_err(transcode_error)?;
    if container.stream_type == StreamType::Transcode {
        return Err(transcode_error(TranscodeError::InvalidPath));
    }
    debug!(path = %container.filepath, "Serving file directly");
    Ok(serve_file(PathBuf::from(&container.filepath), request).await)
}

async fn subtitles(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = state.mediastream.subtitle_path(&name).map_err(transcode_error)?;
    Ok(serve_file(path, request).await)
}

async fn attachments(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = state
        .mediastream
        .attachment_path(&name)
        .map_err(transcode_error)?;
    Ok(serve_file(path, request).await)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/mediastream/request", post(request_container))
        .route("/mediastream/shutdown", post(shutdown_stream))
        .route("/mediastream/transcode/master.m3u8", get(master))
        .route("/mediastream/transcode/{quality}/index.m3u8", get(video_index))
        .route("/mediastream/transcode/{quality}/{segment}", get(video_segment))
        .route("/mediastream/transcode/audio/{audio}/index.m3u8", get(audio_index))
        .route("/mediastream/transcode/audio/{audio}/{segment}", get(audio_segment))
        .route("/mediastream/direct", get(direct))
        .route("/mediastream/subs/{name}", get(subtitles))
        .route("/mediastream/att/{name}", get(attachments))
}
