//! Client event bus
//!
//! Everything the web client is told about asynchronously goes through here:
//! scan progress, playback tracking, toasts and transcoder shutdowns.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::playback::PlaybackState;
use super::playback::playlist::PlaylistSnapshot;

/// Events pushed to connected clients
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    ScanProgress {
        percent: u8,
        message: String,
    },
    ProgressTrackingStarted {
        state: PlaybackState,
    },
    ProgressTrackingStopped {
        reason: String,
    },
    ProgressVideoCompleted {
        state: PlaybackState,
    },
    PlaybackStatus {
        state: PlaybackState,
    },
    ProgressUpdated {
        state: PlaybackState,
    },
    ErrorToast {
        message: String,
    },
    InfoToast {
        message: String,
    },
    MediastreamShutdownStream {
        reason: String,
    },
    PlaylistState {
        playlist: Option<PlaylistSnapshot>,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::ScanProgress { .. } => "scan_progress",
            ClientEvent::ProgressTrackingStarted { .. } => "progress_tracking_started",
            ClientEvent::ProgressTrackingStopped { .. } => "progress_tracking_stopped",
            ClientEvent::ProgressVideoCompleted { .. } => "progress_video_completed",
            ClientEvent::PlaybackStatus { .. } => "playback_status",
            ClientEvent::ProgressUpdated { .. } => "progress_updated",
            ClientEvent::ErrorToast { .. } => "error_toast",
            ClientEvent::InfoToast { .. } => "info_toast",
            ClientEvent::MediastreamShutdownStream { .. } => "mediastream_shutdown_stream",
            ClientEvent::PlaylistState { .. } => "playlist_state",
        }
    }
}

/// Broadcast bus shared by every service; clones publish to the same channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn send(&self, event: ClientEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(event = kind, "No subscribers for client event");
        }
    }

    pub fn error_toast(&self, message: impl Into<String>) {
        self.send(ClientEvent::ErrorToast {
            message: message.into(),
        });
    }

    pub fn info_toast(&self, message: impl Into<String>) {
        self.send(ClientEvent::InfoToast {
            message: message.into(),
        });
    }
}
