//! External media players
//!
//! Each adapter reports a [`PlayerStatus`]; [`PlayerTracker`] polls the
//! configured adapter and turns consecutive statuses into [`PlayerEvent`]s.

pub mod mpc;
pub mod mpv;
pub mod vlc;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

pub use mpc::MpcHc;
pub use mpv::Mpv;
pub use vlc::Vlc;

/// A video counts as watched past this fraction
pub const COMPLETION_THRESHOLD: f64 = 0.9;

const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Consecutive failed polls before tracking gives up
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayerKind {
    Mpv,
    Vlc,
    MpcHc,
}

impl PlayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerKind::Mpv => "mpv",
            PlayerKind::Vlc => "vlc",
            PlayerKind::MpcHc => "mpc-hc",
        }
    }
}

impl std::fmt::Display for PlayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PlayerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mpv" => Ok(PlayerKind::Mpv),
            "vlc" => Ok(PlayerKind::Vlc),
            "mpc-hc" | "mpchc" | "mpc" => Ok(PlayerKind::MpcHc),
            other => anyhow::bail!("unknown player '{other}'"),
        }
    }
}

/// What a player is doing right now
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatus {
    pub filename: String,
    /// Empty when the player does not expose it (VLC)
    pub filepath: String,
    /// Between 0 and 1
    pub completion_percentage: f64,
    pub playing: bool,
    pub duration_ms: i64,
}

impl PlayerStatus {
    /// Path when known, else the bare filename
    pub fn location(&self) -> &str {
        if self.filepath.is_empty() {
            &self.filename
        } else {
            &self.filepath
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    TrackingStarted(PlayerStatus),
    VideoCompleted(PlayerStatus),
    TrackingStopped(String),
    PlaybackStatus(PlayerStatus),
    TrackingRetry(String),
}

#[async_trait]
pub trait MediaPlayer: Send + Sync + 'static {
    fn kind(&self) -> PlayerKind;

    /// Open `path` and start playing, launching the player if needed
    async fn open(&self, path: &str) -> Result<()>;

    /// Current status, `None` when nothing is loaded
    async fn status(&self) -> Result<Option<PlayerStatus>>;

    async fn stop(&self) -> Result<()>;
}

/// Build the adapter selected in the config
pub fn create_player(config: &Config) -> Result<Arc<dyn MediaPlayer>> {
    Ok(match config.player {
        PlayerKind::Mpv => Arc::new(Mpv::new(&config.mpv_socket)),
        PlayerKind::Vlc => Arc::new(Vlc::new(&config.vlc_url, &config.vlc_password)?),
        PlayerKind::MpcHc => Arc::new(MpcHc::new(&config.mpc_url)?),
    })
}

/// Polls a player and publishes [`PlayerEvent`]s on a broadcast channel
pub struct PlayerTracker {
    player: Arc<dyn MediaPlayer>,
    tx: broadcast::Sender<PlayerEvent>,
    cancel: Mutex<Option<CancellationToken>>,
    poll_interval: Duration,
}

impl PlayerTracker {
    pub fn new(player: Arc<dyn MediaPlayer>) -> Self {
        Self::with_poll_interval(player, POLL_INTERVAL)
    }

    pub fn with_poll_interval(player: Arc<dyn MediaPlayer>, poll_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            player,
            tx,
            cancel: Mutex::new(None),
            poll_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    pub fn player(&self) -> &Arc<dyn MediaPlayer> {
        &self.player
    }

    pub fn is_tracking(&self) -> bool {
        self.cancel
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Open a file in the player and track it
    pub async fn play(&self, path: &str) -> Result<()> {
        debug!(player = %self.player.kind(), path, "Media requested");
        self.player.open(path).await?;
        self.start_tracking();
        Ok(())
    }

    /// Start a polling loop, replacing any previous one
    pub fn start_tracking(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(token.clone()) {
            debug!("Cancelling previous tracking loop");
            previous.cancel();
        }

        let player = self.player.clone();
        let tx = self.tx.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            track(player, tx, token, interval).await;
        });
    }

    /// Stop tracking normally
    pub async fn stop(&self) {
        self.end_tracking("Tracking stopped");
        if let Err(e) = self.player.stop().await {
            debug!(error = %e, "Player did not stop cleanly");
        }
    }

    /// Stop tracking after a failure upstream
    pub fn cancel(&self) {
        self.end_tracking("Something went wrong, tracking cancelled");
    }

    fn end_tracking(&self, reason: &str) {
        let Some(token) = self.cancel.lock().take() else {
            return;
        };
        // The loop cancels its own token when the player goes away
        if !token.is_cancelled() {
            token.cancel();
            let _ = self.tx.send(PlayerEvent::TrackingStopped(reason.to_string()));
        }
    }
}

async fn track(
    player: Arc<dyn MediaPlayer>,
    tx: broadcast::Sender<PlayerEvent>,
    token: CancellationToken,
    interval: Duration,
) {
    let mut filename = String::new();
    let mut completed = false;
    let mut retries = 0u32;

    info!(player = %player.kind(), "Tracking started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Tracking loop cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let status = match player.status().await {
            Ok(Some(status)) if status.duration_ms > 0 => status,
            outcome => {
                if let Err(e) = outcome {
                    debug!(error = %e, "Failed to get player status");
                }
                let _ = tx.send(PlayerEvent::TrackingRetry("Failed to get player status".into()));
                warn!(attempt = retries + 1, max = MAX_RETRIES, "Player status unavailable, retrying");

                // A finished video followed by silence means the player was closed
                let reason = if completed && retries >= 1 {
                    Some("Player closed")
                } else if retries + 1 >= MAX_RETRIES {
                    Some("Failed to get player status")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    let _ = tx.send(PlayerEvent::TrackingStopped(reason.to_string()));
                    token.cancel();
                    return;
                }
                retries += 1;
                continue;
            }
        };
        retries = 0;

        if filename != status.filename {
            debug!(filename = %status.filename, "Video started playing");
            filename = status.filename.clone();
            completed = false;
            let _ = tx.send(PlayerEvent::TrackingStarted(status.clone()));
        }

        if status.completion_percentage > COMPLETION_THRESHOLD && !completed {
            debug!(filename = %status.filename, "Video completed");
            completed = true;
            let _ = tx.send(PlayerEvent::VideoCompleted(status.clone()));
        }

        let _ = tx.send(PlayerEvent::PlaybackStatus(status));
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedPlayer, status};
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_player_kind_from_str() {
        assert_eq!("MPV".parse::<PlayerKind>().unwrap(), PlayerKind::Mpv);
        assert_eq!("mpc-hc".parse::<PlayerKind>().unwrap(), PlayerKind::MpcHc);
        assert!("winamp".parse::<PlayerKind>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_emits_lifecycle_events() {
        let player = Arc::new(ScriptedPlayer::new(vec![
            Some(status("ep06.mkv", 0.5)),
            Some(status("ep06.mkv", 0.95)),
            Some(status("ep06.mkv", 0.97)),
            None,
            None,
        ]));
        let tracker = PlayerTracker::with_poll_interval(player, Duration::from_millis(10));
        let mut rx = tracker.subscribe();
        tracker.start_tracking();

        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let stop = matches!(event, PlayerEvent::TrackingStopped(_));
            events.push(event);
            if stop {
                break;
            }
        }

        assert_matches!(&events[0], PlayerEvent::TrackingStarted(s) if s.filename == "ep06.mkv");
        let completions = events
            .iter()
            .filter(|e| matches!(e, PlayerEvent::VideoCompleted(_)))
            .count();
        assert_eq!(completions, 1);
        assert_matches!(events.last(), Some(PlayerEvent::TrackingStopped(reason)) if reason == "Player closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_player_stops_after_retries() {
        let player = Arc::new(ScriptedPlayer::new(vec![]));
        let tracker = PlayerTracker::with_poll_interval(player, Duration::from_millis(10));
        let mut rx = tracker.subscribe();
        tracker.start_tracking();

        let mut retries = 0;
        loop {
            match rx.recv().await.unwrap() {
                PlayerEvent::TrackingRetry(_) => retries += 1,
                PlayerEvent::TrackingStopped(reason) => {
                    assert_eq!(reason, "Failed to get player status");
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(retries, MAX_RETRIES);
    }
}
