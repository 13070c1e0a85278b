//! Client tracking and stream garbage collection
//!
//! Every playlist and segment request reports where its client is. A single
//! task owns the bookkeeping and kills streams, renditions and encoder heads
//! nobody is watching anymore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::quality::Quality;

/// Clients not seen for this long are forgotten
const INACTIVE_TIME: Duration = Duration::from_secs(60 * 60);

/// Killed streams are removed from disk after this much idle time
const DESTROY_AFTER: Duration = Duration::from_secs(4 * 60 * 60);

/// A head jump this large means the client seeked
const SEEK_THRESHOLD: usize = 100;

/// What a request tells about its client. `None` fields keep the previous
/// value when the client stays on the same file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub client: String,
    pub path: String,
    pub quality: Option<Quality>,
    pub audio: Option<usize>,
    pub head: Option<usize>,
}

impl ClientInfo {
    pub fn new(client: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            path: path.into(),
            quality: None,
            audio: None,
            head: None,
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_audio(mut self, audio: usize) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_head(mut self, head: usize) -> Self {
        self.head = Some(head);
        self
    }
}

/// Operations the tracker performs on running streams
#[async_trait]
pub trait StreamControl: Send + Sync + 'static {
    /// Kill every encoder of a file; false when it has no streams
    fn kill_file(&self, path: &str) -> bool;

    /// Kill and remove a file's streams and output
    async fn destroy_file(&self, path: &str);

    fn kill_quality(&self, path: &str, quality: Quality);

    fn kill_audio(&self, path: &str, audio: usize);

    fn kill_orphaned_heads(
        &self,
        path: &str,
        quality: Option<Quality>,
        audio: Option<usize>,
        client_heads: &[usize],
    );
}

/// Handle to the tracker task
pub struct Tracker {
    tx: mpsc::UnboundedSender<ClientInfo>,
    cancel: CancellationToken,
}

impl Tracker {
    pub fn spawn(control: Arc<dyn StreamControl>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (deleted_tx, deleted_rx) = mpsc::unbounded_channel();
        let task = TrackerTask {
            control,
            clients: HashMap::new(),
            visit_date: HashMap::new(),
            last_usage: HashMap::new(),
            deleted_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(rx, deleted_rx));
        Self { tx, cancel }
    }

    pub fn track(&self, info: ClientInfo) {
        if self.tx.send(info).is_err() {
            debug!("Tracker stopped, dropping client info");
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TrackerTask {
    control: Arc<dyn StreamControl>,
    clients: HashMap<String, ClientInfo>,
    visit_date: HashMap<String, Instant>,
    last_usage: HashMap<String, Instant>,
    deleted_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl TrackerTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ClientInfo>,
        mut deleted_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let mut purge = interval_at(Instant::now() + INACTIVE_TIME, INACTIVE_TIME);
        info!("Transcode tracker started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                info = rx.recv() => match info {
                    Some(info) => self.on_client_info(info),
                    None => break,
                },
                _ = purge.tick() => self.purge_inactive(),
                Some(path) = deleted_rx.recv() => self.destroy_if_old(&path).await,
            }
        }
        info!("Transcode tracker stopped");
    }

    fn on_client_info(&mut self, mut info: ClientInfo) {
        let old = self.clients.get(&info.client).cloned();

        // Most routes only report part of the picture
        if let Some(old) = old.as_ref().filter(|o| o.path == info.path) {
            info.quality = info.quality.or(old.quality);
            info.audio = info.audio.or(old.audio);
            info.head = info.head.or(old.head);
        }

        let now = Instant::now();
        self.visit_date.insert(info.client.clone(), now);
        self.last_usage.insert(info.path.clone(), now);
        self.clients.insert(info.client.clone(), info.clone());

        let Some(old) = old else {
            return;
        };
        if old.path != info.path {
            self.kill_file_if_dead(&old.path);
            return;
        }
        if let Some(audio) = old.audio.filter(|a| Some(*a) != info.audio) {
            self.kill_audio_if_dead(&old.path, audio);
        }
        if let Some(quality) = old.quality.filter(|q| Some(*q) != info.quality) {
            self.kill_quality_if_dead(&old.path, quality);
        }
        if let (Some(old_head), Some(head)) = (old.head, info.head) {
            if old_head.abs_diff(head) > SEEK_THRESHOLD {
                self.kill_orphaned_heads(&old.path, old.quality, old.audio);
            }
        }
    }

    fn purge_inactive(&mut self) {
        let expired: Vec<String> = self
            .visit_date
            .iter()
            .filter(|(_, date)| date.elapsed() >= INACTIVE_TIME)
            .map(|(client, _)| client.clone())
            .collect();

        for client in expired {
            self.visit_date.remove(&client);
            let Some(info) = self.clients.remove(&client) else {
                continue;
            };
            debug!(client = %client, path = %info.path, "Client inactive");
            if self.kill_file_if_dead(&info.path) {
                continue;
            }
            let audio_cleaned = info
                .audio
                .is_some_and(|a| self.kill_audio_if_dead(&info.path, a));
            let video_cleaned = info
                .quality
                .is_some_and(|q| self.kill_quality_if_dead(&info.path, q));
            if !audio_cleaned || !video_cleaned {
                self.kill_orphaned_heads(&info.path, info.quality, info.audio);
            }
        }
    }

    fn kill_file_if_dead(&self, path: &str) -> bool {
        if self.clients.values().any(|c| c.path == path) {
            return false;
        }
        if !self.control.kill_file(path) {
            return false;
        }
        info!(path = %path, "Nobody is watching, killing streams");

        let deleted_tx = self.deleted_tx.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DESTROY_AFTER).await;
            let _ = deleted_tx.send(path);
        });
        true
    }

    fn kill_audio_if_dead(&self, path: &str, audio: usize) -> bool {
        if self
            .clients
            .values()
            .any(|c| c.path == path && c.audio == Some(audio))
        {
            return false;
        }
        debug!(path = %path, audio, "Nobody is listening to audio track, killing it");
        self.control.kill_audio(path, audio);
        true
    }

    fn kill_quality_if_dead(&self, path: &str, quality: Quality) -> bool {
        if self
            .clients
            .values()
            .any(|c| c.path == path && c.quality == Some(quality))
        {
            return false;
        }
        debug!(path = %path, quality = %quality, "Nobody is watching quality, killing it");
        self.control.kill_quality(path, quality);
        true
    }

    fn kill_orphaned_heads(&self, path: &str, quality: Option<Quality>, audio: Option<usize>) {
        if let Some(quality) = quality {
            let heads = self.heads(|c| c.path == path && c.quality == Some(quality));
            self.control
                .kill_orphaned_heads(path, Some(quality), None, &heads);
        }
        if let Some(audio) = audio {
            let heads = self.heads(|c| c.path == path && c.audio == Some(audio));
            self.control.kill_orphaned_heads(path, None, Some(audio), &heads);
        }
    }

    fn heads(&self, filter: impl Fn(&ClientInfo) -> bool) -> Vec<usize> {
        self.clients
            .values()
            .filter(|c| filter(c))
            .filter_map(|c| c.head)
            .collect()
    }

    async fn destroy_if_old(&mut self, path: &str) {
        if self
            .last_usage
            .get(path)
            .is_some_and(|used| used.elapsed() < DESTROY_AFTER)
        {
            return;
        }
        self.last_usage.remove(path);
        info!(path = %path, "Destroying idle streams");
        self.control.destroy_file(path).await;
    }
}
