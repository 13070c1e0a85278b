//! MPV over its JSON IPC socket

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{MediaPlayer, PlayerKind, PlayerStatus};

const IPC_TIMEOUT: Duration = Duration::from_secs(2);
const STARTUP_WAIT: Duration = Duration::from_secs(5);

pub struct Mpv {
    socket: String,
    binary: String,
    next_request: AtomicU64,
    process: Mutex<Option<Child>>,
}

impl Mpv {
    pub fn new(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            binary: "mpv".to_string(),
            next_request: AtomicU64::new(1),
            process: Mutex::new(None),
        }
    }

    /// Send one IPC command and wait for its reply
    async fn command(&self, args: Value) -> Result<Value> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut line = json!({ "command": args, "request_id": request_id }).to_string();
        line.push('\n');

        let reply = tokio::time::timeout(IPC_TIMEOUT, exchange(&self.socket, line, request_id))
            .await
            .context("mpv IPC timed out")??;

        match reply.get("error").and_then(Value::as_str) {
            Some("success") | None => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
            Some("property unavailable") => Ok(Value::Null),
            Some(other) => bail!("mpv error: {other}"),
        }
    }

    async fn property(&self, name: &str) -> Result<Value> {
        self.command(json!(["get_property", name])).await
    }

    /// Launch mpv with its IPC server and wait for the socket to accept
    async fn launch(&self, path: &str) -> Result<()> {
        info!(socket = %self.socket, "Starting mpv");
        let child = Command::new(&self.binary)
            .arg(format!("--input-ipc-server={}", self.socket))
            .arg("--force-window")
            .arg(path)
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start mpv")?;
        *self.process.lock().await = Some(child);

        let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.property("mpv-version").await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        bail!("mpv did not open its IPC socket at {}", self.socket)
    }
}

#[cfg(unix)]
async fn exchange(socket: &str, line: String, request_id: u64) -> Result<Value> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to mpv socket {socket}"))?;
    let (read, mut write) = stream.into_split();
    write.write_all(line.as_bytes()).await?;

    // Property-change events share the socket; skip until our reply arrives
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if value.get("request_id").and_then(Value::as_u64) == Some(request_id) {
            return Ok(value);
        }
    }
    bail!("mpv closed the IPC socket")
}

#[cfg(not(unix))]
async fn exchange(_socket: &str, _line: String, _request_id: u64) -> Result<Value> {
    bail!("mpv IPC is only supported over unix sockets")
}

#[async_trait]
impl MediaPlayer for Mpv {
    fn kind(&self) -> PlayerKind {
        PlayerKind::Mpv
    }

    async fn open(&self, path: &str) -> Result<()> {
        match self.command(json!(["loadfile", path, "replace"])).await {
            Ok(_) => {
                debug!(path, "Loaded file in running mpv");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "mpv not reachable, launching it");
                self.launch(path).await
            }
        }
    }

    async fn status(&self) -> Result<Option<PlayerStatus>> {
        let path = self.property("path").await?;
        let Some(filepath) = path.as_str() else {
            return Ok(None);
        };

        let filename = self.property("filename").await?;
        let position = self.property("time-pos").await?.as_f64().unwrap_or(0.0);
        let duration = self.property("duration").await?.as_f64().unwrap_or(0.0);
        let paused = self.property("pause").await?.as_bool().unwrap_or(false);

        Ok(Some(PlayerStatus {
            filename: filename.as_str().unwrap_or_default().to_string(),
            filepath: filepath.to_string(),
            completion_percentage: if duration > 0.0 { position / duration } else { 0.0 },
            playing: !paused,
            duration_ms: (duration * 1000.0) as i64,
        }))
    }

    async fn stop(&self) -> Result<()> {
        if let Err(e) = self.command(json!(["stop"])).await {
            warn!(error = %e, "Failed to stop mpv playback");
        }
        if let Some(mut child) = self.process.lock().await.take() {
            child.kill().await.context("Failed to kill mpv")?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// Answers every `get_property` from a fixed table
    async fn serve(listener: UnixListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let request: Value = serde_json::from_str(&line).unwrap();
                    let id = request["request_id"].clone();
                    let data = match request["command"][1].as_str() {
                        Some("path") => json!("/lib/Frieren - 05.mkv"),
                        Some("filename") => json!("Frieren - 05.mkv"),
                        Some("time-pos") => json!(1350.0),
                        Some("duration") => json!(1440.0),
                        Some("pause") => json!(false),
                        _ => Value::Null,
                    };
                    // An unrelated event first, as mpv does
                    let event = json!({ "event": "property-change" }).to_string() + "\n";
                    write.write_all(event.as_bytes()).await.unwrap();
                    let reply = json!({ "data": data, "error": "success", "request_id": id });
                    write.write_all((reply.to_string() + "\n").as_bytes()).await.unwrap();
                }
            });
        }
    }

    #[tokio::test]
    async fn test_status_over_ipc() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("mpv.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve(listener));

        let mpv = Mpv::new(socket.to_string_lossy());
        let status = mpv.status().await.unwrap().unwrap();
        assert_eq!(status.filename, "Frieren - 05.mkv");
        assert_eq!(status.duration_ms, 1_440_000);
        assert!((status.completion_percentage - 0.9375).abs() < 1e-9);
        assert!(status.playing);
    }

    #[tokio::test]
    async fn test_missing_socket_is_an_error() {
        let mpv = Mpv::new("/nonexistent/mpv.sock");
        assert!(mpv.status().await.is_err());
    }
}
