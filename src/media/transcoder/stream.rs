//! Segment scheduling for one rendition (a video quality or an audio track)
//!
//! Each segment carries a one-shot readiness signal. Encoders ("heads") cover
//! a contiguous range of segments; a segment miss either waits for a nearby
//! head or spawns a new one. Head slots are never reused, so a slot index
//! doubles as the encoder id baked into segment filenames.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::TranscodeError;
use super::keyframes::Keyframes;
use super::settings::TranscoderSettings;

/// Segments one encoder covers at most
const MAX_HEAD_SEGMENTS: usize = 100;

/// Media seconds a waiting request tolerates between it and the nearest head
const MAX_ENCODER_DISTANCE: f64 = 60.0;

pub const SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Segments looked ahead after serving one
const PREPARE_AHEAD: usize = 10;

/// Heads farther than this from every client are orphans
const ORPHAN_DISTANCE: usize = 20;

/// Time ffmpeg gets to exit after SIGINT
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// What differs between video and audio renditions
pub trait StreamHandle: Send + Sync + 'static {
    /// Used in segment filenames: `720p`, `a1`
    fn label(&self) -> String;

    fn is_video(&self) -> bool;

    /// Codec arguments; `segment_times` is the comma-separated list of
    /// forced keyframe timestamps
    fn transcode_args(&self, segment_times: &str) -> Vec<String>;
}

struct Segment {
    ready: watch::Sender<bool>,
    encoder: Option<usize>,
}

impl Segment {
    fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            ready,
            encoder: None,
        }
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

#[derive(Debug, Clone)]
struct Head {
    /// Last segment this encoder produced, or its start
    segment: usize,
    end: usize,
    stop: CancellationToken,
}

#[derive(Debug, Clone)]
enum HeadSlot {
    Running(Head),
    Deleted,
}

impl HeadSlot {
    fn running(&self) -> Option<&Head> {
        match self {
            HeadSlot::Running(head) => Some(head),
            HeadSlot::Deleted => None,
        }
    }
}

struct StreamState {
    segments: Vec<Segment>,
    heads: Vec<HeadSlot>,
}

impl StreamState {
    fn is_transcoding(&self, segment: usize) -> bool {
        self.heads
            .iter()
            .filter_map(HeadSlot::running)
            .any(|h| h.segment == segment)
    }

    fn is_scheduled(&self, segment: usize) -> bool {
        self.heads
            .iter()
            .filter_map(HeadSlot::running)
            .any(|h| h.segment <= segment && segment < h.end)
    }

    fn kill_head(&mut self, encoder_id: usize) {
        if let Some(slot) = self.heads.get_mut(encoder_id) {
            if let HeadSlot::Running(head) = slot {
                head.stop.cancel();
                trace!(encoder_id, "Encoder head killed");
            }
            *slot = HeadSlot::Deleted;
        }
    }
}

/// What the stdout reader should do after a segment was reported
#[derive(Debug, PartialEq, Eq)]
enum SegmentOutcome {
    Continue,
    /// The head reached its end and exits on its own
    Finished,
    /// Someone else already produced what follows
    Stop,
}

pub struct Stream {
    handle: Box<dyn StreamHandle>,
    file_path: PathBuf,
    out_dir: PathBuf,
    duration: f64,
    keyframes: Arc<Keyframes>,
    settings: Arc<TranscoderSettings>,
    state: RwLock<StreamState>,
    /// Cancelled by `kill` to release waiting requests
    kill_signal: Mutex<CancellationToken>,
}

impl Stream {
    pub fn new(
        handle: Box<dyn StreamHandle>,
        file_path: PathBuf,
        out_dir: PathBuf,
        duration: f64,
        keyframes: Arc<Keyframes>,
        settings: Arc<TranscoderSettings>,
    ) -> Arc<Self> {
        let (length, done) = keyframes.length();
        let stream = Arc::new(Self {
            handle,
            file_path,
            out_dir,
            duration,
            keyframes: keyframes.clone(),
            settings,
            state: RwLock::new(StreamState {
                segments: (0..length).map(|_| Segment::new()).collect(),
                heads: Vec::new(),
            }),
            kill_signal: Mutex::new(CancellationToken::new()),
        });

        if !done {
            let weak: Weak<Stream> = Arc::downgrade(&stream);
            keyframes.add_listener(move |all| {
                if let Some(stream) = weak.upgrade() {
                    let mut state = stream.state.write();
                    while state.segments.len() < all.len() {
                        state.segments.push(Segment::new());
                    }
                }
            });
        }
        stream
    }

    pub fn label(&self) -> String {
        self.handle.label()
    }

    /// Filename template of an encoder's output, `%d` being the segment
    fn out_pattern(&self, encoder_id: usize) -> PathBuf {
        self.out_dir
            .join(format!("segment-{}-{encoder_id}-%d.ts", self.handle.label()))
    }

    fn segment_path(&self, encoder_id: usize, segment: usize) -> PathBuf {
        self.out_dir.join(format!(
            "segment-{}-{encoder_id}-{segment}.ts",
            self.handle.label()
        ))
    }

    /// HLS media playlist. The last segment and `ENDLIST` only appear once
    /// keyframe analysis is done.
    pub fn index(&self) -> String {
        let mut index = String::from(
            "#EXTM3U\n\
             #EXT-X-VERSION:6\n\
             #EXT-X-PLAYLIST-TYPE:EVENT\n\
             #EXT-X-START:TIME-OFFSET=0\n\
             #EXT-X-TARGETDURATION:4\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-INDEPENDENT-SEGMENTS\n",
        );
        let (length, done) = self.keyframes.length();
        let keyframes = self.keyframes.slice(0, length);

        for (segment, pair) in keyframes.windows(2).enumerate() {
            let _ = write!(index, "#EXTINF:{:.6}\nsegment-{segment}.ts\n", pair[1] - pair[0]);
        }
        if done && length > 0 {
            let last = length - 1;
            let _ = write!(
                index,
                "#EXTINF:{:.6}\nsegment-{last}.ts\n#EXT-X-ENDLIST",
                self.duration - keyframes[last]
            );
        }
        index
    }

    /// Path of a ready segment, spawning or waiting for an encoder as needed
    pub async fn get_segment(self: &Arc<Self>, segment: usize) -> Result<PathBuf, TranscodeError> {
        let kill = {
            let mut signal = self.kill_signal.lock();
            if signal.is_cancelled() {
                *signal = CancellationToken::new();
            }
            signal.clone()
        };

        let (ready, distance, scheduled, mut rx) = {
            let state = self.state.read();
            let Some(seg) = state.segments.get(segment) else {
                return Err(TranscodeError::InvalidPath);
            };
            let ready = seg.is_ready();
            let distance = if ready { 0.0 } else { self.min_encoder_distance(&state, segment) };
            let scheduled = !ready && state.is_scheduled(segment);
            (ready, distance, scheduled, seg.ready.subscribe())
        };

        if !ready {
            if distance > MAX_ENCODER_DISTANCE || !scheduled {
                trace!(stream = %self.label(), segment, "New encoder for segment");
                self.run(segment)?;
            } else {
                trace!(stream = %self.label(), segment, gap = distance, "Awaiting segment");
            }

            tokio::select! {
                _ = kill.cancelled() => {
                    return Err(TranscodeError::StreamKilled(segment));
                }
                res = tokio::time::timeout(SEGMENT_TIMEOUT, rx.wait_for(|r| *r)) => {
                    if !matches!(res, Ok(Ok(_))) {
                        error!(stream = %self.label(), segment, "Segment timed out");
                        return Err(TranscodeError::SegmentTimeout(segment));
                    }
                }
            }
        }

        self.prepare_next_segments(segment);

        let encoder = self.state.read().segments[segment].encoder.unwrap_or_default();
        Ok(self.segment_path(encoder, segment))
    }

    /// Media seconds from the closest head at or before `segment` that will
    /// reach it; infinite when none will
    fn min_encoder_distance(&self, state: &StreamState, segment: usize) -> f64 {
        let t = self.keyframes.get(segment);
        state
            .heads
            .iter()
            .filter_map(HeadSlot::running)
            .filter_map(|head| {
                let head_time = self.keyframes.get(head.segment);
                (head_time <= t && segment < head.end).then(|| t - head_time)
            })
            .fold(f64::INFINITY, f64::min)
    }

    /// Start heads for upcoming segments that no encoder will reach soon.
    /// Audio is cheap enough to encode on demand.
    fn prepare_next_segments(self: &Arc<Self>, segment: usize) {
        if !self.handle.is_video() {
            return;
        }
        let next = {
            let state = self.state.read();
            let last = state.segments.len().saturating_sub(1);
            (segment + 1..=(segment + PREPARE_AHEAD).min(last)).find(|&i| {
                !state.segments[i].is_ready()
                    && self.min_encoder_distance(&state, i)
                        >= MAX_ENCODER_DISTANCE + 5.0 * (i - segment) as f64
            })
        };
        if let Some(i) = next {
            trace!(stream = %self.label(), segment = i, "Preparing encoder for future segment");
            let stream = self.clone();
            tokio::spawn(async move {
                if let Err(e) = stream.run(i) {
                    warn!(segment = i, error = %e, "Failed to prepare segment");
                }
            });
        }
    }

    /// Reserve a head slot from `start` and launch its encoder
    fn run(self: &Arc<Self>, start: usize) -> Result<(), TranscodeError> {
        let (length, done) = self.keyframes.length();
        let mut end = (start + MAX_HEAD_SEGMENTS).min(length);
        // The precise split needs one keyframe past the end
        if !done {
            end = end.saturating_sub(2);
        }

        let (encoder_id, stop) = {
            let mut state = self.state.write();
            end = end.min(state.segments.len());
            if let Some(i) = (start..end)
                .find(|&i| state.segments[i].is_ready() || state.is_transcoding(i))
            {
                end = i;
            }
            if start >= end {
                // Another request made it ready or scheduled it first
                return Ok(());
            }
            let stop = CancellationToken::new();
            state.heads.push(HeadSlot::Running(Head {
                segment: start,
                end,
                stop: stop.clone(),
            }));
            (state.heads.len() - 1, stop)
        };

        debug!(
            stream = %self.label(),
            encoder_id,
            start,
            end,
            total = length,
            "Transcoding segments"
        );

        let args = self.encoder_args(start, end, length, encoder_id);
        let spawned = std::fs::create_dir_all(&self.out_dir)
            .map_err(|e| e.to_string())
            .and_then(|_| {
                Command::new(&self.settings.ffmpeg_path)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| e.to_string())
            });

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(stream = %self.label(), encoder_id, error = %e, "Failed to start ffmpeg");
                self.state.write().heads[encoder_id] = HeadSlot::Deleted;
                return Err(TranscodeError::FfmpegFailed(e));
            }
        };

        self.supervise(child, encoder_id, start, end, stop);
        Ok(())
    }

    fn encoder_args(&self, start: usize, end: usize, length: usize, encoder_id: usize) -> Vec<String> {
        let kf = &self.keyframes;
        let is_video = self.handle.is_video();

        // One segment of context before the target. Audio needs it to avoid a
        // gap; video seeks just past the preceding keyframe.
        let start_seg = start.saturating_sub(1);
        let start_ref = if start == 0 {
            0.0
        } else if !is_video {
            kf.get(start_seg)
        } else if start_seg + 1 == length {
            (kf.get(start_seg) + self.duration) / 2.0
        } else {
            (kf.get(start_seg) + kf.get(start_seg + 1)) / 2.0
        };

        let end_padding = usize::from(end != length);
        let mut segments = kf.slice(start + 1, end + end_padding);
        if segments.is_empty() {
            // ffmpeg rejects an empty list
            segments.push(9_999_999.0);
        }

        let mut args: Vec<String> = ["-nostats", "-hide_banner", "-loglevel", "warning"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.settings.hwaccel.decode_flags.iter().cloned());

        if start_ref != 0.0 {
            if is_video {
                args.push("-noaccurate_seek".into());
            }
            args.extend(["-ss".into(), format!("{start_ref:.6}")]);
        }
        if end < length {
            // -ss lands before the requested time; add back what it skipped
            let end_ref = kf.get(end) + (start_ref - kf.get(start_seg));
            args.extend(["-to".into(), format!("{end_ref:.6}")]);
        }

        args.extend([
            "-i".into(),
            self.file_path.to_string_lossy().into_owned(),
            "-start_at_zero".into(),
            "-copyts".into(),
            "-muxdelay".into(),
            "0".into(),
        ]);
        args.extend(self.handle.transcode_args(&join_times(&segments)));

        let base = kf.get(start_seg);
        let relative: Vec<f64> = segments.iter().map(|t| t - base).collect();
        args.extend([
            "-f".into(),
            "segment".into(),
            // Rounding slack when forcing keyframes
            "-segment_time_delta".into(),
            "0.05".into(),
            "-segment_format".into(),
            "mpegts".into(),
            "-segment_times".into(),
            join_times(&relative),
            "-segment_list_type".into(),
            "flat".into(),
            "-segment_list".into(),
            "pipe:1".into(),
            "-segment_start_number".into(),
            start.to_string(),
            self.out_pattern(encoder_id).to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Watch the encoder's output and exit
    fn supervise(
        self: &Arc<Self>,
        mut child: Child,
        encoder_id: usize,
        start: usize,
        end: usize,
        stop: CancellationToken,
    ) {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stdout) = stdout {
            let stream = self.clone();
            let stop = stop.clone();
            let prefix = format!("segment-{}-{encoder_id}-", self.handle.label());
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Some(segment) = parse_segment_line(&line, &prefix) else {
                        continue;
                    };
                    // Preamble from the extra segment of context
                    if segment < start {
                        continue;
                    }
                    match stream.on_segment_done(encoder_id, segment, end) {
                        SegmentOutcome::Continue => {}
                        SegmentOutcome::Finished => break,
                        SegmentOutcome::Stop => {
                            trace!(encoder_id, segment, "Next segment ready, stopping encoder");
                            stop.cancel();
                            break;
                        }
                    }
                }
            });
        }

        let stream = self.clone();
        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });

            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop.cancelled() => {
                    interrupt(&mut child);
                    match tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };
            let stderr = stderr_task.await.unwrap_or_default();
            stream.on_encoder_exit(encoder_id, status, &stderr);
        });
    }

    /// Record a segment reported by `encoder_id`. Publishing happens under the
    /// write lock and only for a segment that is not ready yet.
    fn on_segment_done(&self, encoder_id: usize, segment: usize, end: usize) -> SegmentOutcome {
        let mut state = self.state.write();
        if let Some(HeadSlot::Running(head)) = state.heads.get_mut(encoder_id) {
            head.segment = segment;
        }
        let Some(seg) = state.segments.get_mut(segment) else {
            return SegmentOutcome::Stop;
        };
        if seg.is_ready() {
            return SegmentOutcome::Stop;
        }
        seg.encoder = Some(encoder_id);
        seg.ready.send_replace(true);

        if segment + 1 >= end {
            SegmentOutcome::Finished
        } else if state
            .segments
            .get(segment + 1)
            .is_some_and(Segment::is_ready)
        {
            SegmentOutcome::Stop
        } else {
            SegmentOutcome::Continue
        }
    }

    fn on_encoder_exit(&self, encoder_id: usize, status: std::io::Result<ExitStatus>, stderr: &str) {
        if self.settings.hwaccel.is_failure_output(stderr) {
            warn!(encoder_id, "ffmpeg failed to use hardware acceleration");
        }
        match status {
            Ok(status) if status.success() => {
                trace!(stream = %self.label(), encoder_id, "ffmpeg exited");
            }
            // 255 is ffmpeg's exit code after SIGINT
            Ok(status) if status.code() == Some(255) || status.code().is_none() => {
                trace!(stream = %self.label(), encoder_id, "ffmpeg terminated");
            }
            Ok(status) => {
                error!(
                    stream = %self.label(),
                    encoder_id,
                    %status,
                    stderr = %stderr.trim(),
                    "ffmpeg failed"
                );
            }
            Err(e) => error!(encoder_id, error = %e, "Failed to wait for ffmpeg"),
        }
        // Slots are never removed so encoder ids stay valid
        self.state.write().heads[encoder_id] = HeadSlot::Deleted;
    }

    /// Kill every live head and release waiting requests
    pub fn kill(&self) {
        self.kill_signal.lock().cancel();
        let mut state = self.state.write();
        for id in 0..state.heads.len() {
            state.kill_head(id);
        }
        debug!(stream = %self.label(), "Stream killed");
    }

    /// Kill heads farther than a few segments from every client position
    pub fn kill_orphaned_heads(&self, client_heads: &[usize]) {
        let mut state = self.state.write();
        let orphans: Vec<usize> = state
            .heads
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.running().map(|h| (id, h.segment)))
            .filter(|(_, segment)| {
                client_heads
                    .iter()
                    .map(|c| c.abs_diff(*segment))
                    .min()
                    .unwrap_or(usize::MAX)
                    > ORPHAN_DISTANCE
            })
            .map(|(id, _)| id)
            .collect();
        for id in orphans {
            debug!(stream = %self.label(), encoder_id = id, "Killing orphaned head");
            state.kill_head(id);
        }
    }

    pub fn running_heads(&self) -> usize {
        self.state
            .read()
            .heads
            .iter()
            .filter(|s| s.running().is_some())
            .count()
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn is_segment_ready(&self, segment: usize) -> bool {
        self.state
            .read()
            .segments
            .get(segment)
            .is_some_and(Segment::is_ready)
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

fn join_times(times: &[f64]) -> String {
    times
        .iter()
        .map(|t| format!("{t:.6}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Segment number from a `-segment_list` line such as
/// `/tmp/x/segment-720p-3-42.ts`
fn parse_segment_line(line: &str, prefix: &str) -> Option<usize> {
    let name = line.trim().rsplit(['/', '\\']).next()?;
    name.strip_prefix(prefix)?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we still own and have not reaped
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
impl Stream {
    /// Reserve a head without starting a process
    fn push_head(&self, start: usize, end: usize) -> usize {
        let mut state = self.state.write();
        state.heads.push(HeadSlot::Running(Head {
            segment: start,
            end,
            stop: CancellationToken::new(),
        }));
        state.heads.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::transcoder::hwaccel::{HwAccelKind, HwAccelSettings};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    struct TestHandle;

    impl StreamHandle for TestHandle {
        fn label(&self) -> String {
            "a0".to_string()
        }
        fn is_video(&self) -> bool {
            false
        }
        fn transcode_args(&self, _segment_times: &str) -> Vec<String> {
            vec!["-c:v".into(), "copy".into()]
        }
    }

    fn stream(keyframes: Keyframes, duration: f64) -> Arc<Stream> {
        let settings = Arc::new(TranscoderSettings {
            stream_dir: PathBuf::from("/tmp/anilib-test"),
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
            hwaccel: HwAccelSettings::new(HwAccelKind::Disabled, "fast", ""),
        });
        Stream::new(
            Box::new(TestHandle),
            PathBuf::from("/lib/video.mkv"),
            PathBuf::from("/tmp/anilib-test/hash"),
            duration,
            Arc::new(keyframes),
            settings,
        )
    }

    #[test]
    fn test_index_lists_every_segment_when_done() {
        let s = stream(Keyframes::complete(vec![0.0, 4.0, 8.5]), 10.0);
        let index = s.index();
        assert!(index.starts_with("#EXTM3U\n#EXT-X-VERSION:6\n"));
        assert!(index.contains("#EXTINF:4.000000\nsegment-0.ts\n"));
        assert!(index.contains("#EXTINF:4.500000\nsegment-1.ts\n"));
        assert!(index.ends_with("#EXTINF:1.500000\nsegment-2.ts\n#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_index_omits_tail_while_analysing() {
        let kf = Keyframes::default();
        kf.append(&[0.0, 4.0, 8.0]);
        let s = stream(kf, 100.0);
        let index = s.index();
        assert!(index.contains("segment-1.ts"));
        assert!(!index.contains("segment-2.ts"));
        assert!(!index.contains("ENDLIST"));
    }

    #[test]
    fn test_listener_grows_segments() {
        let kf = Arc::new(Keyframes::default());
        kf.append(&[0.0, 2.0]);
        let settings = Arc::new(TranscoderSettings {
            stream_dir: PathBuf::from("/tmp"),
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
            hwaccel: HwAccelSettings::new(HwAccelKind::Disabled, "fast", ""),
        });
        let s = Stream::new(
            Box::new(TestHandle),
            PathBuf::from("/lib/a.mkv"),
            PathBuf::from("/tmp/a"),
            10.0,
            kf.clone(),
            settings,
        );
        assert_eq!(s.segment_count(), 2);
        kf.append(&[4.0, 6.0]);
        assert_eq!(s.segment_count(), 4);
    }

    #[test]
    fn test_segment_published_once() {
        let s = stream(Keyframes::complete(vec![0.0, 2.0, 4.0, 6.0]), 8.0);
        let first = s.push_head(0, 4);
        let second = s.push_head(1, 4);

        assert_eq!(s.on_segment_done(first, 1, 4), SegmentOutcome::Continue);
        // A second encoder reaching the same segment is told to stop and
        // does not take ownership of it
        assert_eq!(s.on_segment_done(second, 1, 4), SegmentOutcome::Stop);
        assert_eq!(s.state.read().segments[1].encoder, Some(first));
        assert_eq!(s.on_segment_done(first, 3, 4), SegmentOutcome::Finished);
    }

    #[test]
    fn test_stop_when_next_segment_is_ready() {
        let s = stream(Keyframes::complete(vec![0.0, 2.0, 4.0, 6.0]), 8.0);
        let late = s.push_head(2, 4);
        assert_eq!(s.on_segment_done(late, 2, 4), SegmentOutcome::Continue);

        let early = s.push_head(0, 4);
        assert_eq!(s.on_segment_done(early, 0, 4), SegmentOutcome::Continue);
        assert_eq!(s.on_segment_done(early, 1, 4), SegmentOutcome::Stop);
    }

    #[tokio::test]
    async fn test_waiting_request_is_released_by_encoder() {
        let s = stream(Keyframes::complete(vec![0.0, 2.0, 4.0, 6.0]), 8.0);
        let head = s.push_head(0, 4);

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.get_segment(1).await })
        };
        tokio::task::yield_now().await;
        s.on_segment_done(head, 0, 4);
        s.on_segment_done(head, 1, 4);

        let path = waiter.await.unwrap().unwrap();
        assert_eq!(path, PathBuf::from("/tmp/anilib-test/hash/segment-a0-0-1.ts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_segment_times_out() {
        let s = stream(Keyframes::complete(vec![0.0, 2.0, 4.0, 6.0]), 8.0);
        s.push_head(0, 4);
        assert_matches!(s.get_segment(2).await, Err(TranscodeError::SegmentTimeout(2)));
    }

    #[tokio::test]
    async fn test_missing_encoder_binary_fails_fast() {
        let s = stream(Keyframes::complete(vec![0.0, 2.0, 4.0, 6.0]), 8.0);
        assert_matches!(s.get_segment(0).await, Err(TranscodeError::FfmpegFailed(_)));
        // The reserved slot is released and never reused
        assert_eq!(s.running_heads(), 0);
        assert_eq!(s.state.read().heads.len(), 1);
    }

    #[tokio::test]
    async fn test_kill_releases_waiters() {
        let s = stream(Keyframes::complete(vec![0.0, 2.0, 4.0, 6.0]), 8.0);
        s.push_head(0, 4);
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.get_segment(1).await })
        };
        tokio::task::yield_now().await;
        s.kill();
        assert_matches!(waiter.await.unwrap(), Err(TranscodeError::StreamKilled(1)));
        assert_eq!(s.running_heads(), 0);
    }

    #[test]
    fn test_orphaned_heads_are_killed() {
        let s = stream(Keyframes::complete((0..200).map(|i| i as f64 * 2.0).collect()), 400.0);
        s.push_head(10, 100);
        s.push_head(150, 200);
        s.kill_orphaned_heads(&[12]);
        let state = s.state.read();
        assert!(state.heads[0].running().is_some());
        assert!(state.heads[1].running().is_none());
    }

    #[test]
    fn test_encoder_args_seek_between_keyframes() {
        let s = stream(Keyframes::complete(vec![0.0, 2.0, 4.0, 6.0, 8.0]), 10.0);
        let args = s.encoder_args(2, 4, 5, 7);
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        // Audio seeks to the previous keyframe for context
        assert_eq!(args[pos("-ss") + 1], "2.000000");
        assert_eq!(args[pos("-to") + 1], "8.000000");
        assert_eq!(args[pos("-segment_start_number") + 1], "2");
        assert_eq!(args[pos("-segment_times") + 1], "4.000000,6.000000");
        assert!(args.last().unwrap().ends_with("segment-a0-7-%d.ts"));
    }

    #[test]
    fn test_parse_segment_line() {
        assert_eq!(parse_segment_line("segment-720p-3-42.ts", "segment-720p-3-"), Some(42));
        assert_eq!(parse_segment_line("/tmp/h/segment-a1-0-7.ts\n", "segment-a1-0-"), Some(7));
        assert_eq!(parse_segment_line("segment-720p-4-42.ts", "segment-720p-3-"), None);
    }
}
