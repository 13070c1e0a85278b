use super::stream::StreamHandle;

/// Stereo AAC rendition of one source audio track
pub struct AudioStream {
    index: usize,
}

impl AudioStream {
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

impl StreamHandle for AudioStream {
    fn label(&self) -> String {
        format!("a{}", self.index)
    }

    fn is_video(&self) -> bool {
        false
    }

    fn transcode_args(&self, _segment_times: &str) -> Vec<String> {
        vec![
            "-map".into(),
            format!("0:a:{}", self.index),
            "-c:a".into(),
            "aac".into(),
            "-ac".into(),
            "2".into(),
            "-b:a".into(),
            "128k".into(),
        ]
    }
}
