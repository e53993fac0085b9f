//! Scripted video feed.
//!
//! A replay script lists frames together with the faces "seen" in each one,
//! so a session can be driven end to end without camera hardware:
//!
//! ```json
//! {
//!   "width": 640, "height": 480, "repeat": false,
//!   "frames": [
//!     { "faces": [] },
//!     { "faces": [{ "box": {"x": 10, "y": 20, "width": 100, "height": 100},
//!                   "descriptor": [0.1, 0.2] }],
//!       "latency_ms": 40 },
//!     { "fail": "model crashed" }
//!   ]
//! }
//! ```
//!
//! [`ReplayFeed`] is both the [`VideoDevice`] and the [`DescriptorExtractor`]
//! for the script; detections are looked up by frame sequence number.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use passgate_core::source::{ExtractorError, SourceError};
use passgate_core::{DescriptorExtractor, DetectedFace, Frame, VideoDevice, VideoSource};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
/// Largest grayscale frame a script may ask for (64 MiB).
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read replay script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid replay script {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("replay script has no frames")]
    Empty,
    #[error("replay frame size {width}x{height} is out of range")]
    FrameSize { width: u32, height: u32 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayScript {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Start over from the first frame instead of ending the stream.
    #[serde(default)]
    pub repeat: bool,
    pub frames: Vec<ReplayFrame>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayFrame {
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
    /// Simulated extractor latency for this frame.
    #[serde(default)]
    pub latency_ms: u64,
    /// Make the extractor fail on this frame with the given message.
    #[serde(default)]
    pub fail: Option<String>,
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

#[derive(Debug, Clone)]
pub struct ReplayFeed {
    script: Arc<ReplayScript>,
    frame_len: usize,
}

impl ReplayFeed {
    pub fn new(script: ReplayScript) -> Result<Self, ReplayError> {
        if script.frames.is_empty() {
            return Err(ReplayError::Empty);
        }
        let frame_len = (script.width as usize)
            .checked_mul(script.height as usize)
            .filter(|&len| len > 0 && len <= MAX_FRAME_BYTES)
            .ok_or(ReplayError::FrameSize {
                width: script.width,
                height: script.height,
            })?;
        Ok(Self {
            script: Arc::new(script),
            frame_len,
        })
    }

    pub async fn from_path(path: &Path) -> Result<Self, ReplayError> {
        let data = tokio::fs::read(path).await.map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let script: ReplayScript =
            serde_json::from_slice(&data).map_err(|source| ReplayError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(
            path = %path.display(),
            frames = script.frames.len(),
            repeat = script.repeat,
            "replay script loaded"
        );
        Self::new(script)
    }

    pub fn frame_count(&self) -> usize {
        self.script.frames.len()
    }

    fn frame_at(&self, sequence: u32) -> &ReplayFrame {
        &self.script.frames[sequence as usize % self.script.frames.len()]
    }
}

#[async_trait]
impl VideoDevice for ReplayFeed {
    async fn open(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        tracing::info!(
            frames = self.script.frames.len(),
            width = self.script.width,
            height = self.script.height,
            "replay feed opened"
        );
        Ok(Box::new(ReplaySource {
            script: Arc::clone(&self.script),
            frame_len: self.frame_len,
            sequence: 0,
            released: false,
        }))
    }
}

#[async_trait]
impl DescriptorExtractor for ReplayFeed {
    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>, ExtractorError> {
        let scripted = self.frame_at(frame.sequence);
        if scripted.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(scripted.latency_ms)).await;
        }
        match &scripted.fail {
            Some(message) => Err(ExtractorError::Failed(message.clone())),
            None => Ok(scripted.faces.clone()),
        }
    }
}

/// Open stream over a replay script.
pub struct ReplaySource {
    script: Arc<ReplayScript>,
    frame_len: usize,
    sequence: u32,
    released: bool,
}

impl ReplaySource {
    pub fn is_released(&self) -> bool {
        self.released
    }
}

#[async_trait]
impl VideoSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if self.released {
            return Err(SourceError::CaptureFailed("replay source released".into()));
        }
        let total = self.script.frames.len() as u32;
        if !self.script.repeat && self.sequence >= total {
            return Err(SourceError::Ended);
        }

        let frame = Frame {
            data: vec![0; self.frame_len],
            width: self.script.width,
            height: self.script.height,
            sequence: self.sequence,
            timestamp: Instant::now(),
            label: None,
        };
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::info!(frames_read = self.sequence, "replay feed released");
        }
    }
}
