//! Collaborator seams: descriptor extraction, video capture, enrollment
//! images and grant notification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DetectedFace, Frame};

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("no descriptors available for frame {0}")]
    UnknownFrame(String),
    #[error("extraction timed out after {0} ms")]
    TimedOut(u128),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video device unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("video stream ended")]
    Ended,
}

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("profile source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read image {id}: {message}")]
    Image { id: String, message: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produces face detections with descriptors for a frame.
#[async_trait]
pub trait DescriptorExtractor: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>, ExtractorError>;
}

/// A device that can be opened into a live frame stream.
#[async_trait]
pub trait VideoDevice: Send + Sync {
    async fn open(&self) -> Result<Box<dyn VideoSource>, SourceError>;
}

/// An open frame stream. Owned by exactly one detection loop at a time.
#[async_trait]
pub trait VideoSource: Send {
    /// Wait for the next frame. `SourceError::Ended` means no more frames will come.
    async fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Stop the underlying stream and release the hardware.
    fn release(&mut self);
}

/// Where enrolled reference images come from.
#[async_trait]
pub trait EnrollmentSource: Send + Sync {
    /// Identifiers of every enrollable image, in enrollment order.
    async fn list_enrollable_images(&self) -> Result<Vec<String>, EnrollmentError>;

    async fn fetch_image(&self, id: &str) -> Result<Frame, EnrollmentError>;
}

/// Four-field record published when a pass is granted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassRecord {
    pub identity: String,
    pub pass_type: String,
    /// Local wall-clock time of the grant (e.g. `2:05:09 PM`).
    pub time: String,
    /// Confidence percentage with one decimal (e.g. `100.0`).
    pub confidence: String,
}

/// Receives granted passes. Delivery is best-effort.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, record: &PassRecord) -> Result<(), NotifyError>;
}

/// Sink that only logs granted passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, record: &PassRecord) -> Result<(), NotifyError> {
        tracing::info!(
            identity = %record.identity,
            pass_type = %record.pass_type,
            time = %record.time,
            confidence = %record.confidence,
            "hall pass logged"
        );
        Ok(())
    }
}
