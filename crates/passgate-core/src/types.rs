use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::naming;

/// Bounding box of a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face descriptor (128-dimensional for the reference extractor).
///
/// Serializes as a bare JSON array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Dimensionality of the descriptor.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Descriptors of different dimensionality are never comparable and are
    /// reported as infinitely far apart, so they can never pass a threshold.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One face found in a frame by the descriptor extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
    pub descriptor: Descriptor,
}

/// An enrolled identity with its reference descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceProfile {
    /// Source identifier (the profile image's file stem, e.g. `jane_doe`).
    pub id: String,
    pub display_name: String,
    pub descriptor: Descriptor,
}

impl ReferenceProfile {
    /// Build a profile whose display name is derived from its source identifier.
    pub fn from_source(id: impl Into<String>, descriptor: Descriptor) -> Self {
        let id = id.into();
        Self {
            display_name: naming::display_name(&id),
            id,
            descriptor,
        }
    }
}

/// Immutable, shareable snapshot of the enrolled profiles in enrollment order.
pub type ProfileSet = Arc<[ReferenceProfile]>;

/// Closest enrolled profile for a query descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub profile: ReferenceProfile,
    /// Euclidean distance between the query and the profile descriptor.
    pub distance: f32,
}

impl MatchResult {
    /// Match confidence in percent, `(1 - distance) * 100` rounded to one decimal.
    pub fn confidence(&self) -> f32 {
        ((1.0 - self.distance) * 1000.0).round() / 10.0
    }
}

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
    /// Identifier of the still image this frame was decoded from, if any.
    pub label: Option<String>,
}

impl Frame {
    /// Frame decoded from an enrollment still.
    pub fn still(label: impl Into<String>, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            sequence: 0,
            timestamp: std::time::Instant::now(),
            label: Some(label.into()),
        }
    }
}
