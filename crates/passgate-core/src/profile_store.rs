//! Enrolled profiles held for the lifetime of a pass session.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::source::{DescriptorExtractor, EnrollmentSource};
use crate::types::{ProfileSet, ReferenceProfile};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("profile snapshot is still held by a running detection loop")]
    SnapshotInUse,
}

/// Why an enrollment image did not produce a profile.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoFace,
    MultipleFaces(usize),
    DimensionMismatch { expected: usize, found: usize },
    NonFiniteDescriptor,
    Fetch(String),
    Extract(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoFace => write!(f, "no face detected"),
            SkipReason::MultipleFaces(n) => write!(f, "{n} faces detected, expected exactly one"),
            SkipReason::DimensionMismatch { expected, found } => {
                write!(f, "descriptor has {found} values, expected {expected}")
            }
            SkipReason::NonFiniteDescriptor => write!(f, "descriptor contains NaN or infinite values"),
            SkipReason::Fetch(msg) => write!(f, "fetch failed: {msg}"),
            SkipReason::Extract(msg) => write!(f, "extraction failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedImage {
    pub id: String,
    pub reason: SkipReason,
}

/// In-memory set of enrolled reference profiles.
///
/// Profiles are kept in enrollment order. Detection loops borrow an immutable
/// [`ProfileSet`] snapshot; the store refuses to reload while one is held.
pub struct ProfileStore {
    profiles: ProfileSet,
    skipped: Vec<SkippedImage>,
    degraded: Option<String>,
}

impl ProfileStore {
    pub fn empty() -> Self {
        Self {
            profiles: Arc::from(Vec::new()),
            skipped: Vec::new(),
            degraded: None,
        }
    }

    /// Store over already-built profiles.
    pub fn from_profiles(profiles: Vec<ReferenceProfile>) -> Self {
        Self {
            profiles: Arc::from(profiles),
            skipped: Vec::new(),
            degraded: None,
        }
    }

    /// Build the store from every enrollable image.
    ///
    /// Never fails: images that cannot be used are skipped with a warning, and
    /// a failing enrollment source leaves the store empty and degraded.
    pub async fn load(
        enrollment: &dyn EnrollmentSource,
        extractor: &dyn DescriptorExtractor,
    ) -> Self {
        let ids = match enrollment.list_enrollable_images().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list enrollment images; no identities loaded");
                return Self {
                    degraded: Some(e.to_string()),
                    ..Self::empty()
                };
            }
        };

        let mut profiles: Vec<ReferenceProfile> = Vec::with_capacity(ids.len());
        let mut skipped = Vec::new();

        for id in ids {
            let expected_dim = profiles.first().map(|p| p.descriptor.len());
            match load_one(enrollment, extractor, &id, expected_dim).await {
                Ok(profile) => {
                    tracing::debug!(id = %profile.id, name = %profile.display_name, "profile loaded");
                    profiles.push(profile);
                }
                Err(reason) => {
                    tracing::warn!(id = %id, reason = %reason, "enrollment image skipped");
                    skipped.push(SkippedImage { id, reason });
                }
            }
        }

        tracing::info!(
            loaded = profiles.len(),
            skipped = skipped.len(),
            "profile store loaded"
        );

        Self {
            profiles: Arc::from(profiles),
            skipped,
            degraded: None,
        }
    }

    /// Re-run [`load`](Self::load) in place.
    pub async fn reload(
        &mut self,
        enrollment: &dyn EnrollmentSource,
        extractor: &dyn DescriptorExtractor,
    ) -> Result<&[ReferenceProfile], StoreError> {
        if Arc::strong_count(&self.profiles) > 1 {
            return Err(StoreError::SnapshotInUse);
        }
        *self = Self::load(enrollment, extractor).await;
        Ok(self.profiles())
    }

    pub fn profiles(&self) -> &[ReferenceProfile] {
        &self.profiles
    }

    /// Shared read-only view handed to a detection loop.
    pub fn snapshot(&self) -> ProfileSet {
        Arc::clone(&self.profiles)
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Descriptor dimensionality shared by every profile.
    pub fn dimension(&self) -> Option<usize> {
        self.profiles.first().map(|p| p.descriptor.len())
    }

    /// Images that were listed but produced no profile on the last load.
    pub fn skipped(&self) -> &[SkippedImage] {
        &self.skipped
    }

    /// Cause of the last load failing as a whole, if it did.
    pub fn degraded(&self) -> Option<&str> {
        self.degraded.as_deref()
    }
}

async fn load_one(
    enrollment: &dyn EnrollmentSource,
    extractor: &dyn DescriptorExtractor,
    id: &str,
    expected_dim: Option<usize>,
) -> Result<ReferenceProfile, SkipReason> {
    let image = enrollment
        .fetch_image(id)
        .await
        .map_err(|e| SkipReason::Fetch(e.to_string()))?;

    let mut faces = extractor
        .detect(&image)
        .await
        .map_err(|e| SkipReason::Extract(e.to_string()))?;

    if faces.len() > 1 {
        return Err(SkipReason::MultipleFaces(faces.len()));
    }
    let face = faces.pop().ok_or(SkipReason::NoFace)?;

    if face.descriptor.values.iter().any(|v| !v.is_finite()) {
        return Err(SkipReason::NonFiniteDescriptor);
    }

    if let Some(expected) = expected_dim {
        let found = face.descriptor.len();
        if found != expected {
            return Err(SkipReason::DimensionMismatch { expected, found });
        }
    }

    Ok(ReferenceProfile::from_source(id, face.descriptor))
}
