//! Profile directory: one `first_last.jpg` per enrolled person, with the
//! precomputed descriptors of that photo in a `first_last.json` sidecar.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::ImageFormat;
use passgate_core::naming;
use passgate_core::source::{EnrollmentError, ExtractorError};
use passgate_core::{DescriptorExtractor, DetectedFace, EnrollmentSource, Frame};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 2] = ["jpg", "jpeg"];
const SIDECAR_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("profile directory not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid profile name: {0:?}")]
    InvalidName(String),
    #[error("enrollment photo must contain exactly one face, found {0}")]
    FaceCount(usize),
    #[error("profile not found: {0}")]
    UnknownProfile(String),
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid descriptor file {path}: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Contents of a `<id>.json` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorSidecar {
    pub faces: Vec<DetectedFace>,
}

/// Filesystem-backed enrollment source and sidecar descriptor extractor.
#[derive(Debug, Clone)]
pub struct ProfileDirectory {
    root: PathBuf,
}

impl ProfileDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sidecar_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{SIDECAR_EXTENSION}"))
    }

    /// Identifiers (file stems) of every profile image, sorted.
    pub async fn list(&self) -> Result<Vec<String>, DirectoryError> {
        let mut ids: Vec<String> = self
            .image_files()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Path of the image file backing `id`, whatever the extension's case.
    pub async fn image_path(&self, id: &str) -> Result<PathBuf, DirectoryError> {
        self.image_files()
            .await?
            .into_iter()
            .find(|(stem, _)| stem == id)
            .map(|(_, path)| path)
            .ok_or_else(|| DirectoryError::UnknownProfile(id.to_string()))
    }

    /// Decode a profile image to grayscale.
    pub async fn load_frame(&self, id: &str) -> Result<Frame, DirectoryError> {
        let path = self.image_path(id).await?;
        let gray = decode(path).await?.to_luma8();
        let (width, height) = gray.dimensions();
        Ok(Frame::still(id, gray.into_raw(), width, height))
    }

    /// Descriptors recorded for a profile image.
    pub async fn read_sidecar(&self, id: &str) -> Result<Vec<DetectedFace>, DirectoryError> {
        let path = self.sidecar_path(id);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| io_error(&path, source))?;
        let sidecar: DescriptorSidecar = serde_json::from_slice(&data)
            .map_err(|source| DirectoryError::Sidecar { path, source })?;
        Ok(sidecar.faces)
    }

    /// Store a new person's photo as `first_last.jpg` with its descriptors.
    ///
    /// Overwrites an existing profile of the same name. Returns the new id.
    pub async fn enroll(
        &self,
        first: &str,
        last: &str,
        photo: &Path,
        faces: Vec<DetectedFace>,
    ) -> Result<String, DirectoryError> {
        let id = naming::enrollment_stem(first, last);
        if first.trim().is_empty()
            || last.trim().is_empty()
            || !id.chars().all(|c| c.is_alphanumeric() || c == '_')
        {
            return Err(DirectoryError::InvalidName(format!("{first} {last}")));
        }
        if faces.len() != 1 {
            return Err(DirectoryError::FaceCount(faces.len()));
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| io_error(&self.root, source))?;

        let image = decode(photo.to_path_buf()).await?.to_rgb8();
        let target = self.root.join(format!("{id}.jpg"));
        let save_path = target.clone();
        tokio::task::spawn_blocking(move || image.save_with_format(&save_path, ImageFormat::Jpeg))
            .await
            .map_err(|e| io_error(&target, std::io::Error::other(e)))?
            .map_err(|source| DirectoryError::Image { path: target.clone(), source })?;

        let sidecar_path = self.sidecar_path(&id);
        let json = serde_json::to_vec_pretty(&DescriptorSidecar { faces })
            .map_err(|source| DirectoryError::Sidecar { path: sidecar_path.clone(), source })?;
        tokio::fs::write(&sidecar_path, json)
            .await
            .map_err(|source| io_error(&sidecar_path, source))?;

        tracing::info!(id = %id, name = %naming::display_name(&id), "profile enrolled");
        Ok(id)
    }

    /// Delete a profile's photo and sidecar.
    pub async fn remove(&self, id: &str) -> Result<(), DirectoryError> {
        let image = self.image_path(id).await?;
        tokio::fs::remove_file(&image)
            .await
            .map_err(|source| io_error(&image, source))?;

        let sidecar = self.sidecar_path(id);
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(id, "profile had no descriptor sidecar");
            }
            Err(source) => return Err(io_error(&sidecar, source)),
        }

        tracing::info!(id, "profile removed");
        Ok(())
    }

    async fn image_files(&self) -> Result<Vec<(String, PathBuf)>, DirectoryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DirectoryError::NotFound(self.root.clone()));
            }
            Err(source) => return Err(io_error(&self.root, source)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(&self.root, source))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)));
            let stem = path.file_stem().and_then(|s| s.to_str()).map(str::to_string);
            if let (true, Some(stem)) = (is_image, stem) {
                files.push((stem, path));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl EnrollmentSource for ProfileDirectory {
    async fn list_enrollable_images(&self) -> Result<Vec<String>, EnrollmentError> {
        let ids = self
            .list()
            .await
            .map_err(|e| EnrollmentError::Unavailable(e.to_string()))?;
        tracing::debug!(root = %self.root.display(), count = ids.len(), "found profile images");
        Ok(ids)
    }

    async fn fetch_image(&self, id: &str) -> Result<Frame, EnrollmentError> {
        self.load_frame(id).await.map_err(|e| EnrollmentError::Image {
            id: id.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl DescriptorExtractor for ProfileDirectory {
    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>, ExtractorError> {
        let id = frame
            .label
            .as_deref()
            .ok_or_else(|| ExtractorError::UnknownFrame(format!("unlabelled frame #{}", frame.sequence)))?;
        self.read_sidecar(id).await.map_err(|e| match e {
            DirectoryError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ExtractorError::UnknownFrame(id.to_string())
            }
            other => ExtractorError::Failed(other.to_string()),
        })
    }
}

async fn decode(path: PathBuf) -> Result<image::DynamicImage, DirectoryError> {
    let open_path = path.clone();
    tokio::task::spawn_blocking(move || image::open(&open_path))
        .await
        .map_err(|e| io_error(&path, std::io::Error::other(e)))?
        .map_err(|source| DirectoryError::Image { path, source })
}

fn io_error(path: &Path, source: std::io::Error) -> DirectoryError {
    DirectoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passgate_core::{BoundingBox, Descriptor, ProfileStore};
    use tempfile::TempDir;

    fn face(values: &[f32]) -> DetectedFace {
        DetectedFace {
            bounding_box: BoundingBox { x: 4.0, y: 4.0, width: 8.0, height: 8.0 },
            descriptor: Descriptor::new(values.to_vec()),
        }
    }

    fn write_photo(path: &Path) {
        image::GrayImage::from_pixel(16, 12, image::Luma([128u8]))
            .save_with_format(path, ImageFormat::Jpeg)
            .unwrap();
    }

    fn write_sidecar(dir: &Path, id: &str, faces: Vec<DetectedFace>) {
        let json = serde_json::to_string(&DescriptorSidecar { faces }).unwrap();
        std::fs::write(dir.join(format!("{id}.json")), json).unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts_images() {
        let tmp = TempDir::new().unwrap();
        write_photo(&tmp.path().join("john_roe.jpg"));
        write_photo(&tmp.path().join("jane_doe.JPG"));
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(tmp.path().join("archive.jpg")).unwrap();

        let dir = ProfileDirectory::new(tmp.path());
        assert_eq!(dir.list().await.unwrap(), vec!["jane_doe", "john_roe"]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_reported() {
        let tmp = TempDir::new().unwrap();
        let dir = ProfileDirectory::new(tmp.path().join("absent"));
        assert!(matches!(dir.list().await, Err(DirectoryError::NotFound(_))));
        assert!(dir.list_enrollable_images().await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_image_decodes_grayscale_still() {
        let tmp = TempDir::new().unwrap();
        write_photo(&tmp.path().join("jane_doe.jpg"));

        let dir = ProfileDirectory::new(tmp.path());
        let frame = dir.fetch_image("jane_doe").await.unwrap();
        assert_eq!((frame.width, frame.height), (16, 12));
        assert_eq!(frame.data.len(), 16 * 12);
        assert_eq!(frame.label.as_deref(), Some("jane_doe"));
    }

    #[tokio::test]
    async fn test_detect_reads_sidecar_for_labelled_frame() {
        let tmp = TempDir::new().unwrap();
        write_photo(&tmp.path().join("jane_doe.jpg"));
        write_sidecar(tmp.path(), "jane_doe", vec![face(&[0.1, 0.2])]);

        let dir = ProfileDirectory::new(tmp.path());
        let frame = dir.fetch_image("jane_doe").await.unwrap();
        let faces = dir.detect(&frame).await.unwrap();
        assert_eq!(faces, vec![face(&[0.1, 0.2])]);

        let mut unlabelled = frame.clone();
        unlabelled.label = None;
        assert!(matches!(
            dir.detect(&unlabelled).await,
            Err(ExtractorError::UnknownFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_profile_store_from_directory() {
        let tmp = TempDir::new().unwrap();
        write_photo(&tmp.path().join("jane_doe.jpg"));
        write_sidecar(tmp.path(), "jane_doe", vec![face(&[0.1, 0.2])]);
        write_photo(&tmp.path().join("crowd_shot.jpg"));
        write_sidecar(tmp.path(), "crowd_shot", vec![face(&[0.1, 0.2]), face(&[0.3, 0.4])]);
        write_photo(&tmp.path().join("no_sidecar.jpg"));

        let dir = ProfileDirectory::new(tmp.path());
        let store = ProfileStore::load(&dir, &dir).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.profiles()[0].display_name, "Jane Doe");
        assert_eq!(store.skipped().len(), 2);
    }

    #[tokio::test]
    async fn test_enroll_writes_photo_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let photo = tmp.path().join("capture.png");
        image::GrayImage::from_pixel(8, 8, image::Luma([200u8])).save(&photo).unwrap();

        let dir = ProfileDirectory::new(tmp.path().join("faces"));
        let id = dir.enroll("Jane", "Doe", &photo, vec![face(&[0.5, 0.5])]).await.unwrap();
        assert_eq!(id, "jane_doe");
        assert_eq!(dir.list().await.unwrap(), vec!["jane_doe"]);
        assert_eq!(dir.read_sidecar("jane_doe").await.unwrap(), vec![face(&[0.5, 0.5])]);
        assert!(dir.load_frame("jane_doe").await.is_ok());
    }

    #[tokio::test]
    async fn test_enroll_rejects_bad_input() {
        let tmp = TempDir::new().unwrap();
        let photo = tmp.path().join("capture.png");
        image::GrayImage::from_pixel(8, 8, image::Luma([200u8])).save(&photo).unwrap();
        let dir = ProfileDirectory::new(tmp.path());

        assert!(matches!(
            dir.enroll("Jane", "", &photo, vec![face(&[0.5])]).await,
            Err(DirectoryError::InvalidName(_))
        ));
        assert!(matches!(
            dir.enroll("../etc", "passwd", &photo, vec![face(&[0.5])]).await,
            Err(DirectoryError::InvalidName(_))
        ));
        assert!(matches!(
            dir.enroll("Jane", "Doe", &photo, vec![]).await,
            Err(DirectoryError::FaceCount(0))
        ));
    }

    #[tokio::test]
    async fn test_remove_deletes_profile() {
        let tmp = TempDir::new().unwrap();
        write_photo(&tmp.path().join("jane_doe.jpg"));
        write_sidecar(tmp.path(), "jane_doe", vec![face(&[0.1])]);

        let dir = ProfileDirectory::new(tmp.path());
        dir.remove("jane_doe").await.unwrap();
        assert!(dir.list().await.unwrap().is_empty());
        assert!(!dir.sidecar_path("jane_doe").exists());
        assert!(matches!(
            dir.remove("jane_doe").await,
            Err(DirectoryError::UnknownProfile(_))
        ));
    }
}
