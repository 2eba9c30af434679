//! On-disk storage for uploaded media files.
//!
//! Files are stored under generated uuid names inside the configured media
//! root; the database keeps the relative path. Images additionally get a
//! thumbnail entry under `thumbnails/`. All stored paths are re-validated
//! against traversal before any read or delete.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::MediaKind;

use crate::error::ServerError;

const THUMBNAIL_DIR: &str = "thumbnails";

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(&canonical_base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::Validation(
                    "Path traversal detected".to_string(),
                ));
            }
            _ => {} // RootDir, CurDir, Prefix -- skip
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::Validation(
            "Path traversal detected".to_string(),
        ));
    }
    Ok(resolved)
}

/// Paths of a stored upload, relative to the media root.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_path: String,
    pub thumbnail_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    base_path: PathBuf,
    max_size: usize,
}

impl MediaStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(base_path.join(THUMBNAIL_DIR))
            .await
            .map_err(|e| {
                ServerError::Storage(format!(
                    "Failed to create media directory '{}': {}",
                    base_path.display(),
                    e
                ))
            })?;

        info!(path = %base_path.display(), "Media store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Write the uploaded bytes under a generated name. Images get a
    /// thumbnail copy; real resizing is the thumbnail pipeline's concern
    /// and out of scope here.
    pub async fn store_file(
        &self,
        original_name: &str,
        data: &[u8],
        kind: MediaKind,
    ) -> Result<StoredFile, ServerError> {
        if data.is_empty() {
            return Err(ServerError::Validation("No file provided".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::MediaTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let file_name = match sanitized_extension(original_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };

        let path = self.resolve(&file_name)?;
        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to write {file_name}: {e}")))?;

        let thumbnail_path = if kind == MediaKind::Image {
            let relative = format!("{THUMBNAIL_DIR}/thumb_{file_name}");
            let target = self.resolve(&relative)?;
            fs::copy(&path, &target)
                .await
                .map_err(|e| ServerError::Storage(format!("Failed to write thumbnail: {e}")))?;
            Some(relative)
        } else {
            None
        };

        debug!(file = %file_name, size = data.len(), "Stored media file");

        Ok(StoredFile {
            file_path: file_name,
            thumbnail_path,
        })
    }

    /// Read a stored file back by its relative path.
    pub async fn read_file(&self, relative: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.resolve(relative)?;
        if !path.exists() {
            return Err(ServerError::NotFound("Media file"));
        }
        fs::read(&path)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to read {relative}: {e}")))
    }

    /// Remove a stored file. A missing file is not an error; the row is
    /// what matters.
    pub async fn remove_file(&self, relative: &str) -> Result<(), ServerError> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to delete {relative}: {e}"
            ))),
        }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, ServerError> {
        if relative.contains("..") || relative.contains('\\') || relative.starts_with('/') {
            return Err(ServerError::Validation(
                "Path traversal detected".to_string(),
            ));
        }
        ensure_within(&self.base_path, &self.base_path.join(relative))
    }
}

/// Keep only short alphanumeric extensions; anything else is dropped.
fn sanitized_extension(original_name: &str) -> Option<String> {
    let ext = Path::new(original_name).extension()?.to_str()?;
    if ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}
