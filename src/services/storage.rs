// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! On-disk storage for raw uploads and media files under the data directory.

use crate::error::Result;
use crate::services::archive::basename;
use std::path::{Path, PathBuf};

/// Filesystem storage rooted at the configured data directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store the raw bytes of an import file; returns the stored path.
    pub async fn store_upload(&self, file_id: u64, filename: &str, bytes: &[u8]) -> Result<String> {
        let path = self
            .root
            .join("uploads")
            .join(format!("{}-{}", file_id, sanitize(basename(filename))));
        self.write(&path, bytes).await
    }

    /// Store an image attached to an activity.
    pub async fn store_media(&self, activity_id: u64, filename: &str, bytes: &[u8]) -> Result<String> {
        let path = self
            .root
            .join("media")
            .join(activity_id.to_string())
            .join(sanitize(basename(filename)));
        self.write(&path, bytes).await
    }

    /// Store an image whose activity has not been imported yet.
    pub async fn stage_media(&self, external_id: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        let path = self
            .root
            .join("media")
            .join("staged")
            .join(sanitize(external_id))
            .join(sanitize(basename(filename)));
        self.write(&path, bytes).await
    }

    pub async fn read(&self, stored_path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(stored_path).await?)
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<String> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Keep a filename safe to join under the data directory.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Morning Ride.gpx"), "Morning_Ride.gpx");
        assert_eq!(sanitize(".."), "file");
        assert_eq!(sanitize("../../etc/passwd"), "_.._etc_passwd");
    }

    #[tokio::test]
    async fn test_store_and_read_upload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let path = storage
            .store_upload(7, "batch/ride one.gpx", b"<gpx/>")
            .await
            .unwrap();
        assert!(path.ends_with("7-ride_one.gpx"));
        assert_eq!(storage.read(&path).await.unwrap(), b"<gpx/>");
    }
}
