// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Zip container expansion with entry-count and size limits.

use crate::config::ArchiveLimits;
use crate::error::{AppError, Result};
use std::io::{Cursor, Read};
use zip::ZipArchive;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "heic", "webp"];
/// Shortest digit run accepted as an external activity id.
const MIN_EXTERNAL_ID_DIGITS: usize = 4;

/// One file extracted from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path inside the archive
    pub path: String,
    pub bytes: Vec<u8>,
}

pub fn is_zip(filename: &str, bytes: &[u8]) -> bool {
    filename.to_ascii_lowercase().ends_with(".zip") || bytes.starts_with(ZIP_MAGIC)
}

/// Last path component.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

pub fn is_media(path: &str) -> bool {
    basename(path)
        .rsplit_once('.')
        .is_some_and(|(_, ext)| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Extract an external activity id from an archive path.
///
/// Looks at the file stem first, then parent directories, and takes the
/// leading digit run of the first component that has one
/// (`activities/1234567.fit.gz`, `media/1234567/photo.jpg`).
pub fn external_id_from_path(path: &str) -> Option<String> {
    let mut components: Vec<&str> = path.split(['/', '\\']).filter(|c| !c.is_empty()).collect();
    let file = components.pop()?;
    let stem = file.split('.').next().unwrap_or(file);

    std::iter::once(stem)
        .chain(components.into_iter().rev())
        .find_map(|component| {
            let digits: String = component.chars().take_while(char::is_ascii_digit).collect();
            (digits.len() >= MIN_EXTERNAL_ID_DIGITS).then_some(digits)
        })
}

fn is_ignored(path: &str) -> bool {
    path.starts_with("__MACOSX/")
        || path.contains("/__MACOSX/")
        || basename(path).starts_with("._")
        || basename(path) == ".DS_Store"
}

/// Extract every regular file from a zip archive.
///
/// Fails with `ArchiveTooLarge` as soon as either limit is exceeded, using
/// the bytes actually inflated rather than the sizes the archive declares.
pub fn extract(archive_name: &str, bytes: &[u8], limits: ArchiveLimits) -> Result<Vec<ArchiveEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
        AppError::InvalidPayload(format!("{}: not a readable zip archive: {}", archive_name, e))
    })?;

    let mut entries = Vec::new();
    let mut total_bytes: u64 = 0;

    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(|e| {
            AppError::InvalidPayload(format!("{}: corrupt entry {}: {}", archive_name, index, e))
        })?;
        if entry.is_dir() {
            continue;
        }
        let path = entry.name().to_string();
        if is_ignored(&path) {
            continue;
        }

        if entries.len() + 1 > limits.max_entries {
            return Err(AppError::ArchiveTooLarge {
                entries: entries.len() + 1,
                bytes: total_bytes,
                reason: format!("more than {} entries", limits.max_entries),
            });
        }

        let budget = limits.max_total_bytes.saturating_sub(total_bytes);
        let mut data = Vec::new();
        entry
            .take(budget.saturating_add(1))
            .read_to_end(&mut data)
            .map_err(|e| {
                AppError::InvalidPayload(format!("{}: failed to inflate {}: {}", archive_name, path, e))
            })?;
        total_bytes += data.len() as u64;
        if total_bytes > limits.max_total_bytes {
            return Err(AppError::ArchiveTooLarge {
                entries: entries.len() + 1,
                bytes: total_bytes,
                reason: format!("more than {} extracted bytes", limits.max_total_bytes),
            });
        }

        entries.push(ArchiveEntry { path, bytes: data });
    }

    tracing::debug!(
        archive = archive_name,
        entries = entries.len(),
        bytes = total_bytes,
        "Expanded archive"
    );
    Ok(entries)
}
