// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! File format detection.
//!
//! Checks run in order: compound suffix (`.gpx.gz`), plain extension,
//! content sniffing, and finally a single gzip unwrap followed by one more
//! round of checks. Gzip is never unwrapped twice.

use crate::error::{AppError, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::Read;

/// FIT files carry ".FIT" at this byte offset of the header.
const FIT_SIGNATURE_OFFSET: usize = 8;
const FIT_SIGNATURE: &[u8] = b".FIT";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Bytes inspected by the XML sniff.
const SNIFF_WINDOW: usize = 4096;
/// Maximum gzip unwrap depth.
const MAX_DEPTH: usize = 1;
/// Decompressed size ceiling for a single file.
const MAX_DECOMPRESSED_BYTES: u64 = 512 * 1024 * 1024;

/// Supported encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Fit,
    Gpx,
    Tcx,
    Csv,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Fit => "fit",
            FileFormat::Gpx => "gpx",
            FileFormat::Tcx => "tcx",
            FileFormat::Csv => "csv",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "fit" => Some(FileFormat::Fit),
            "gpx" => Some(FileFormat::Gpx),
            "tcx" => Some(FileFormat::Tcx),
            "csv" => Some(FileFormat::Csv),
            _ => None,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection result with the bytes the parser should read.
#[derive(Debug, Clone)]
pub struct DetectedFile<'a> {
    pub format: FileFormat,
    pub bytes: Cow<'a, [u8]>,
    pub was_compressed: bool,
}

/// Classify a file and undo one level of gzip if needed.
pub fn detect<'a>(filename: &str, bytes: &'a [u8]) -> Result<DetectedFile<'a>> {
    let mut name = filename.trim().to_ascii_lowercase();
    let mut current: Cow<'a, [u8]> = Cow::Borrowed(bytes);
    let mut was_compressed = false;

    for depth in 0..=MAX_DEPTH {
        if depth == 0 {
            if let Some(format) = compound_suffix(&name) {
                let decompressed = gunzip(&current, filename)?;
                return Ok(DetectedFile {
                    format,
                    bytes: Cow::Owned(decompressed),
                    was_compressed: true,
                });
            }
        }

        if let Some(format) = extension(&name) {
            return Ok(DetectedFile {
                format,
                bytes: current,
                was_compressed,
            });
        }

        if let Some(format) = sniff(&current) {
            return Ok(DetectedFile {
                format,
                bytes: current,
                was_compressed,
            });
        }

        if depth < MAX_DEPTH && compression_indicated(&name, &current) {
            let decompressed = gunzip(&current, filename)?;
            current = Cow::Owned(decompressed);
            was_compressed = true;
            if let Some(stripped) = name.strip_suffix(".gz") {
                name = stripped.to_string();
            }
            continue;
        }
        break;
    }

    Err(AppError::UnsupportedFormat(format!(
        "{}: not a FIT, GPX, TCX or CSV file",
        filename
    )))
}

/// Return the bytes decompressed if the name or magic says gzip, unchanged otherwise.
pub fn maybe_gunzip<'a>(filename: &str, bytes: &'a [u8]) -> Result<Cow<'a, [u8]>> {
    if compression_indicated(&filename.to_ascii_lowercase(), bytes) {
        Ok(Cow::Owned(gunzip(bytes, filename)?))
    } else {
        Ok(Cow::Borrowed(bytes))
    }
}

fn compound_suffix(name: &str) -> Option<FileFormat> {
    let stem = name.strip_suffix(".gz")?;
    extension(stem)
}

fn extension(name: &str) -> Option<FileFormat> {
    let (_, ext) = name.rsplit_once('.')?;
    FileFormat::from_extension(ext)
}

fn sniff(bytes: &[u8]) -> Option<FileFormat> {
    if bytes.len() >= FIT_SIGNATURE_OFFSET + FIT_SIGNATURE.len()
        && &bytes[FIT_SIGNATURE_OFFSET..FIT_SIGNATURE_OFFSET + FIT_SIGNATURE.len()] == FIT_SIGNATURE
    {
        return Some(FileFormat::Fit);
    }
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let head = String::from_utf8_lossy(window).to_ascii_lowercase();
    if head.contains("<trainingcenterdatabase") {
        Some(FileFormat::Tcx)
    } else if head.contains("<gpx") {
        Some(FileFormat::Gpx)
    } else {
        None
    }
}

fn compression_indicated(name: &str, bytes: &[u8]) -> bool {
    name.ends_with(".gz") || bytes.starts_with(&GZIP_MAGIC)
}

fn gunzip(bytes: &[u8], filename: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(|e| AppError::InvalidPayload(format!("{}: gzip decode failed: {}", filename, e)))?;
    if out.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(AppError::InvalidPayload(format!(
            "{}: decompressed size exceeds {} bytes",
            filename, MAX_DECOMPRESSED_BYTES
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    const GPX: &[u8] = b"<?xml version=\"1.0\"?><gpx version=\"1.1\"></gpx>";

    #[test]
    fn test_extension_wins() {
        let detected = detect("Ride.GPX", b"anything").unwrap();
        assert_eq!(detected.format, FileFormat::Gpx);
        assert!(!detected.was_compressed);
    }

    #[test]
    fn test_compound_suffix() {
        let packed = gzip(GPX);
        let detected = detect("ride.gpx.gz", &packed).unwrap();
        assert_eq!(detected.format, FileFormat::Gpx);
        assert!(detected.was_compressed);
        assert_eq!(detected.bytes.as_ref(), GPX);
    }

    #[test]
    fn test_sniff_without_extension() {
        assert_eq!(detect("upload", GPX).unwrap().format, FileFormat::Gpx);
        let tcx = b"<?xml?><TrainingCenterDatabase xmlns=\"x\"></TrainingCenterDatabase>";
        assert_eq!(detect("upload.xml", tcx).unwrap().format, FileFormat::Tcx);

        let mut fit = vec![14u8, 0x10, 0, 0, 0, 0, 0, 0];
        fit.extend_from_slice(b".FIT");
        fit.extend_from_slice(&[0, 0]);
        assert_eq!(detect("blob.bin", &fit).unwrap().format, FileFormat::Fit);
    }

    #[test]
    fn test_gzip_by_magic_is_unwrapped_once() {
        let once = gzip(GPX);
        let detected = detect("upload", &once).unwrap();
        assert_eq!(detected.format, FileFormat::Gpx);
        assert!(detected.was_compressed);

        let twice = gzip(&once);
        assert!(matches!(
            detect("upload", &twice),
            Err(AppError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_bad_gzip_with_explicit_name_is_invalid_payload() {
        assert!(matches!(
            detect("ride.gpx.gz", b"not gzip"),
            Err(AppError::InvalidPayload(_))
        ));
        assert!(matches!(
            detect("mystery.gz", b"not gzip"),
            Err(AppError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_unknown_content_is_unsupported() {
        assert!(matches!(
            detect("notes.txt", b"hello"),
            Err(AppError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_maybe_gunzip_passthrough() {
        let plain = maybe_gunzip("notes.txt", b"hello").unwrap();
        assert!(matches!(plain, Cow::Borrowed(_)));
        let packed = gzip(b"hello");
        assert_eq!(maybe_gunzip("x", &packed).unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_detection_is_idempotent() {
        let packed = gzip(GPX);
        let a = detect("upload", &packed).unwrap();
        let b = detect("upload", &packed).unwrap();
        assert_eq!(a.format, b.format);
        assert_eq!(a.bytes, b.bytes);
    }
}
