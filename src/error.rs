// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types shared by the import pipeline, queue and segment engine.

/// Application error type.
///
/// Duplicate files and duplicate activities are not errors; they are
/// reported as [`crate::services::importer::ImportOutcome`] variants.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Archive too large: {reason} ({entries} entries, {bytes} bytes)")]
    ArchiveTooLarge {
        entries: usize,
        bytes: u64,
        reason: String,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to parse {format} file: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    #[error("File contains metadata only: {0}")]
    MetadataOnly(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Job {job_id} exhausted its retry budget after {attempts} attempts")]
    QueueExhausted { job_id: u64, attempts: u32 },

    #[error("Processing lease expired: {0}")]
    LeaseExpired(String),

    #[error("Alert dispatch failed: {0}")]
    AlertDispatch(String),

    #[error("Reverse geocoding failed: {0}")]
    Geocode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Build a parse error for the given format.
    pub fn parse(format: &'static str, message: impl Into<String>) -> Self {
        AppError::Parse {
            format,
            message: message.into(),
        }
    }

    /// Stable machine-readable code, stored alongside failed files and jobs.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UnsupportedFormat(_) => "unsupported_format",
            AppError::ArchiveTooLarge { .. } => "archive_too_large",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::Parse { .. } => "parse_error",
            AppError::MetadataOnly(_) => "metadata_only",
            AppError::Persistence(_) => "persistence_error",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::QueueExhausted { .. } => "queue_exhausted",
            AppError::LeaseExpired(_) => "lease_expired",
            AppError::AlertDispatch(_) => "alert_dispatch_error",
            AppError::Geocode(_) => "geocode_error",
            AppError::Io(_) => "io_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether retrying the same unit of work could plausibly succeed.
    ///
    /// Malformed or unsupported input fails the same way every time, so the
    /// queue dead-letters those on the first attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::UnsupportedFormat(_)
            | AppError::ArchiveTooLarge { .. }
            | AppError::InvalidPayload(_)
            | AppError::Parse { .. }
            | AppError::MetadataOnly(_)
            | AppError::BadRequest(_)
            | AppError::QueueExhausted { .. } => false,
            AppError::Persistence(_)
            | AppError::NotFound(_)
            | AppError::LeaseExpired(_)
            | AppError::AlertDispatch(_)
            | AppError::Geocode(_)
            | AppError::Io(_)
            | AppError::Internal(_) => true,
        }
    }

    /// Render the error as `code: message` for storage in `last_error` fields.
    pub fn to_record(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Persistence(format!("JSON error: {}", err))
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AppError>;
