// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use activity_ingest::error::AppError;

#[test]
fn test_bad_input_is_not_retryable() {
    let err = AppError::UnsupportedFormat("notes.txt".to_string());
    assert!(!err.is_retryable());

    let err = AppError::parse("gpx", "unexpected end of document");
    assert!(!err.is_retryable());

    let err = AppError::ArchiveTooLarge {
        entries: 20_001,
        bytes: 10,
        reason: "too many entries".to_string(),
    };
    assert!(!err.is_retryable());

    let err = AppError::MetadataOnly("no samples".to_string());
    assert!(!err.is_retryable());
}

#[test]
fn test_transient_failures_are_retryable() {
    let err = AppError::Persistence("database is locked".to_string());
    assert!(err.is_retryable());

    let err = AppError::from(std::io::Error::other("disk full"));
    assert!(err.is_retryable());

    let err = AppError::Internal(anyhow::anyhow!("worker task panicked"));
    assert!(err.is_retryable());

    let err = AppError::LeaseExpired("no result within 10s".to_string());
    assert!(err.is_retryable());
    assert_eq!(err.code(), "lease_expired");
}

#[test]
fn test_record_prefixes_stable_code() {
    let err = AppError::parse("fit", "bad header");
    assert_eq!(err.code(), "parse_error");
    assert_eq!(err.to_record(), "parse_error: Failed to parse fit file: bad header");

    let err = AppError::from(std::io::Error::other("disk full"));
    assert!(err.to_record().starts_with("io_error: "));
}

#[test]
fn test_queue_exhausted_message() {
    let err = AppError::QueueExhausted {
        job_id: 7,
        attempts: 5,
    };
    assert_eq!(err.code(), "queue_exhausted");
    assert_eq!(
        err.to_string(),
        "Job 7 exhausted its retry budget after 5 attempts"
    );
}

#[test]
fn test_sqlite_errors_map_to_persistence() {
    let err = AppError::from(rusqlite::Error::QueryReturnedNoRows);
    assert!(matches!(err, AppError::Persistence(_)));
    assert!(err.is_retryable());
}
