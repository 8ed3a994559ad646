// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! SQLite schema.
//!
//! Jobs use plain columns because the claim query filters and orders on
//! them. Other records are stored as a JSON document plus the columns
//! needed for lookups and uniqueness.

use rusqlite::Connection;

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS import_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS import_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            doc TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_import_files_run ON import_files(run_id);
        CREATE INDEX IF NOT EXISTS idx_import_files_hash ON import_files(content_hash);

        CREATE TABLE IF NOT EXISTS import_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            run_id INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            available_at INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            finished_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_import_jobs_claim
            ON import_jobs(status, available_at, priority DESC, id);
        CREATE INDEX IF NOT EXISTS idx_import_jobs_file ON import_jobs(file_id);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS activities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            source_filename TEXT NOT NULL,
            source_format TEXT NOT NULL,
            sport_type TEXT NOT NULL,
            external_id TEXT,
            doc TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activities_source ON activities(source_filename);
        CREATE INDEX IF NOT EXISTS idx_activities_external ON activities(external_id);

        CREATE TABLE IF NOT EXISTS activity_streams (
            activity_id INTEGER PRIMARY KEY REFERENCES activities(id) ON DELETE CASCADE,
            doc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metadata_hints (
            source_filename TEXT PRIMARY KEY,
            doc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activity_media (
            activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            doc TEXT NOT NULL,
            PRIMARY KEY (activity_id, filename)
        );

        CREATE TABLE IF NOT EXISTS staged_media (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL,
            doc TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_staged_media_external ON staged_media(external_id);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            doc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS segment_efforts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            segment_id INTEGER NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
            activity_id INTEGER NOT NULL,
            start_index INTEGER NOT NULL,
            end_index INTEGER NOT NULL,
            source TEXT NOT NULL,
            doc TEXT NOT NULL,
            UNIQUE (segment_id, activity_id, start_index, end_index, source)
        );
        CREATE INDEX IF NOT EXISTS idx_segment_efforts_activity ON segment_efforts(activity_id);
        "#,
    )?;

    Ok(())
}
