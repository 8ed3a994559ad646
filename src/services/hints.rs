// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bulk metadata sheet (`activities.csv` in a bulk export).
//!
//! The sheet does not produce activities. Each row becomes a naming and
//! gear hint keyed by the lower-cased basename of the activity file it
//! describes, and its media column maps image files to the activity id.

use crate::error::{AppError, Result};
use crate::models::MetadataHint;
use crate::services::archive::basename;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Exact basename of the metadata sheet.
pub const METADATA_SHEET_NAME: &str = "activities.csv";

pub fn is_metadata_sheet(path: &str) -> bool {
    let name = basename(path).to_ascii_lowercase();
    name == METADATA_SHEET_NAME || name == "activities.csv.gz"
}

/// Hints and media mapping read from one sheet.
#[derive(Debug, Clone, Default)]
pub struct MetadataSheet {
    pub hints: Vec<MetadataHint>,
    /// Lower-cased media basename to external activity id
    pub media: HashMap<String, String>,
}

struct Columns {
    id: Option<usize>,
    name: Option<usize>,
    sport: Option<usize>,
    filename: Option<usize>,
    gear: Option<usize>,
    media: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Self {
        // Exports repeat some headers; the first occurrence is the summary column
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        Self {
            id: find("Activity ID"),
            name: find("Activity Name"),
            sport: find("Activity Type"),
            filename: find("Filename"),
            gear: find("Activity Gear"),
            media: find("Media"),
        }
    }
}

fn cell(record: &csv::StringRecord, index: Option<usize>) -> Option<String> {
    index
        .and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse a metadata sheet. Rows without a filename are ignored.
pub fn parse_sheet(bytes: &[u8], now: DateTime<Utc>) -> Result<MetadataSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| AppError::parse("csv", e.to_string()))?
        .clone();
    let columns = Columns::locate(&headers);
    if columns.filename.is_none() {
        return Err(AppError::parse("csv", "metadata sheet has no Filename column"));
    }

    let mut sheet = MetadataSheet::default();
    for record in reader.records() {
        let record = record.map_err(|e| AppError::parse("csv", e.to_string()))?;
        let external_id = cell(&record, columns.id);

        if let (Some(id), Some(media)) = (&external_id, cell(&record, columns.media)) {
            for path in media.split('|').map(str::trim).filter(|p| !p.is_empty()) {
                sheet
                    .media
                    .insert(basename(path).to_ascii_lowercase(), id.clone());
            }
        }

        let Some(filename) = cell(&record, columns.filename) else {
            continue;
        };
        sheet.hints.push(MetadataHint {
            source_filename: basename(&filename).to_ascii_lowercase(),
            name: cell(&record, columns.name),
            gear: cell(&record, columns.gear),
            external_id,
            sport_label: cell(&record, columns.sport),
            updated_at: now,
        });
    }

    tracing::debug!(
        hints = sheet.hints.len(),
        media = sheet.media.len(),
        "Parsed metadata sheet"
    );
    Ok(sheet)
}
