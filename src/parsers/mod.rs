// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Activity file parsers.

pub mod fit;
pub mod gpx;
pub mod normalize;
pub mod tcx;
pub mod xml;

use crate::error::{AppError, Result};
use crate::models::ParsedActivity;
use crate::services::detect::FileFormat;

/// Parse decompressed bytes of a detected format.
///
/// CSV is not an activity format; callers route it to the metadata sheet
/// handler before getting here.
pub fn parse(format: FileFormat, bytes: &[u8], fallback_name: &str) -> Result<ParsedActivity> {
    match format {
        FileFormat::Fit => fit::parse(bytes, fallback_name),
        FileFormat::Gpx => gpx::parse(bytes, fallback_name),
        FileFormat::Tcx => tcx::parse(bytes, fallback_name),
        FileFormat::Csv => Err(AppError::UnsupportedFormat(format!(
            "{} is a CSV file, not an activity",
            fallback_name
        ))),
    }
}
