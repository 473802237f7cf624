//! Internal helpers for validation and conversion.
//!
//! These utilities are **not** part of the public API.

use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::{EngineError, ResultEngine};

/// Parse a UUID from storage and return a labeled error on failure.
pub(crate) fn parse_uuid(value: &str, label: &str) -> ResultEngine<Uuid> {
    Uuid::parse_str(value).map_err(|_| EngineError::InvalidId(format!("invalid {label} id")))
}

/// Display form of a handle: trimmed, without the leading `@`.
pub(crate) fn clean_handle(value: &str) -> String {
    value.trim().trim_start_matches('@').trim().to_string()
}

/// Lookup key for a handle: case-insensitive, `@`-stripped, NFKC-normalized.
///
/// Returns `None` when nothing remains after cleaning.
pub(crate) fn normalize_handle(value: &str) -> Option<String> {
    let cleaned = clean_handle(value);
    if cleaned.is_empty() {
        return None;
    }
    Some(cleaned.nfkc().collect::<String>().to_lowercase())
}

pub(crate) fn require_text(value: &str, label: &str) -> ResultEngine<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(format!("{label} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn normalize_optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
