//! Field normalizer
//!
//! Turns raw text cells into values that fit the store columns: text is
//! trimmed and truncated to the column width, empty cells become null and
//! numbers are parsed without locale assumptions. A cell that fails to parse
//! becomes null (or the column default) instead of failing the whole row.

use crate::model::Table;
use chrono::{DateTime, NaiveDate};
use std::collections::BTreeMap;

/// Bound of the fixed-precision `valor_calculado` column.
pub const MAX_SAFE_VALUE: f64 = 999_999.999_999;
pub const VALUE_DECIMALS: i32 = 6;

/// Fallback limit for a text column with no configured width.
pub const DEFAULT_TEXT_LIMIT: usize = 255;

/// Per-column text limits for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLimits {
    table: String,
    limits: BTreeMap<String, usize>,
}

impl FieldLimits {
    pub fn for_table<T: Table>() -> Self {
        Self {
            table: T::NAME.to_string(),
            limits: T::TEXT_LIMITS
                .iter()
                .map(|(column, max)| (column.to_string(), *max))
                .collect(),
        }
    }

    /// Apply `MAX_LEN_<TABLE>_<COLUMN>` overrides read through `lookup`.
    /// Unparsable or zero values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let columns: Vec<String> = self.limits.keys().cloned().collect();
        for column in columns {
            if let Some(max) = lookup(&self.env_key(&column))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|&max| max > 0)
            {
                self.limits.insert(column, max);
            }
        }
        self
    }

    pub fn set(&mut self, column: &str, max: usize) {
        self.limits.insert(column.to_string(), max);
    }

    pub fn get(&self, column: &str) -> usize {
        self.limits.get(column).copied().unwrap_or(DEFAULT_TEXT_LIMIT)
    }

    pub fn env_key(&self, column: &str) -> String {
        format!("MAX_LEN_{}_{}", self.table, column).to_uppercase()
    }

    /// Normalize a text cell for `column`.
    pub fn text(&self, column: &str, raw: &str) -> Option<String> {
        text(raw, self.get(column))
    }
}

/// Cut `s` to at most `max` characters, never splitting a code point.
pub fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Trim, null out empty cells, truncate to `max` characters.
pub fn text(raw: &str, max: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(truncate(trimmed, max).to_string())
}

/// Locale-agnostic float parsing. A single `,` with no `.` is read as the
/// decimal separator ("12,5" → 12.5); thousands separators are not guessed.
pub fn parse_f64(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value = match trimmed.parse::<f64>() {
        Ok(v) => v,
        Err(_) if trimmed.matches(',').count() == 1 && !trimmed.contains('.') => {
            trimmed.replace(',', ".").parse::<f64>().ok()?
        }
        Err(_) => return None,
    };
    value.is_finite().then_some(value)
}

/// Integer parsing that also accepts integral floats such as "12.0", which
/// spreadsheet exports produce.
pub fn parse_i64(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return Some(v);
    }
    let f = parse_f64(trimmed)?;
    (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Year of a period cell, 0 when it cannot be read.
pub fn parse_period(raw: &str) -> i32 {
    parse_i64(raw)
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(0)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(trimmed).ok().map(|dt| dt.date_naive()))
        .or_else(|| NaiveDate::parse_from_str(trimmed, "%d/%m/%Y").ok())
}

pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "true" | "t" | "1" | "si" | "sí" | "yes" | "y"
    )
}

/// Optional flag cell: empty means "not given".
pub fn parse_flag(raw: &str) -> Option<bool> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(parse_bool(raw))
    }
}

/// Numeric safety clamp for fixed-precision columns: round to 6 decimals and
/// bound to ±999999.999999. NaN cannot be stored and maps to null.
pub fn clamp_value(value: f64) -> Option<f64> {
    if value.is_nan() {
        return None;
    }
    let scale = 10f64.powi(VALUE_DECIMALS);
    let bounded = value.clamp(-MAX_SAFE_VALUE, MAX_SAFE_VALUE);
    let rounded = (bounded * scale).round() / scale;
    Some(rounded.clamp(-MAX_SAFE_VALUE, MAX_SAFE_VALUE))
}
