//! Price text normalization and validation.
//!
//! Raw text scraped off the page arrives decorated: currency symbol, unit
//! suffix, thousands separators, stray whitespace. [`normalize`] strips the
//! decorations and accepts the remainder only if it parses as a finite
//! non-negative number, preserving the original decimal formatting.

use crate::error::FetchError;
use std::fmt;

/// Unit suffixes the target page is known to append to the value.
const UNIT_SUFFIXES: &[&str] = &["USDC", "USD"];

/// Currency symbols and separators stripped before parsing.
const STRIP_CHARS: &[char] = &['$', '€', '£', ','];

/// A validated price: guaranteed to parse as a finite non-negative decimal.
///
/// Immutable once produced. The reconcile loop keeps at most one of these
/// as the last-known value; nothing is persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceValue(String);

impl PriceValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PriceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Clean raw extracted text into a [`PriceValue`].
///
/// Fails with [`FetchError::InvalidFormat`] when nothing parseable remains.
/// Callers must treat that the same as any other fetch failure, never as a
/// crash.
pub fn normalize(raw: &str) -> Result<PriceValue, FetchError> {
    let mut text = raw.trim().to_string();
    for unit in UNIT_SUFFIXES {
        text = text.replace(unit, "");
    }
    let cleaned: String = text
        .chars()
        .filter(|c| !STRIP_CHARS.contains(c) && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() {
        return Err(FetchError::InvalidFormat {
            raw: raw.to_string(),
        });
    }

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(PriceValue(cleaned)),
        _ => Err(FetchError::InvalidFormat {
            raw: raw.to_string(),
        }),
    }
}
