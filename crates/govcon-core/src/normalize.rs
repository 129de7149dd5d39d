//! Pure, total conversions from raw upstream field text into canonical values.
//!
//! Nothing here returns an error: unparseable input yields `None` and a
//! `debug!` event, and the caller leaves the field absent.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Small-business research program phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProgramPhase {
    #[serde(rename = "I")]
    One,
    #[serde(rename = "II")]
    Two,
    #[serde(rename = "III")]
    Three,
}

impl ProgramPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramPhase::One => "I",
            ProgramPhase::Two => "II",
            ProgramPhase::Three => "III",
        }
    }
}

impl fmt::Display for ProgramPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn text_or_none(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Parses a calendar date from, in order: `YYYY-MM-DD`, a zoneless timestamp,
/// a timestamp with a UTC offset, then `MM/DD/YYYY`. Timestamps keep their
/// local calendar date; offsets are not converted to UTC.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = text_or_none(raw)?;

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, pattern) {
            return Some(ts.date());
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.date_naive());
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(ts.date_naive());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%m/%d/%Y") {
        return Some(date);
    }

    debug!(value = text, "unparseable date");
    None
}

/// Parses an exact decimal after stripping everything but digits, `.` and `-`.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    match Decimal::from_str(&cleaned) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(value = raw, error = %err, "unparseable decimal");
            None
        }
    }
}

/// `Y`, `Yes`, `true`, `1` (any case) are true, any other non-blank text is
/// false, and blank text is unknown.
pub fn parse_flag(raw: &str) -> Option<bool> {
    let text = text_or_none(raw)?;
    Some(
        ["y", "yes", "true", "1"]
            .iter()
            .any(|truthy| text.eq_ignore_ascii_case(truthy)),
    )
}

/// Detects a phase indicator in free text such as a title or a phase column.
///
/// Indicators are read from the run of tokens directly after the word `PHASE`,
/// or from the whole text when it is a bare indicator like `"II"`. A sub-phase
/// letter is allowed (`IIB`, `2A`) and the highest phase in the run wins, so
/// `Phase I/II Fast Track` reports phase two.
pub fn detect_phase(raw: &str) -> Option<ProgramPhase> {
    let upper = raw.to_ascii_uppercase();
    let tokens: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let mut found: Option<ProgramPhase> = None;
    if tokens.contains(&"PHASE") {
        for (i, _) in tokens.iter().enumerate().filter(|(_, t)| **t == "PHASE") {
            let run = tokens[i + 1..].iter().map_while(|t| phase_indicator(t));
            found = found.into_iter().chain(run).max();
        }
    } else if let [only] = tokens.as_slice() {
        found = phase_indicator(only);
    }
    found
}

fn phase_indicator(token: &str) -> Option<ProgramPhase> {
    let (level, suffix) = match token.find(|c: char| !matches!(c, 'I' | '1' | '2' | '3')) {
        Some(at) => token.split_at(at),
        None => (token, ""),
    };
    if !matches!(suffix, "" | "A" | "B" | "C") {
        return None;
    }
    match level {
        "I" | "1" => Some(ProgramPhase::One),
        "II" | "2" => Some(ProgramPhase::Two),
        "III" | "3" => Some(ProgramPhase::Three),
        _ => None,
    }
}

/// True when the text mentions the small-business innovation or technology
/// transfer programs.
pub fn mentions_sbir(raw: &str) -> bool {
    let upper = raw.to_ascii_uppercase();
    upper
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|t| t == "SBIR" || t == "STTR")
}

const DEFENSE_MARKERS: &[&str] = &[
    "DEPARTMENT OF DEFENSE",
    "DEPT OF DEFENSE",
    "DEFENSE ",
    "DEPT OF THE ARMY",
    "DEPARTMENT OF THE ARMY",
    "DEPT OF THE NAVY",
    "DEPARTMENT OF THE NAVY",
    "DEPT OF THE AIR FORCE",
    "DEPARTMENT OF THE AIR FORCE",
    "DARPA",
    "MISSILE DEFENSE",
    "SPACE FORCE",
];

/// True when an agency name refers to the Department of Defense or one of its
/// components.
pub fn is_defense_agency(raw: &str) -> bool {
    let upper = format!("{} ", raw.trim().to_ascii_uppercase());
    if matches!(upper.trim_end(), "DOD" | "DOD." | "USAF" | "ARMY" | "NAVY" | "AIR FORCE") {
        return true;
    }
    upper.starts_with("DOD ") || DEFENSE_MARKERS.iter().any(|m| upper.contains(m))
}

/// Trimmed text, or `None` when blank.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    raw.and_then(text_or_none).map(ToString::to_string)
}
