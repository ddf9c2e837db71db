//! Document names for persisted recordings.
//!
//! Phone recorders name files like `Monday at 14-30.m4a`. Those get dated
//! to the most recent such weekday and time not after the file's
//! modification time, e.g. `2024-03-11-14-30-1a2b3c.md`.

use std::path::Path;

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

use crate::domain::RecordingId;

const WEEKDAYS: [(&str, Weekday); 7] = [
    ("Monday", Weekday::Mon),
    ("Tuesday", Weekday::Tue),
    ("Wednesday", Weekday::Wed),
    ("Thursday", Weekday::Thu),
    ("Friday", Weekday::Fri),
    ("Saturday", Weekday::Sat),
    ("Sunday", Weekday::Sun),
];

/// Parse `<Weekday> at HH-MM` (or `HH:MM`) from a file stem
pub fn parse_weekday_time(stem: &str) -> Option<(Weekday, NaiveTime)> {
    let (day, time) = stem.split_once(" at ")?;
    let weekday = WEEKDAYS.iter().find(|(name, _)| *name == day)?.1;

    let bytes = time.as_bytes();
    if bytes.len() != 5 || !matches!(bytes[2], b'-' | b':') {
        return None;
    }
    let (hours, minutes) = (&time[..2], &time[3..]);
    if !hours.bytes().chain(minutes.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let time = NaiveTime::from_hms_opt(hours.parse().ok()?, minutes.parse().ok()?, 0)?;
    Some((weekday, time))
}

/// Most recent `weekday` at `time` that is not after `reference`
pub fn most_recent(weekday: Weekday, time: NaiveTime, reference: NaiveDateTime) -> NaiveDateTime {
    let mut candidate = reference.date().and_time(time);
    while candidate > reference || candidate.weekday() != weekday {
        candidate -= Duration::days(1);
    }
    candidate
}

/// File name (without extension) of the persisted document
pub fn document_name(source: &Path, modified: NaiveDateTime, identity: &RecordingId) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    match parse_weekday_time(&stem) {
        Some((weekday, time)) => format!(
            "{}-{}",
            most_recent(weekday, time, modified).format("%Y-%m-%d-%H-%M"),
            identity.short(6)
        ),
        None => format!("{}-{}", sanitize(&stem), identity.short(6)),
    }
}

/// Keep names portable: alphanumerics, dash and underscore
fn sanitize(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "recording".to_string()
    } else {
        trimmed.to_string()
    }
}
