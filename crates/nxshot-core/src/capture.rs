use std::path::Path;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::capture_ids::CaptureTable;

/// Folder used for captures whose ID is not in the table.
pub const UNKNOWN_GAME: &str = "Unknown";

/// `YYYYMMDDHHMMSSNN-<32 hex>.jpg`
pub const CAPTURE_FILENAME_LEN: usize = 53;

/// First year the console could have produced a capture.
pub const MIN_CAPTURE_YEAR: i32 = 2017;
pub const MAX_CAPTURE_YEAR: i32 = 2099;

const CAPTURE_EXTENSIONS: &[&str] = &["jpg", "mp4"];

static CAPTURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})(?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})(?P<seq>\d{2})-(?P<id>[0-9A-Fa-f]{32})\.(?P<ext>[A-Za-z0-9]{3})$",
    )
    .unwrap()
});

/// Why a filename was excluded from the capture set.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rejection {
    #[error("malformed filename")]
    MalformedFilename,
    #[error("invalid date field: {0}")]
    InvalidDateField(&'static str),
    #[error("invalid calendar date")]
    InvalidCalendarDate,
}

/// One capture file, parsed and resolved to a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    /// Original filename, e.g. `2023051412300100-0123456789ABCDEF0123456789ABCDEF.jpg`
    pub filename: String,
    /// On-device local time of the capture
    pub timestamp: NaiveDateTime,
    /// Per-second sequence number
    pub sequence: u8,
    /// Upper-case 32 hex capture ID
    pub capture_id: String,
    /// Game name, or [`UNKNOWN_GAME`]
    pub display_name: String,
}

impl CaptureRecord {
    /// `{display_name}/{filename}`
    pub fn archive_path(&self) -> String {
        format!("{}/{}", self.display_name, self.filename)
    }

    /// Entry mtime: the capture's calendar fields as-is, no timezone applied.
    pub fn modification_time(&self) -> NaiveDateTime {
        self.timestamp
    }
}

/// Cheap shape check used while enumerating sources: fixed length and a
/// recognized extension. Full validation happens in [`parse_capture_filename`].
pub fn is_capture_filename(filename: &str) -> bool {
    if filename.len() != CAPTURE_FILENAME_LEN {
        return false;
    }
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            CAPTURE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Parse a capture filename into a [`CaptureRecord`].
///
/// Unresolved capture IDs map to [`UNKNOWN_GAME`], never to an error.
pub fn parse_capture_filename(
    filename: &str,
    table: Option<&CaptureTable>,
) -> Result<CaptureRecord, Rejection> {
    if filename.len() != CAPTURE_FILENAME_LEN {
        return Err(Rejection::MalformedFilename);
    }
    let caps = CAPTURE_RE
        .captures(filename)
        .ok_or(Rejection::MalformedFilename)?;

    let ext = &caps["ext"];
    if !CAPTURE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    {
        return Err(Rejection::MalformedFilename);
    }

    // All groups are pure digits, so these parses cannot fail.
    let field = |name: &str| caps[name].parse::<u32>().unwrap_or(u32::MAX);
    let year = field("year") as i32;
    let month = field("month");
    let day = field("day");
    let hour = field("hour");
    let minute = field("minute");
    let second = field("second");

    if !(MIN_CAPTURE_YEAR..=MAX_CAPTURE_YEAR).contains(&year) {
        return Err(Rejection::InvalidDateField("year"));
    }
    if !(1..=12).contains(&month) {
        return Err(Rejection::InvalidDateField("month"));
    }
    if !(1..=31).contains(&day) {
        return Err(Rejection::InvalidDateField("day"));
    }
    if hour > 23 {
        return Err(Rejection::InvalidDateField("hour"));
    }
    if minute > 59 {
        return Err(Rejection::InvalidDateField("minute"));
    }
    if second > 59 {
        return Err(Rejection::InvalidDateField("second"));
    }

    let timestamp = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or(Rejection::InvalidCalendarDate)?;

    let capture_id = caps["id"].to_ascii_uppercase();
    let display_name = table
        .and_then(|t| t.display_name(&capture_id))
        .unwrap_or(UNKNOWN_GAME)
        .to_string();

    Ok(CaptureRecord {
        filename: filename.to_string(),
        timestamp,
        sequence: field("seq") as u8,
        capture_id,
        display_name,
    })
}

/// Make a game name usable as a single folder name.
pub fn sanitize_game_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.nfc() {
        match c {
            ':' => out.push_str(" -"),
            '/' | '\\' | '|' => out.push('-'),
            '?' | '*' | '<' | '>' => {}
            '"' => out.push('\''),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    // Windows refuses folder names ending in a dot or space.
    let trimmed = out.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        UNKNOWN_GAME.to_string()
    } else {
        trimmed.to_string()
    }
}
