// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Parses and generates the on-disk filenames described in the external
//! interfaces: `segment_YYYYMMDD_HHMMSS.ts` (preferred) and the legacy
//! `HHMMSS.ts` form, plus the deterministic `<camera>_<YYYYMMDD_HHMM>_chunk`
//! chunk id.

use jiff::civil::DateTime;
use jiff::tz::TimeZone;
use jiff::Timestamp;

/// Parses a segment filename, returning its start time.
///
/// The legacy `HHMMSS.ts` form carries no date; its day is inferred from
/// `scan_window_start`, which is unsafe across a midnight boundary (flagged,
/// not resolved, per the open question about this ambiguity in the
/// original format).
pub fn parse_segment_filename(name: &str, scan_window_start: Timestamp) -> Option<Timestamp> {
    let stem = name.strip_suffix(".ts")?;
    if let Some(rest) = stem.strip_prefix("segment_") {
        let (date, time) = rest.split_once('_')?;
        return parse_date_time(date, time);
    }
    if stem.len() == 6 && stem.bytes().all(|b| b.is_ascii_digit()) {
        let window = scan_window_start.to_zoned(TimeZone::UTC);
        let date = format!("{:04}{:02}{:02}", window.year(), window.month(), window.day());
        return parse_date_time(&date, stem);
    }
    None
}

fn parse_date_time(date: &str, time: &str) -> Option<Timestamp> {
    if date.len() != 8 || time.len() != 6 {
        return None;
    }
    let year: i16 = date[0..4].parse().ok()?;
    let month: i8 = date[4..6].parse().ok()?;
    let day: i8 = date[6..8].parse().ok()?;
    let hour: i8 = time[0..2].parse().ok()?;
    let minute: i8 = time[2..4].parse().ok()?;
    let second: i8 = time[4..6].parse().ok()?;
    let dt = DateTime::new(year, month, day, hour, minute, second, 0).ok()?;
    Some(dt.to_zoned(TimeZone::UTC).ok()?.timestamp())
}

/// The filename a preferred-format segment starting at `start` would have.
pub fn segment_filename(start: Timestamp) -> String {
    format!("segment_{}.ts", start.to_zoned(TimeZone::UTC).strftime("%Y%m%d_%H%M%S"))
}

/// The deterministic chunk id for `camera`'s window starting at `start`:
/// `"<camera>_<YYYYMMDD_HHMM>_chunk"`. Used as both the catalog row id and
/// (with a `.ts` suffix) the on-disk filename, so repeated coalescer runs
/// over the same window are idempotent.
pub fn chunk_id(camera: &str, start: Timestamp) -> String {
    format!("{camera}_{}_chunk", start.to_zoned(TimeZone::UTC).strftime("%Y%m%d_%H%M"))
}

pub fn chunk_filename(camera: &str, start: Timestamp) -> String {
    format!("{}.ts", chunk_id(camera, start))
}
