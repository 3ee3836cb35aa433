//! Wall-clock timestamps for run metadata and crash triage files.

use std::time::SystemTime;

pub fn wall_time_iso_utc() -> String {
    let dt: time::OffsetDateTime = SystemTime::now().into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Compact `YYYYMMDD HHMMSS` stamp written next to archived crashes.
pub fn crash_timestamp() -> String {
    let dt: time::OffsetDateTime = SystemTime::now().into();
    dt.format(time::macros::format_description!("[year][month][day] [hour][minute][second]"))
        .unwrap_or_else(|_| "19700101 000000".to_string())
}
