//! Wall-clock timestamps for log lines and reading records.

use chrono::{DateTime, Local};

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Current local time as ISO-8601 without offset, e.g. `2023-06-15T14:03:22.104512`.
pub fn now() -> String {
    format(&Local::now())
}

pub fn format(at: &DateTime<Local>) -> String {
    at.format(FORMAT).to_string()
}
