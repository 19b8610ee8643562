use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, Local};

/// Parse a timestamp as sent by the server (`2023-05-02T10:11:12.123456+02:00`).
///
/// The colon of the UTC offset is removed before parsing with or without
/// fractional seconds.
pub fn parse_server_timestamp(value: &str) -> Result<DateTime<FixedOffset>> {
    let value = value.trim();
    let normalized = strip_offset_colon(value);

    DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%z"))
        .map_err(|e| anyhow!("Invalid timestamp '{}': {}", value, e))
}

/// Parse a server timestamp and convert it to the local timezone
pub fn to_local(value: &str) -> Result<DateTime<Local>> {
    Ok(parse_server_timestamp(value)?.with_timezone(&Local))
}

fn strip_offset_colon(value: &str) -> String {
    let bytes = value.as_bytes();
    let len = bytes.len();
    if len >= 6 && bytes[len - 3] == b':' && matches!(bytes[len - 6], b'+' | b'-') {
        format!("{}{}", &value[..len - 3], &value[len - 2..])
    } else if value.ends_with('Z') {
        format!("{}+0000", &value[..len - 1])
    } else {
        value.to_string()
    }
}
