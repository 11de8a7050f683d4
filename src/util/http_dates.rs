//! RFC 1123 date conversion for `If-Modified-Since` / `Last-Modified`.

use chrono::{DateTime, TimeZone, Utc};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Epoch seconds to an HTTP date string.
#[must_use]
pub fn to_http_date(ts: i64) -> String {
    let when: DateTime<Utc> = Utc.timestamp_opt(ts, 0).single().unwrap_or_default();
    when.format(HTTP_DATE_FORMAT).to_string()
}

/// HTTP date string to epoch seconds, `None` when unparsable.
#[must_use]
pub fn from_http_date(value: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}
