// Data model shared by the state store and the listing engine

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known state keys used by the application
pub const SETTINGS_PREFERENCES: &str = "settings_preferences";
pub const GRID_ROWS: &str = "grid_rows";

/// One persisted state value. The payload is opaque to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Ephemeral notification of a local write (`Some`) or deletion (`None`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub key: String,
    pub payload: Option<Value>,
}

/// A read-only business record served by the listing engine
///
/// Ordered by `timestamp` descending, then `id` descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedRecord {
    pub id: String,
    pub timestamp: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Fields the engine never looks at, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ListedRecord {
    /// Rewrite `timestamp` into the canonical sortable form
    pub fn normalized(mut self) -> Result<Self> {
        self.timestamp = normalize_timestamp(&self.timestamp)?;
        Ok(self)
    }
}

/// Parse an RFC 3339 instant or a bare `YYYY-MM-DD` date (midnight UTC)
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| eyre!("Invalid timestamp: {}", raw))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| eyre!("Invalid timestamp: {}", raw))?;
    Ok(midnight.and_utc())
}

/// Render a timestamp as UTC with millisecond precision.
///
/// Every stored timestamp goes through this, so lexicographic comparison of
/// the strings matches chronological order in SQL and in memory alike.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn normalize_timestamp(raw: &str) -> Result<String> {
    Ok(format_timestamp(&parse_timestamp(raw)?))
}

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
