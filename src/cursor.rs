// Pagination cursor codec

use crate::record::ListedRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::debug;

/// Position of a record in the (timestamp desc, id desc) order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub timestamp: String,
    pub id: String,
}

impl CursorPayload {
    /// True if `record` sorts strictly after this position:
    /// `timestamp < cursor.timestamp OR (timestamp == cursor.timestamp AND id < cursor.id)`
    pub fn precedes(&self, record: &ListedRecord) -> bool {
        match record.timestamp.as_str().cmp(self.timestamp.as_str()) {
            Ordering::Less => true,
            Ordering::Equal => record.id.as_str() < self.id.as_str(),
            Ordering::Greater => false,
        }
    }
}

/// Encode the position of `record` as opaque cursor text
pub fn encode(record: Option<&ListedRecord>) -> Option<String> {
    let record = record?;
    let payload = CursorPayload {
        timestamp: record.timestamp.clone(),
        id: record.id.clone(),
    };
    serde_json::to_string(&payload).ok()
}

/// Decode cursor text. Anything that is not an object with string
/// `timestamp` and `id` fields counts as no cursor.
pub fn decode(cursor: Option<&str>) -> Option<CursorPayload> {
    let text = cursor?;
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Ignoring malformed cursor");
            return None;
        }
    };

    // Structs also deserialize from arrays, so check the shape by hand
    let object = value.as_object()?;
    match (object.get("timestamp"), object.get("id")) {
        (Some(Value::String(timestamp)), Some(Value::String(id))) => Some(CursorPayload {
            timestamp: timestamp.clone(),
            id: id.clone(),
        }),
        _ => {
            debug!(cursor = text, "Ignoring cursor without string timestamp and id");
            None
        }
    }
}
