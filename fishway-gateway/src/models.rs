use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One parsed telemetry message. Doubles as the latest-value snapshot, the
/// stored row and the live event pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub payload: Value,
    /// Bus topic the message arrived on.
    pub topic: String,
}

impl TelemetryRecord {
    pub fn received_at_ms(&self) -> i64 {
        (self.received_at.unix_timestamp_nanos() / 1_000_000) as i64
    }
}
