//! Downsampled level history for charting.
//!
//! The store is asked how many rows the window holds, a stride is derived so
//! at most `max_points` come back, and every stride-th row is reduced to the
//! two water-level readings and their validity flags.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::config::HistoryConf;
use crate::error::GatewayError;
use crate::models::TelemetryRecord;
use crate::store::TelemetryStore;

pub const MIN_POINTS: usize = 100;
pub const MAX_POINTS: usize = 5000;
pub const MIN_WINDOW_S: i64 = 60;
pub const MAX_WINDOW_S: i64 = 30 * 24 * 3600;
pub const DEFAULT_WINDOW_S: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub ts_s: i64,
    pub inner_mm: Option<i64>,
    pub inner_ok: bool,
    pub outer_mm: Option<i64>,
    pub outer_ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub to: OffsetDateTime,
    pub stride: usize,
    pub points: Vec<HistoryPoint>,
}

pub struct Downsampler {
    store: Arc<dyn TelemetryStore>,
    inner_field: String,
    outer_field: String,
}

impl Downsampler {
    pub fn new(store: Arc<dyn TelemetryStore>, conf: &HistoryConf) -> Self {
        Self { store, inner_field: conf.inner_field.clone(), outer_field: conf.outer_field.clone() }
    }

    pub fn history(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
        max_points: usize,
    ) -> Result<HistoryPage, GatewayError> {
        let total = self
            .store
            .count_in_window(device_id, from, to)
            .map_err(|e| GatewayError::Store(e.to_string()))?;
        let stride = stride_for(total, max_points);
        let rows = if total == 0 {
            Vec::new()
        } else {
            self.store
                .sample_window(device_id, from, to, stride)
                .map_err(|e| GatewayError::Store(e.to_string()))?
        };

        Ok(HistoryPage {
            device_id: device_id.to_string(),
            from,
            to,
            stride,
            points: rows.iter().map(|r| self.point(r)).collect(),
        })
    }

    /// Window ending now; `window_s` clamped to 60s..30 days (default 1h),
    /// `max_points` to 100..5000.
    pub fn recent(
        &self,
        device_id: &str,
        window_s: Option<i64>,
        max_points: usize,
    ) -> Result<HistoryPage, GatewayError> {
        let window_s = window_s.unwrap_or(DEFAULT_WINDOW_S).clamp(MIN_WINDOW_S, MAX_WINDOW_S);
        let to = OffsetDateTime::now_utc();
        let from = to - time::Duration::seconds(window_s);
        self.history(device_id, from, to, max_points.clamp(MIN_POINTS, MAX_POINTS))
    }

    fn point(&self, row: &TelemetryRecord) -> HistoryPoint {
        let (inner_mm, inner_ok) = sensor_reading(&row.payload, &self.inner_field);
        let (outer_mm, outer_ok) = sensor_reading(&row.payload, &self.outer_field);
        HistoryPoint {
            ts_s: row.received_at.unix_timestamp(),
            inner_mm,
            inner_ok,
            outer_mm,
            outer_ok,
        }
    }
}

/// `max(1, ceil(count / max(1, max_points)))`
pub fn stride_for(count: usize, max_points: usize) -> usize {
    count.div_ceil(max_points.max(1)).max(1)
}

fn sensor_reading(payload: &Value, field: &str) -> (Option<i64>, bool) {
    let Some(sensor) = payload.get(field) else {
        return (None, false);
    };
    (sensor.get("mm").and_then(as_mm), sensor.get("valid").is_some_and(as_flag))
}

fn as_mm(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(rounded)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().and_then(rounded))
        }
        _ => None,
    }
}

fn rounded(f: f64) -> Option<i64> {
    f.is_finite().then(|| f.round() as i64)
}

fn as_flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}
