//! In-memory telemetry store: per-device vectors kept sorted by time.
//!
//! Good enough for a single panel process and for tests. Data is lost on
//! restart, and memory is bounded only by the retention job.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::Range;
use time::OffsetDateTime;

use super::{StoreError, TelemetryStore};
use crate::models::TelemetryRecord;

#[derive(Default)]
pub struct MemoryTelemetryStore {
    rows: RwLock<HashMap<String, Vec<TelemetryRecord>>>,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_rows(&self) -> usize {
        self.rows.read().values().map(Vec::len).sum()
    }
}

/// Index range of rows with `from <= received_at <= to`.
fn window(rows: &[TelemetryRecord], from: OffsetDateTime, to: OffsetDateTime) -> Range<usize> {
    if from > to {
        return 0..0;
    }
    let start = rows.partition_point(|r| r.received_at < from);
    let end = rows.partition_point(|r| r.received_at <= to);
    start..end.max(start)
}

impl TelemetryStore for MemoryTelemetryStore {
    fn insert(&self, row: TelemetryRecord) -> Result<(), StoreError> {
        let mut map = self.rows.write();
        let rows = map.entry(row.device_id.clone()).or_default();
        // after any row with the same timestamp, so arrival order is kept
        let at = rows.partition_point(|r| r.received_at <= row.received_at);
        rows.insert(at, row);
        Ok(())
    }

    fn latest(&self, device_id: &str) -> Result<Option<TelemetryRecord>, StoreError> {
        Ok(self.rows.read().get(device_id).and_then(|rows| rows.last().cloned()))
    }

    fn count_in_window(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<usize, StoreError> {
        let map = self.rows.read();
        Ok(map.get(device_id).map(|rows| window(rows, from, to).len()).unwrap_or(0))
    }

    fn sample_window(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
        stride: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let map = self.rows.read();
        let Some(rows) = map.get(device_id) else {
            return Ok(Vec::new());
        };
        Ok(rows[window(rows, from, to)].iter().step_by(stride.max(1)).cloned().collect())
    }

    fn range(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        if from >= to {
            return Err(StoreError::InvalidQuery("empty time range".into()));
        }
        let map = self.rows.read();
        let Some(rows) = map.get(device_id) else {
            return Ok(Vec::new());
        };
        Ok(rows[window(rows, from, to)].iter().take(limit).cloned().collect())
    }

    fn purge_older_than(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let mut map = self.rows.write();
        let mut removed = 0;
        for rows in map.values_mut() {
            let stale = rows.partition_point(|r| r.received_at < cutoff);
            rows.drain(..stale);
            removed += stale;
        }
        map.retain(|_, rows| !rows.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn row(device: &str, at: OffsetDateTime, n: i64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device.into(),
            received_at: at,
            payload: json!({ "n": n }),
            topic: format!("{device}/device/telemetry"),
        }
    }

    fn seeded() -> MemoryTelemetryStore {
        let store = MemoryTelemetryStore::new();
        let t0 = datetime!(2026-01-01 00:00 UTC);
        // inserted out of order on purpose
        for i in [3i64, 0, 4, 1, 2] {
            store.insert(row("fish1", t0 + time::Duration::seconds(i * 10), i)).unwrap();
        }
        store.insert(row("fish2", t0, 99)).unwrap();
        store
    }

    #[test]
    fn rows_come_back_in_time_order() {
        let store = seeded();
        let t0 = datetime!(2026-01-01 00:00 UTC);
        let rows = store.range("fish1", t0, t0 + time::Duration::hours(1), 100).unwrap();
        let ns: Vec<i64> = rows.iter().map(|r| r.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.latest("fish1").unwrap().unwrap().payload["n"], 4);
    }

    #[test]
    fn window_is_inclusive() {
        let store = seeded();
        let t0 = datetime!(2026-01-01 00:00 UTC);
        let (from, to) = (t0 + time::Duration::seconds(10), t0 + time::Duration::seconds(30));
        let n = store.count_in_window("fish1", from, to).unwrap();
        assert_eq!(n, 3);
        assert_eq!(store.count_in_window("fish1", t0 + time::Duration::hours(1), t0).unwrap(), 0);
        assert_eq!(store.count_in_window("nobody", t0, t0 + time::Duration::hours(1)).unwrap(), 0);
    }

    #[test]
    fn sample_window_takes_every_stride_th_row() {
        let store = seeded();
        let t0 = datetime!(2026-01-01 00:00 UTC);
        let rows = store.sample_window("fish1", t0, t0 + time::Duration::hours(1), 2).unwrap();
        let ns: Vec<i64> = rows.iter().map(|r| r.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 2, 4]);

        let all = store.sample_window("fish1", t0, t0 + time::Duration::hours(1), 0).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let store = MemoryTelemetryStore::new();
        let t = datetime!(2026-01-01 00:00 UTC);
        store.insert(row("fish1", t, 1)).unwrap();
        store.insert(row("fish1", t, 2)).unwrap();
        assert_eq!(store.latest("fish1").unwrap().unwrap().payload["n"], 2);
    }

    #[test]
    fn range_rejects_empty_window_and_honours_limit() {
        let store = seeded();
        let t0 = datetime!(2026-01-01 00:00 UTC);
        assert!(matches!(store.range("fish1", t0, t0, 10), Err(StoreError::InvalidQuery(_))));
        assert_eq!(store.range("fish1", t0, t0 + time::Duration::hours(1), 2).unwrap().len(), 2);
    }

    #[test]
    fn purge_drops_old_rows_and_empty_devices() {
        let store = seeded();
        let t0 = datetime!(2026-01-01 00:00 UTC);
        let removed = store.purge_older_than(t0 + time::Duration::seconds(20)).unwrap();
        assert_eq!(removed, 3); // fish1 n=0,1 and fish2
        assert_eq!(store.total_rows(), 3);
        assert_eq!(store.latest("fish2").unwrap(), None);
    }
}
