/**
 * TELEMETRY STORE - Persistence seam for device telemetry
 *
 * ROLE:
 * The gateway itself keeps no durable state. Every parsed telemetry message
 * is handed to a `TelemetryStore`, and the history/replay read path queries
 * it back. Production deployments plug a real database behind this trait;
 * the crate ships `MemoryTelemetryStore` so the binary runs standalone.
 *
 * CONTRACT:
 * - rows are ordered by `received_at`, equal timestamps keep insertion order
 * - windows are inclusive on both ends (`from <= ts <= to`)
 * - `sample_window` returns rows 1, 1+stride, 1+2*stride... of the window
 */

pub mod memory;

pub use memory::MemoryTelemetryStore;

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::devices::DeviceRegistry;
use crate::models::TelemetryRecord;
use crate::telemetry::TelemetryPersistence;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

pub trait TelemetryStore: Send + Sync {
    fn insert(&self, row: TelemetryRecord) -> Result<(), StoreError>;

    /// Most recent row for a device.
    fn latest(&self, device_id: &str) -> Result<Option<TelemetryRecord>, StoreError>;

    fn count_in_window(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<usize, StoreError>;

    /// Every `stride`-th row of the window, ascending. A stride of 0 is treated as 1.
    fn sample_window(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
        stride: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError>;

    /// First `limit` rows of the window, ascending.
    fn range(
        &self,
        device_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError>;

    /// Deletes rows older than `cutoff`, returns how many went away.
    fn purge_older_than(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError>;
}

/// Persistence collaborator used by the telemetry fan-out: marks the device
/// as seen, then stores the row.
pub struct StorePersistence {
    store: Arc<dyn TelemetryStore>,
    devices: Arc<DeviceRegistry>,
}

impl StorePersistence {
    pub fn new(store: Arc<dyn TelemetryStore>, devices: Arc<DeviceRegistry>) -> Self {
        Self { store, devices }
    }
}

impl TelemetryPersistence for StorePersistence {
    fn persist(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        self.devices.mark_seen(&record.device_id, record.received_at);
        self.store.insert(record.clone())?;
        Ok(())
    }
}

/// Periodic retention cleanup: drops rows older than `retention_days`.
pub fn spawn_retention_job(
    store: Arc<dyn TelemetryStore>,
    retention_days: u32,
    every: Duration,
) -> JoinHandle<()> {
    let days = i64::from(retention_days.clamp(1, 3650));
    info!("telemetry retention: {days} days, checked every {}s", every.as_secs());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let cutoff = OffsetDateTime::now_utc() - time::Duration::days(days);
            match store.purge_older_than(cutoff) {
                Ok(0) => debug!("retention: nothing to purge"),
                Ok(n) => info!("retention: purged {n} telemetry rows"),
                Err(e) => warn!("retention cleanup failed: {e}"),
            }
        }
    })
}
