/**
 * TELEMETRY FAN-OUT - One parsed telemetry message, three destinations
 *
 * ORDER per message:
 *   1. latest-value snapshot (synchronous, always happens)
 *   2. persistence collaborator (blocking pool, not awaited)
 *   3. broadcast collaborator (non-blocking send)
 *
 * Errors and panics in 2 and 3 are logged and swallowed: a broken database or
 * a dead subscriber must never stall the bus loop or lose the snapshot.
 */

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::models::TelemetryRecord;

/// Durable sink for telemetry rows. Called from the blocking pool.
pub trait TelemetryPersistence: Send + Sync {
    fn persist(&self, record: &TelemetryRecord) -> anyhow::Result<()>;
}

/// Live push to connected clients.
pub trait TelemetryBroadcast: Send + Sync {
    fn broadcast(&self, record: &TelemetryRecord) -> anyhow::Result<()>;
}

/// Broadcast collaborator backed by a tokio broadcast channel. Slow receivers
/// lag and skip, they never block the sender.
#[derive(Clone)]
pub struct LiveFeed {
    tx: broadcast::Sender<TelemetryRecord>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TelemetryBroadcast for LiveFeed {
    fn broadcast(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        // no subscribers is not an error
        let _ = self.tx.send(record.clone());
        Ok(())
    }
}

pub struct TelemetryFanout {
    latest: RwLock<HashMap<String, TelemetryRecord>>,
    persistence: Arc<dyn TelemetryPersistence>,
    broadcast: Arc<dyn TelemetryBroadcast>,
}

impl TelemetryFanout {
    pub fn new(
        persistence: Arc<dyn TelemetryPersistence>,
        broadcast: Arc<dyn TelemetryBroadcast>,
    ) -> Self {
        Self { latest: RwLock::new(HashMap::new()), persistence, broadcast }
    }

    pub fn ingest(&self, record: TelemetryRecord) {
        self.latest.write().insert(record.device_id.clone(), record.clone());

        let _ = self.persist(record.clone());

        let outcome = catch_unwind(AssertUnwindSafe(|| self.broadcast.broadcast(&record)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(device = %record.device_id, "telemetry broadcast failed: {e:#}"),
            Err(_) => error!(device = %record.device_id, "telemetry broadcast panicked"),
        }
    }

    /// Returns the blocking task when a runtime is available.
    fn persist(&self, record: TelemetryRecord) -> Option<JoinHandle<()>> {
        let sink = Arc::clone(&self.persistence);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                Some(handle.spawn_blocking(move || persist_logged(sink.as_ref(), &record)))
            }
            Err(_) => {
                debug!("no tokio runtime, persisting inline");
                persist_logged(sink.as_ref(), &record);
                None
            }
        }
    }

    pub fn latest(&self, device_id: &str) -> Option<TelemetryRecord> {
        self.latest.read().get(device_id).cloned()
    }

    pub fn tracked_devices(&self) -> usize {
        self.latest.read().len()
    }
}

fn persist_logged(sink: &dyn TelemetryPersistence, record: &TelemetryRecord) {
    match catch_unwind(AssertUnwindSafe(|| sink.persist(record))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(device = %record.device_id, "telemetry persist failed: {e:#}"),
        Err(_) => error!(device = %record.device_id, "telemetry persist panicked"),
    }
}
