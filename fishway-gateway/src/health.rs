use serde::Serialize;
use std::time::Instant;

use crate::bus::ConnectionSnapshot;
use crate::devices::DeviceRegistry;
use crate::gateway::Gateway;

#[derive(Debug, Serialize)]
pub struct GatewayHealth {
    pub uptime_seconds: u64,
    pub mqtt: ConnectionSnapshot,
    pub pending_requests: usize,
    /// Devices with a live snapshot since startup.
    pub devices_tracked: usize,
    pub devices_known: usize,
    pub log_streams: usize,
    pub memory_usage_mb: Option<f32>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn report(&self, gateway: &Gateway, devices: &DeviceRegistry) -> GatewayHealth {
        GatewayHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt: gateway.status(),
            pending_requests: gateway.pending_requests(),
            devices_tracked: gateway.tracked_devices(),
            devices_known: devices.len(),
            log_streams: gateway.logs().stream_count(),
            memory_usage_mb: memory_usage_mb(),
        }
    }
}

/// Resident set size from /proc; `None` off Linux.
fn memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::telemetry::LiveFeed;
    use crate::store::{MemoryTelemetryStore, StorePersistence};
    use crate::bus::BusConnection;
    use std::sync::Arc;

    #[tokio::test]
    async fn report_reflects_gateway_state() {
        let cfg = GatewayConfig::default();
        let (bus, _loop) = BusConnection::new(&cfg.mqtt).unwrap();
        let devices_file = std::env::temp_dir().join("fishway-health.json");
        let devices = Arc::new(DeviceRegistry::new(devices_file));
        let store = Arc::new(MemoryTelemetryStore::new());
        let persistence = Arc::new(StorePersistence::new(store, devices.clone()));
        let gateway = Gateway::new(Arc::new(bus), persistence, Arc::new(LiveFeed::new(4)), &cfg);
        gateway.handle_message("fish1/device/log/error", b"boom", time::OffsetDateTime::now_utc());

        let health = HealthTracker::new().report(&gateway, &devices);
        assert!(!health.mqtt.connected);
        assert_eq!(health.pending_requests, 0);
        assert_eq!(health.log_streams, 1);
        #[cfg(target_os = "linux")]
        assert!(health.memory_usage_mb.is_some());
    }
}
