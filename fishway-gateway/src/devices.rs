/**
 * DEVICE REGISTRY - Devices that have ever sent telemetry
 *
 * ROLE: remembers first/last sighting per device id so the panel can list
 * controllers without scanning telemetry. Persisted as pretty JSON in
 * `<data_dir>/devices.json`, written through a temp file then renamed.
 *
 * `mark_seen` is synchronous (it runs on the persistence path); the autosave
 * task flushes to disk only when something changed.
 */

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub display_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_seen_at: Option<OffsetDateTime>,
}

pub type DevicesMap = HashMap<String, DeviceRecord>;

pub struct DeviceRegistry {
    devices: RwLock<DevicesMap>,
    data_file: PathBuf,
    dirty: AtomicBool,
}

impl DeviceRegistry {
    pub fn new(data_file: impl Into<PathBuf>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            data_file: data_file.into(),
            dirty: AtomicBool::new(false),
        }
    }

    pub async fn load(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.data_file).await.unwrap_or(false) {
            info!("no device registry at {}, starting fresh", self.data_file.display());
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.data_file).await?;
        let loaded: DevicesMap = serde_json::from_str(&content)?;
        let count = loaded.len();
        *self.devices.write() = loaded;
        info!("loaded {count} devices from {}", self.data_file.display());
        Ok(())
    }

    /// Writes the registry out. The dirty flag is cleared together with the
    /// snapshot and restored when the write fails, so a later autosave tick
    /// retries.
    pub async fn save(&self) -> Result<()> {
        let content = {
            let devices = self.devices.read();
            let content = serde_json::to_string_pretty(&*devices)?;
            self.dirty.store(false, Ordering::Release);
            content
        };

        if let Err(e) = self.write_file(content).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!("device registry saved to {}", self.data_file.display());
        Ok(())
    }

    async fn write_file(&self, content: String) -> Result<()> {
        let tmp = self.data_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.data_file).await?;
        Ok(())
    }

    /// Records a sighting. Creates the entry the first time a device shows up;
    /// `last_seen_at` never moves backwards.
    pub fn mark_seen(&self, device_id: &str, at: OffsetDateTime) {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return;
        }

        let mut devices = self.devices.write();
        let entry = devices.entry(device_id.to_string()).or_insert_with(|| {
            info!("new device: {device_id}");
            DeviceRecord {
                device_id: device_id.to_string(),
                display_name: None,
                created_at: at,
                last_seen_at: None,
            }
        });
        if entry.last_seen_at.map_or(true, |prev| prev < at) {
            entry.last_seen_at = Some(at);
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Most recently seen first; never-seen devices sort by creation time.
    pub fn list(&self) -> Vec<DeviceRecord> {
        let mut out: Vec<DeviceRecord> = self.devices.read().values().cloned().collect();
        out.sort_by(|a, b| {
            let ka = a.last_seen_at.unwrap_or(a.created_at);
            let kb = b.last_seen_at.unwrap_or(b.created_at);
            kb.cmp(&ka).then_with(|| a.device_id.cmp(&b.device_id))
        });
        out
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Flushes the registry every `every` when it changed since the last save.
    pub fn start_autosave(registry: Arc<DeviceRegistry>, every: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if !registry.is_dirty() {
                    continue;
                }
                if let Err(e) = registry.save().await {
                    warn!("failed to save device registry: {e}");
                }
            }
        });
    }
}
