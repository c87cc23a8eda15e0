/*!
Test harness for the fishway gateway

Builds a complete gateway (memory store, device registry, live feed) on top
of `MockBus`, then lets a test play the device side: push telemetry, logs
and replies through `handle_message`, and read back the commands the
gateway published.
*/

use anyhow::{bail, Context, Result};
use fishway_gateway::config::GatewayConfig;
use fishway_gateway::devices::DeviceRegistry;
use fishway_gateway::error::GatewayError;
use fishway_gateway::gateway::{Gateway, GatewayHooks};
use fishway_gateway::models::TelemetryRecord;
use fishway_gateway::store::{MemoryTelemetryStore, StorePersistence};
use fishway_gateway::telemetry::{LiveFeed, TelemetryPersistence};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::mqtt_stub::{DeviceMessageBuilder, MockBus};

/// Persistence that records rows, forwards them to the real store, and can
/// be told to fail.
pub struct RecordingPersistence {
    inner: StorePersistence,
    records: Mutex<Vec<TelemetryRecord>>,
    fail: AtomicBool,
}

impl RecordingPersistence {
    pub fn new(inner: StorePersistence) -> Self {
        Self { inner, records: Mutex::new(Vec::new()), fail: AtomicBool::new(false) }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }
}

impl TelemetryPersistence for RecordingPersistence {
    fn persist(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            bail!("simulated store outage");
        }
        self.inner.persist(record)?;
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    pub connects: AtomicUsize,
    pub bad_messages: Mutex<Vec<(String, String)>>,
    pub logs: Mutex<Vec<(String, String, String)>>,
    pub replies: Mutex<Vec<(String, Value)>>,
}

impl GatewayHooks for RecordingHooks {
    fn on_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bad_message(&self, topic: &str, err: &GatewayError) {
        self.bad_messages.lock().push((topic.to_string(), err.label().to_string()));
    }

    fn on_log(
        &self,
        device_id: &str,
        name: &str,
        _topic: &str,
        text: &str,
        _received_at: OffsetDateTime,
    ) {
        self.logs.lock().push((device_id.to_string(), name.to_string(), text.to_string()));
    }

    fn on_reply(
        &self,
        device_id: &str,
        _topic: &str,
        payload: &Value,
        _received_at: OffsetDateTime,
    ) {
        self.replies.lock().push((device_id.to_string(), payload.clone()));
    }
}

pub struct TestHarness {
    pub bus: MockBus,
    pub store: Arc<MemoryTelemetryStore>,
    pub devices: Arc<DeviceRegistry>,
    pub live: LiveFeed,
    pub hooks: Arc<RecordingHooks>,
    pub persistence: Arc<RecordingPersistence>,
    pub gateway: Arc<Gateway>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(cfg: GatewayConfig) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();

        let bus = MockBus::new();
        let store = Arc::new(MemoryTelemetryStore::new());
        let devices_file = std::env::temp_dir().join("fishway-devkit-devices.json");
        let devices = Arc::new(DeviceRegistry::new(devices_file));
        let live = LiveFeed::new(64);
        let hooks = Arc::new(RecordingHooks::default());
        let sink = StorePersistence::new(store.clone(), devices.clone());
        let persistence = Arc::new(RecordingPersistence::new(sink));

        let gateway = Arc::new(
            Gateway::new(Arc::new(bus.clone()), persistence.clone(), Arc::new(live.clone()), &cfg)
                .with_hooks(hooks.clone()),
        );

        Self { bus, store, devices, live, hooks, persistence, gateway }
    }

    /// Feeds a raw message through the gateway as if it came off the bus.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.gateway.handle_message(topic, payload, OffsetDateTime::now_utc());
    }

    pub fn send_telemetry(&self, device_id: &str, payload: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.deliver(&DeviceMessageBuilder::telemetry_topic(device_id), &bytes);
        Ok(())
    }

    pub fn send_reply(&self, device_id: &str, payload: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.deliver(&DeviceMessageBuilder::reply_topic(device_id), &bytes);
        Ok(())
    }

    pub fn send_log(&self, device_id: &str, stream: &str, text: &str) {
        self.deliver(&DeviceMessageBuilder::log_topic(device_id, stream), text.as_bytes());
    }

    pub fn commands(&self, device_id: &str) -> Vec<Value> {
        self.bus
            .find_messages_by_topic(&DeviceMessageBuilder::command_topic(device_id))
            .iter()
            .filter_map(|m| m.json().ok())
            .collect()
    }

    pub fn last_command(&self, device_id: &str) -> Result<Option<Value>> {
        self.bus.get_last_json_message(&DeviceMessageBuilder::command_topic(device_id))
    }

    /// Waits until at least `count` commands went out to `device_id`.
    pub async fn wait_for_commands(
        &self,
        device_id: &str,
        count: usize,
        timeout_ms: u64,
    ) -> Result<Vec<Value>> {
        let waited = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            loop {
                let sent = self.commands(device_id);
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        match waited {
            Ok(sent) => Ok(sent),
            Err(_) => {
                warn!("timeout waiting for {count} commands to {device_id}");
                let got = self.commands(device_id).len();
                bail!("expected {count} commands to {device_id}, got {got}")
            }
        }
    }

    /// Answers the most recent command with `ok`/`error`, echoing its `req_id`.
    pub fn reply_to_last_command(&self, device_id: &str, error: Option<&str>) -> Result<String> {
        let cmd = self.last_command(device_id)?.context("no command sent")?;
        let req_id = cmd["req_id"].as_str().context("command without req_id")?.to_string();
        let reply = match error {
            None => DeviceMessageBuilder::reply_ok(&req_id),
            Some(e) => DeviceMessageBuilder::reply_error(&req_id, e),
        };
        self.send_reply(device_id, &reply)?;
        Ok(req_id)
    }

    /// Persistence runs on the blocking pool; wait for it to catch up.
    pub async fn wait_for_persisted(&self, count: usize, timeout_ms: u64) -> Result<()> {
        let caught_up = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            while self.persistence.records().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if caught_up.is_err() {
            bail!("expected {count} persisted rows, got {}", self.persistence.records().len());
        }
        Ok(())
    }

    /// Asserts a field (dot path) of the last command to `device_id`.
    pub fn assert_command_field(
        &self,
        device_id: &str,
        field_path: &str,
        expected: &Value,
    ) -> Result<()> {
        let Some(cmd) = self.last_command(device_id)? else {
            bail!("no command sent to {device_id}");
        };
        match get_nested_field(&cmd, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => {
                bail!("field '{field_path}' mismatch: expected {expected:?}, got {actual:?}")
            }
            None => bail!("field '{field_path}' missing from last command to {device_id}"),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let messages = self.bus.get_published_messages();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
            persisted_rows: self.store.total_rows(),
            pending_requests: self.gateway.pending_requests(),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub persisted_rows: usize,
    pub pending_requests: usize,
}

impl TestStats {
    pub fn log(&self) {
        info!(
            total = self.total_messages,
            persisted = self.persisted_rows,
            pending = self.pending_requests,
            "harness stats: {:?}",
            self.topic_counts
        );
    }
}
