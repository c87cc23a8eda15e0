/*!
Mock bus for developing without a broker

Implements `BusPublisher` so the gateway publishes into memory. Every
message is recorded for assertions; connectivity and publish failures can be
toggled per test.
*/

use anyhow::Result;
use fishway_gateway::bus::BusPublisher;
use fishway_gateway::error::GatewayError;
use fishway_gateway::topics::command_topic;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MockMessage {
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Clone)]
pub struct MockBus {
    published: Arc<Mutex<Vec<MockMessage>>>,
    connected: Arc<AtomicBool>,
    fail_publish: Arc<Mutex<Option<String>>>,
}

impl MockBus {
    /// Starts connected.
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
            fail_publish: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Makes every following publish fail with `reason`; `None` restores.
    pub fn fail_publishes_with(&self, reason: Option<&str>) {
        *self.fail_publish.lock() = reason.map(str::to_string);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    /// Last message on `topic` parsed as JSON.
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusPublisher for MockBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        if let Some(reason) = self.fail_publish.lock().clone() {
            return Err(GatewayError::Publish(reason));
        }
        debug!("[mock] published to {topic}: {} bytes", payload.len());
        self.published.lock().push(MockMessage { topic: topic.to_string(), payload });
        Ok(())
    }
}

/// Builds payloads shaped like the fishway controller firmware sends them.
pub struct DeviceMessageBuilder;

impl DeviceMessageBuilder {
    pub fn telemetry(inner_mm: i64, inner_ok: bool, outer_mm: i64, outer_ok: bool) -> Value {
        json!({
            "sensor1": { "mm": inner_mm, "valid": inner_ok },
            "sensor2": { "mm": outer_mm, "valid": outer_ok },
            "gate": "closed",
            "auto": true,
        })
    }

    pub fn reply_ok(req_id: &str) -> Value {
        json!({ "ok": true, "req_id": req_id })
    }

    pub fn reply_error(req_id: &str, error: &str) -> Value {
        json!({ "ok": false, "req_id": req_id, "error": error })
    }

    pub fn telemetry_topic(device_id: &str) -> String {
        format!("{device_id}/device/telemetry")
    }

    pub fn reply_topic(device_id: &str) -> String {
        format!("{device_id}/device/reply")
    }

    pub fn log_topic(device_id: &str, stream: &str) -> String {
        format!("{device_id}/device/log/{stream}")
    }

    pub fn command_topic(device_id: &str) -> String {
        command_topic(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_publishes_and_parses_json() {
        let bus = MockBus::new();
        bus.publish("fish1/device/command", br#"{"cmd":"gate_open"}"#.to_vec()).unwrap();
        bus.publish("fish2/device/command", br#"{"cmd":"gate_stop"}"#.to_vec()).unwrap();

        assert_eq!(bus.get_published_messages().len(), 2);
        let last: Option<Value> = bus.get_last_json_message("fish1/device/command").unwrap();
        assert_eq!(last.unwrap()["cmd"], "gate_open");
        assert!(bus.get_last_json_message::<Value>("fish3/device/command").unwrap().is_none());

        bus.clear();
        assert!(bus.get_published_messages().is_empty());
    }

    #[test]
    fn simulates_link_failures() {
        let bus = MockBus::new();
        bus.set_connected(false);
        assert_eq!(bus.publish("t", vec![]), Err(GatewayError::NotConnected));

        bus.set_connected(true);
        bus.fail_publishes_with(Some("queue full"));
        assert_eq!(bus.publish("t", vec![]), Err(GatewayError::Publish("queue full".into())));
        bus.fail_publishes_with(None);
        assert!(bus.publish("t", vec![]).is_ok());
    }

    #[test]
    fn builders_match_controller_shape() {
        let t = DeviceMessageBuilder::telemetry(1200, true, 800, false);
        assert_eq!(t["sensor1"]["mm"], 1200);
        assert_eq!(t["sensor2"]["valid"], false);
        assert_eq!(DeviceMessageBuilder::reply_error("r1", "jam")["error"], "jam");
        assert_eq!(DeviceMessageBuilder::log_topic("fish1", "boot"), "fish1/device/log/boot");
        assert_eq!(DeviceMessageBuilder::command_topic("fish1"), "fish1/device/command");
    }
}
