/**
 * GATEWAY - Inbound dispatch and the outward-facing operations
 *
 * Every message the bus loop receives lands in `handle_message`:
 *   log       -> lossy text into the log cache, then `on_log`
 *   reply     -> correlator, then `on_reply` (matched or not)
 *   telemetry -> fan-out (snapshot, persistence, live feed)
 *   unknown   -> dropped before any parsing
 *
 * One bad message is reported through `on_bad_message` and never affects the
 * next one.
 */

use serde_json::{json, Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::bus::{BusPublisher, ConnectionSnapshot, InboundHandler};
use crate::config::GatewayConfig;
use crate::correlator::Correlator;
use crate::error::GatewayError;
use crate::log_cache::LogCache;
use crate::models::TelemetryRecord;
use crate::telemetry::{TelemetryBroadcast, TelemetryFanout, TelemetryPersistence};
use crate::topics::{classify, command_topic, MessageClass};

/// Observer hooks. Defaults only log.
pub trait GatewayHooks: Send + Sync {
    fn on_connect(&self) {
        info!("bus connected, subscriptions requested");
    }

    fn on_bad_message(&self, topic: &str, err: &GatewayError) {
        warn!(topic, "dropping message: {err}");
    }

    fn on_log(
        &self,
        device_id: &str,
        name: &str,
        topic: &str,
        text: &str,
        _received_at: OffsetDateTime,
    ) {
        debug!(device = device_id, stream = name, topic, "log: {} bytes", text.len());
    }

    fn on_reply(
        &self,
        device_id: &str,
        topic: &str,
        payload: &Value,
        _received_at: OffsetDateTime,
    ) {
        debug!(device = device_id, topic, "reply: {payload}");
    }
}

pub struct TracingHooks;

impl GatewayHooks for TracingHooks {}

pub struct Gateway {
    bus: Arc<dyn BusPublisher>,
    correlator: Correlator,
    telemetry: TelemetryFanout,
    logs: LogCache,
    hooks: Arc<dyn GatewayHooks>,
    default_device_id: String,
    default_timeout_ms: u64,
}

impl Gateway {
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        persistence: Arc<dyn TelemetryPersistence>,
        broadcast: Arc<dyn TelemetryBroadcast>,
        cfg: &GatewayConfig,
    ) -> Self {
        Self {
            correlator: Correlator::new(bus.clone()),
            bus,
            telemetry: TelemetryFanout::new(persistence, broadcast),
            logs: LogCache::from_config(&cfg.log_cache),
            hooks: Arc::new(TracingHooks),
            default_device_id: cfg.default_device_id.clone(),
            default_timeout_ms: cfg.rpc_timeout_ms,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn GatewayHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn handle_message(&self, topic: &str, payload: &[u8], received_at: OffsetDateTime) {
        let classified = classify(topic);
        let device_id = if classified.device_id.is_empty() {
            self.default_device_id.clone()
        } else {
            classified.device_id
        };

        let kind = match classified.class {
            MessageClass::Log { stream } => {
                let text = String::from_utf8_lossy(payload);
                self.logs.append(&device_id, &stream, &text);
                self.hooks.on_log(&device_id, &stream, topic, &text, received_at);
                return;
            }
            MessageClass::Unknown => {
                debug!(topic, "ignoring message on unrecognised topic");
                return;
            }
            kind => kind,
        };

        let value = match parse_payload(payload) {
            Ok(v) => v,
            Err(e) => {
                self.hooks.on_bad_message(topic, &e);
                return;
            }
        };

        match kind {
            MessageClass::Reply => {
                self.correlator.resolve(&device_id, &value);
                self.hooks.on_reply(&device_id, topic, &value, received_at);
            }
            MessageClass::Telemetry => {
                let payload = if value.is_null() { Value::Object(Map::new()) } else { value };
                self.telemetry.ingest(TelemetryRecord {
                    device_id,
                    received_at,
                    payload,
                    topic: topic.to_string(),
                });
            }
            MessageClass::Log { .. } | MessageClass::Unknown => {}
        }
    }

    /// Correlated call; `timeout_ms` falls back to the configured default.
    pub async fn call(
        &self,
        device_id: &str,
        message: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, GatewayError> {
        let timeout_ms = timeout_ms.or(Some(self.default_timeout_ms));
        self.correlator.call(device_id, message, timeout_ms).await
    }

    /// Fire-and-forget publish of a JSON object to the device command topic.
    /// Returns the topic it went to.
    pub fn publish_message(&self, device_id: &str, message: Value) -> Result<String, GatewayError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(GatewayError::InvalidRequest("missing deviceId".into()));
        }
        if !message.is_object() {
            return Err(GatewayError::InvalidRequest("message must be an object".into()));
        }
        if !self.bus.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let topic = command_topic(device_id);
        let payload =
            serde_json::to_vec(&message).map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        self.bus.publish(&topic, payload)?;
        Ok(topic)
    }

    pub fn publish_command(&self, device_id: &str, cmd: &str) -> Result<String, GatewayError> {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            return Err(GatewayError::InvalidRequest("missing_cmd".into()));
        }
        self.publish_message(device_id, json!({ "cmd": cmd }))
    }

    pub fn connected(&self) -> bool {
        self.bus.is_connected()
    }

    pub fn status(&self) -> ConnectionSnapshot {
        self.bus.status()
    }

    pub fn latest(&self, device_id: &str) -> Option<TelemetryRecord> {
        self.telemetry.latest(device_id)
    }

    pub fn logs(&self) -> &LogCache {
        &self.logs
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn default_device_id(&self) -> &str {
        &self.default_device_id
    }

    pub fn tracked_devices(&self) -> usize {
        self.telemetry.tracked_devices()
    }
}

impl InboundHandler for Gateway {
    fn on_connect(&self) {
        self.hooks.on_connect();
    }

    fn on_message(&self, topic: &str, payload: &[u8], received_at: OffsetDateTime) {
        self.handle_message(topic, payload, received_at);
    }
}

/// Empty body is JSON null.
fn parse_payload(payload: &[u8]) -> Result<Value, GatewayError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload).map_err(|e| GatewayError::MalformedPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Sink {
        rows: Mutex<Vec<TelemetryRecord>>,
    }

    impl TelemetryPersistence for Sink {
        fn persist(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
            self.rows.lock().push(record.clone());
            Ok(())
        }
    }

    impl TelemetryBroadcast for Sink {
        fn broadcast(&self, _: &TelemetryRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Bus {
        up: AtomicBool,
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl BusPublisher for Bus {
        fn is_connected(&self) -> bool {
            self.up.load(Ordering::Relaxed)
        }

        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
            self.sent.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Seen {
        bad: Mutex<Vec<String>>,
        replies: Mutex<Vec<(String, Value)>>,
        logs: Mutex<Vec<(String, String, String)>>,
    }

    impl GatewayHooks for Seen {
        fn on_bad_message(&self, topic: &str, _: &GatewayError) {
            self.bad.lock().push(topic.to_string());
        }
        fn on_log(&self, device_id: &str, name: &str, _: &str, text: &str, _: OffsetDateTime) {
            self.logs.lock().push((device_id.into(), name.into(), text.into()));
        }
        fn on_reply(&self, device_id: &str, _: &str, payload: &Value, _: OffsetDateTime) {
            self.replies.lock().push((device_id.into(), payload.clone()));
        }
    }

    fn gateway() -> (Arc<Bus>, Arc<Sink>, Arc<Seen>, Gateway) {
        let bus = Arc::new(Bus { up: AtomicBool::new(true), sent: Mutex::new(Vec::new()) });
        let sink = Arc::new(Sink::default());
        let seen = Arc::new(Seen::default());
        let gw = Gateway::new(bus.clone(), sink.clone(), sink.clone(), &GatewayConfig::default())
            .with_hooks(seen.clone());
        (bus, sink, seen, gw)
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn telemetry_updates_snapshot_and_store() {
        let (_bus, sink, _seen, gw) = gateway();
        gw.handle_message("fish1/device/telemetry", br#"{"sensor1":{"mm":120}}"#, now());

        let latest = gw.latest("fish1").unwrap();
        assert_eq!(latest.payload["sensor1"]["mm"], 120);
        assert_eq!(latest.topic, "fish1/device/telemetry");
        assert_eq!(sink.rows.lock().len(), 1);
    }

    #[test]
    fn empty_telemetry_body_becomes_empty_object() {
        let (_bus, _sink, _seen, gw) = gateway();
        gw.handle_message("fish1/device/telemetry", b"", now());
        assert_eq!(gw.latest("fish1").unwrap().payload, json!({}));
    }

    #[test]
    fn bad_json_is_reported_and_isolated() {
        let (_bus, sink, seen, gw) = gateway();
        gw.handle_message("fish1/device/telemetry", b"{nope", now());
        gw.handle_message("fish1/device/reply", &[0xff, 0xfe], now());
        gw.handle_message("fish1/device/telemetry", br#"{"ok":1}"#, now());

        assert_eq!(seen.bad.lock().len(), 2);
        assert_eq!(sink.rows.lock().len(), 1);
    }

    #[test]
    fn logs_are_cached_as_text_never_parsed() {
        let (_bus, sink, seen, gw) = gateway();
        gw.handle_message("fish1/device/log/BOOT", b"{not json either", now());

        assert_eq!(gw.logs().tail("fish1", "boot", 1024), "{not json either");
        assert_eq!(seen.logs.lock()[0], ("fish1".into(), "boot".into(), "{not json either".into()));
        assert!(seen.bad.lock().is_empty());
        assert!(sink.rows.lock().is_empty());
    }

    #[test]
    fn unsolicited_reply_reaches_observer() {
        let (_bus, _sink, seen, gw) = gateway();
        gw.handle_message("fish1/device/reply", br#"{"ok":true,"state":"idle"}"#, now());
        let replies = seen.replies.lock();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "fish1");
        assert_eq!(replies[0].1["state"], "idle");
    }

    #[test]
    fn unknown_topics_are_dropped() {
        let (_bus, sink, seen, gw) = gateway();
        gw.handle_message("fish1/status", b"{nope", now());
        gw.handle_message("", b"{}", now());
        assert!(seen.bad.lock().is_empty());
        assert!(sink.rows.lock().is_empty());
        assert_eq!(gw.tracked_devices(), 0);
    }

    #[test]
    fn publish_command_targets_device_topic() {
        let (bus, _sink, _seen, gw) = gateway();
        assert_eq!(gw.publish_command("fish1", "gate_open").unwrap(), "fish1/device/command");
        let (topic, payload) = bus.sent.lock()[0].clone();
        assert_eq!(topic, "fish1/device/command");
        assert_eq!(serde_json::from_slice::<Value>(&payload).unwrap(), json!({"cmd": "gate_open"}));

        let invalid =
            |r: Result<String, GatewayError>| matches!(r, Err(GatewayError::InvalidRequest(_)));
        assert!(invalid(gw.publish_command("", "gate_open")));
        assert!(invalid(gw.publish_command("fish1", " ")));
        assert!(invalid(gw.publish_message("fish1", json!([1]))));

        bus.up.store(false, Ordering::Relaxed);
        assert_eq!(gw.publish_command("fish1", "gate_open"), Err(GatewayError::NotConnected));
    }

    #[tokio::test]
    async fn reply_resolves_call_through_dispatch() {
        let (bus, _sink, seen, gw) = gateway();
        let gw = Arc::new(gw);
        let g = gw.clone();
        let call =
            tokio::spawn(async move { g.call("fish1", json!({"cmd": "auto_on"}), None).await });

        while bus.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent: Value = serde_json::from_slice(&bus.sent.lock()[0].1).unwrap();
        let reply = json!({"ok": true, "req_id": sent["req_id"]});
        gw.handle_message("fish1/device/reply", reply.to_string().as_bytes(), now());

        assert_eq!(call.await.unwrap().unwrap()["ok"], true);
        assert_eq!(gw.pending_requests(), 0);
        assert_eq!(seen.replies.lock().len(), 1);
    }
}
