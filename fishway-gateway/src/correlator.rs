/**
 * REQUEST/REPLY CORRELATOR - Turns fire-and-forget MQTT into awaited calls
 *
 * FLOW:
 * 1. validate (device id, `cmd`), fail fast when the bus is down
 * 2. mint a unique `req_id`, register the pending entry
 * 3. publish on `<device>/device/command`
 * 4. await the oneshot under a timeout
 *
 * The pending entry is registered before publishing so a fast reply can never
 * miss it, and a drop guard removes it on every exit path (reply, timeout,
 * publish failure, caller dropping the future).
 *
 * A reply resolves the entry whose id it carries. Same id from another device
 * topic is a `DeviceMismatch`; `ok` falsy is a `DeviceError`.
 */

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::BusPublisher;
use crate::error::GatewayError;
use crate::topics::command_topic;

pub const DEFAULT_TIMEOUT_MS: u64 = 6000;
pub const MIN_TIMEOUT_MS: u64 = 500;

type ReplyResult = Result<Value, GatewayError>;

struct PendingRequest {
    device_id: String,
    created_at: OffsetDateTime,
    reply_tx: oneshot::Sender<ReplyResult>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Removes the pending entry when the call finishes, however it finishes.
struct PendingGuard {
    pending: PendingMap,
    req_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.req_id);
    }
}

pub struct Correlator {
    bus: Arc<dyn BusPublisher>,
    pending: PendingMap,
    seq: AtomicU64,
}

impl Correlator {
    pub fn new(bus: Arc<dyn BusPublisher>) -> Self {
        Self {
            bus,
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Publishes `message` to the device and waits for the matching reply.
    ///
    /// `message` must be a JSON object with a non-empty string `cmd`; any
    /// caller-supplied `req_id` is overwritten. `timeout_ms` defaults to
    /// 6000 and is never below 500.
    pub async fn call(
        &self,
        device_id: &str,
        message: Value,
        timeout_ms: Option<u64>,
    ) -> ReplyResult {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(GatewayError::InvalidRequest("missing deviceId".into()));
        }
        if !self.bus.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let mut body = command_object(message)?;

        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).max(MIN_TIMEOUT_MS);
        let (req_id, reply_rx) = self.register(device_id);
        let _guard = PendingGuard { pending: self.pending.clone(), req_id: req_id.clone() };

        body.insert("req_id".into(), Value::String(req_id.clone()));
        let payload = serde_json::to_vec(&Value::Object(body))
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        self.bus.publish(&command_topic(device_id), payload)?;
        debug!(device = device_id, req_id = %req_id, "rpc sent, waiting {timeout_ms}ms");

        match tokio::time::timeout(Duration::from_millis(timeout_ms), reply_rx).await {
            Ok(Ok(reply)) => reply,
            // sender dropped without answering; treat like no answer
            Ok(Err(_)) => Err(GatewayError::Timeout { timeout_ms }),
            Err(_) => {
                warn!(device = device_id, req_id = %req_id, "rpc timed out after {timeout_ms}ms");
                Err(GatewayError::Timeout { timeout_ms })
            }
        }
    }

    /// Hands an inbound reply to its waiting caller. Returns whether a pending
    /// request matched; unmatched replies are left to the observer.
    pub fn resolve(&self, device_id: &str, payload: &Value) -> bool {
        let Some(req_id) = reply_request_id(payload) else {
            return false;
        };
        let Some(entry) = self.pending.lock().remove(&req_id) else {
            debug!(device = device_id, req_id = %req_id, "reply for unknown request");
            return false;
        };

        let outcome = if entry.device_id != device_id {
            warn!(req_id = %req_id, "reply from {device_id}, expected {}", entry.device_id);
            Err(GatewayError::DeviceMismatch {
                expected: entry.device_id.clone(),
                actual: device_id.to_string(),
            })
        } else {
            check_reply(payload)
        };

        let waited = OffsetDateTime::now_utc() - entry.created_at;
        debug!(req_id = %req_id, "rpc resolved after {}ms", waited.whole_milliseconds());
        // the caller may have given up in between; nothing to do then
        let _ = entry.reply_tx.send(outcome);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, device_id: &str) -> (String, oneshot::Receiver<ReplyResult>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        loop {
            let id = self.next_request_id();
            if let Entry::Vacant(slot) = pending.entry(id.clone()) {
                slot.insert(PendingRequest {
                    device_id: device_id.to_string(),
                    created_at: OffsetDateTime::now_utc(),
                    reply_tx: tx,
                });
                return (id, rx);
            }
        }
    }

    /// `<ms hex>-<seq hex>-<8 random hex>`; the sequence alone keeps ids
    /// unique within the process, the rest keeps them unique across restarts.
    fn next_request_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let rand = uuid::Uuid::new_v4().simple().to_string();
        format!("{ms:x}-{seq:x}-{}", &rand[..8])
    }
}

fn command_object(message: Value) -> Result<Map<String, Value>, GatewayError> {
    let Value::Object(body) = message else {
        return Err(GatewayError::InvalidRequest("missing_cmd".into()));
    };
    match body.get("cmd") {
        Some(Value::String(cmd)) if !cmd.trim().is_empty() => Ok(body),
        _ => Err(GatewayError::InvalidRequest("missing_cmd".into())),
    }
}

/// `req_id` as a string, accepting numeric ids from devices that echo them as numbers.
fn reply_request_id(payload: &Value) -> Option<String> {
    match payload.get("req_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn check_reply(payload: &Value) -> ReplyResult {
    if payload.get("ok").is_some_and(is_truthy) {
        return Ok(payload.clone());
    }
    let reason = match payload.get("error") {
        Some(Value::String(e)) if !e.is_empty() => e.clone(),
        _ => "device_error".to_string(),
    };
    Err(GatewayError::DeviceError(reason))
}

pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct RecordingBus {
        down: AtomicBool,
        refuse: AtomicBool,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl BusPublisher for RecordingBus {
        fn is_connected(&self) -> bool {
            !self.down.load(Ordering::Relaxed)
        }

        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
            if self.refuse.load(Ordering::Relaxed) {
                return Err(GatewayError::Publish("queue full".into()));
            }
            let body: Value = serde_json::from_slice(&payload).unwrap();
            self.sent.lock().push((topic.to_string(), body));
            Ok(())
        }
    }

    impl RecordingBus {
        fn last(&self) -> (String, Value) {
            self.sent.lock().last().cloned().unwrap()
        }
    }

    fn setup() -> (Arc<RecordingBus>, Arc<Correlator>) {
        let bus = Arc::new(RecordingBus::default());
        let correlator = Arc::new(Correlator::new(bus.clone()));
        (bus, correlator)
    }

    async fn wait_sent(bus: &RecordingBus, n: usize) {
        while bus.sent.lock().len() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn matching_reply_resolves_call() {
        let (bus, correlator) = setup();
        let c = correlator.clone();
        let call =
            tokio::spawn(async move { c.call("fish1", json!({"cmd": "gate_open"}), None).await });

        wait_sent(&bus, 1).await;
        let (topic, body) = bus.last();
        assert_eq!(topic, "fish1/device/command");
        assert_eq!(body["cmd"], "gate_open");
        let req_id = body["req_id"].as_str().unwrap().to_string();
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.resolve("fish1", &json!({"ok": true, "req_id": req_id, "pos": 3})));
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply["pos"], 3);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reply_times_out_and_cleans_up() {
        let (_bus, correlator) = setup();
        let err = correlator
            .call("fish1", json!({"cmd": "gate_stop"}), Some(1000))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout { timeout_ms: 1000 });
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_floored() {
        let (_bus, correlator) = setup();
        let err = correlator
            .call("fish1", json!({"cmd": "gate_stop"}), Some(10))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout { timeout_ms: MIN_TIMEOUT_MS });
    }

    #[tokio::test]
    async fn reply_from_other_device_is_a_mismatch() {
        let (bus, correlator) = setup();
        let c = correlator.clone();
        let call =
            tokio::spawn(async move { c.call("fish1", json!({"cmd": "auto_on"}), None).await });

        wait_sent(&bus, 1).await;
        let req_id = bus.last().1["req_id"].clone();
        assert!(correlator.resolve("fish2", &json!({"ok": true, "req_id": req_id})));
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            GatewayError::DeviceMismatch { expected: "fish1".into(), actual: "fish2".into() }
        );
    }

    #[tokio::test]
    async fn falsy_ok_is_a_device_error() {
        let (bus, correlator) = setup();
        for (reply, expected) in [
            (json!({"ok": false, "error": "gate_jammed"}), "gate_jammed"),
            (json!({"ok": 0}), "device_error"),
            (json!({"error": ""}), "device_error"),
        ] {
            let c = correlator.clone();
            let call = tokio::spawn(async move {
                c.call("fish1", json!({"cmd": "gate_close"}), None).await
            });
            let n = bus.sent.lock().len() + 1;
            wait_sent(&bus, n).await;

            let mut reply = reply;
            reply["req_id"] = bus.last().1["req_id"].clone();
            assert!(correlator.resolve("fish1", &reply));
            assert_eq!(
                call.await.unwrap().unwrap_err(),
                GatewayError::DeviceError(expected.into())
            );
        }
    }

    #[tokio::test]
    async fn unknown_or_missing_req_id_does_not_resolve() {
        let (bus, correlator) = setup();
        let c = correlator.clone();
        let call = tokio::spawn(async move {
            c.call("fish1", json!({"cmd": "auto_off"}), Some(5000)).await
        });
        wait_sent(&bus, 1).await;

        assert!(!correlator.resolve("fish1", &json!({"ok": true})));
        assert!(!correlator.resolve("fish1", &json!({"ok": true, "req_id": "nope"})));
        assert!(!correlator.resolve("fish1", &json!({"ok": true, "req_id": 42})));
        assert_eq!(correlator.pending_count(), 1);
        call.abort();
    }

    #[tokio::test]
    async fn validation_and_connectivity_fail_fast() {
        let (bus, correlator) = setup();
        assert_eq!(
            correlator.call("  ", json!({"cmd": "x"}), None).await,
            Err(GatewayError::InvalidRequest("missing deviceId".into()))
        );
        for bad in [json!({}), json!({"cmd": ""}), json!({"cmd": 5}), json!("gate_open")] {
            assert_eq!(
                correlator.call("fish1", bad, None).await,
                Err(GatewayError::InvalidRequest("missing_cmd".into()))
            );
        }

        bus.down.store(true, Ordering::Relaxed);
        assert_eq!(
            correlator.call("fish1", json!({"cmd": "x"}), None).await,
            Err(GatewayError::NotConnected)
        );
        assert!(bus.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_removes_pending_entry() {
        let (bus, correlator) = setup();
        bus.refuse.store(true, Ordering::Relaxed);
        let err = correlator.call("fish1", json!({"cmd": "x"}), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Publish(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_call_removes_pending_entry() {
        let (bus, correlator) = setup();
        let c = correlator.clone();
        let call =
            tokio::spawn(async move { c.call("fish1", json!({"cmd": "x"}), Some(60_000)).await });
        wait_sent(&bus, 1).await;
        assert_eq!(correlator.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn caller_req_id_is_overwritten() {
        let (bus, correlator) = setup();
        let c = correlator.clone();
        let call = tokio::spawn(async move {
            c.call("fish1", json!({"cmd": "x", "req_id": "mine"}), None).await
        });
        wait_sent(&bus, 1).await;
        assert_ne!(bus.last().1["req_id"], "mine");
        call.abort();
    }

    #[tokio::test]
    async fn concurrent_calls_get_distinct_ids() {
        let (bus, correlator) = setup();
        let mut calls = Vec::new();
        for _ in 0..50 {
            let c = correlator.clone();
            calls.push(tokio::spawn(async move {
                c.call("fish1", json!({"cmd": "x"}), Some(60_000)).await
            }));
        }
        wait_sent(&bus, 50).await;

        let ids: HashSet<String> = bus
            .sent
            .lock()
            .iter()
            .map(|(_, b)| b["req_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(correlator.pending_count(), 50);

        for id in &ids {
            assert!(correlator.resolve("fish1", &json!({"ok": true, "req_id": id})));
        }
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
    }

    #[test]
    fn truthiness_follows_json_loose_rules() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
    }
}
