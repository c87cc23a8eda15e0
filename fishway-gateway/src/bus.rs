/**
 * BUS CONNECTION - Single MQTT connection with perpetual reconnection
 *
 * ROLE:
 * Owns the rumqttc client/event loop pair. The event loop runs in one task,
 * hands every inbound publish to an `InboundHandler` in arrival order, and
 * re-subscribes after every (re)connect since sessions are clean.
 *
 * STATES: disconnected -> connecting -> connected, and back to disconnected
 * on any error. There is no terminal state; the loop sleeps
 * `reconnect_secs` and polls again forever.
 *
 * Publishing is QoS 0, never retained, never blocks: `try_publish` either
 * enqueues or fails. While disconnected it fails fast with `NotConnected`.
 */

use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, MqttConf};
use crate::error::GatewayError;

const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Outbound side of the bus, as seen by the correlator and the gateway.
pub trait BusPublisher: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Non-blocking QoS 0 publish.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError>;

    fn status(&self) -> ConnectionSnapshot {
        let connected = self.is_connected();
        ConnectionSnapshot {
            connected,
            phase: if connected {
                ConnectionPhase::Connected
            } else {
                ConnectionPhase::Disconnected
            },
            ..ConnectionSnapshot::default()
        }
    }
}

/// Inbound side: what the event loop calls back into.
pub trait InboundHandler: Send + Sync {
    fn on_connect(&self) {}

    fn on_message(&self, topic: &str, payload: &[u8], received_at: OffsetDateTime);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub phase: ConnectionPhase,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_connect_at: Option<OffsetDateTime>,
    pub reconnects: u64,
}

/// Shared connection bookkeeping, written by the event loop task.
#[derive(Default)]
pub struct ConnectionState {
    inner: RwLock<ConnectionSnapshot>,
}

impl ConnectionState {
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().connected
    }

    pub fn mark_connecting(&self) {
        let mut s = self.inner.write();
        s.connected = false;
        s.phase = ConnectionPhase::Connecting;
    }

    pub fn mark_connected(&self) {
        let mut s = self.inner.write();
        s.connected = true;
        s.phase = ConnectionPhase::Connected;
        s.last_error = None;
        s.last_connect_at = Some(OffsetDateTime::now_utc());
    }

    /// Drops to `Disconnected`. A transition out of `Connected` counts as a
    /// reconnect cycle.
    pub fn mark_disconnected(&self, reason: Option<String>) {
        let mut s = self.inner.write();
        if s.phase == ConnectionPhase::Connected {
            s.reconnects += 1;
        }
        s.connected = false;
        s.phase = ConnectionPhase::Disconnected;
        if reason.is_some() {
            s.last_error = reason;
        }
    }

    pub fn set_error(&self, reason: String) {
        self.inner.write().last_error = Some(reason);
    }
}

#[derive(Clone)]
pub struct BusConnection {
    client: AsyncClient,
    state: Arc<ConnectionState>,
    client_id: String,
}

pub struct BusEventLoop {
    eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<ConnectionState>,
    subscriptions: Vec<String>,
    reconnect_interval: Duration,
}

impl BusConnection {
    /// Builds the client and its (not yet polled) event loop. Nothing touches
    /// the network until `BusEventLoop::spawn`.
    pub fn new(conf: &MqttConf) -> Result<(Self, BusEventLoop), ConfigError> {
        let (host, port) = conf.broker_addr()?;
        let client_id = if conf.client_id.trim().is_empty() {
            generated_client_id()
        } else {
            conf.client_id.trim().to_string()
        };

        let mut opts = MqttOptions::new(client_id.clone(), host.clone(), port);
        opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
        opts.set_clean_session(true);
        if let Some(user) = conf.username.as_deref().filter(|u| !u.is_empty()) {
            opts.set_credentials(user, conf.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_QUEUE_CAPACITY);
        let mut net = NetworkOptions::new();
        net.set_connection_timeout(conf.connect_timeout_secs);
        eventloop.set_network_options(net);

        info!("mqtt broker {host}:{port} as {client_id}");

        let state = Arc::new(ConnectionState::default());
        let bus = BusConnection { client: client.clone(), state: state.clone(), client_id };
        let event_loop = BusEventLoop {
            eventloop,
            client,
            state,
            subscriptions: conf.subscriptions(),
            reconnect_interval: Duration::from_secs(conf.reconnect_secs),
        };
        Ok((bus, event_loop))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> Arc<ConnectionState> {
        self.state.clone()
    }
}

impl BusPublisher for BusConnection {
    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| GatewayError::Publish(e.to_string()))
    }

    fn status(&self) -> ConnectionSnapshot {
        self.state.snapshot()
    }
}

impl BusEventLoop {
    pub fn spawn(self, handler: Arc<dyn InboundHandler>) -> JoinHandle<()> {
        tokio::spawn(self.run(handler))
    }

    pub async fn run(mut self, handler: Arc<dyn InboundHandler>) {
        self.state.mark_connecting();
        loop {
            match self.eventloop.poll().await {
                // refused CONNACKs come back from poll as ConnectionRefused errors
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.state.mark_connected();
                    info!("mqtt connected");
                    handler.on_connect();
                    self.subscribe_all();
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    handler.on_message(&p.topic, &p.payload, OffsetDateTime::now_utc());
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let refused =
                        ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure));
                    if refused {
                        error!("mqtt subscription refused (pkid {})", ack.pkid);
                        self.state.set_error("subscribe_refused".into());
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt broker sent disconnect");
                    self.state.mark_disconnected(Some("broker_disconnect".into()));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.state.mark_disconnected(None);
                }
                Ok(_) => {}
                Err(e) => {
                    let reason = e.to_string();
                    let retry_in = self.reconnect_interval.as_secs();
                    warn!("mqtt error: {reason}, retrying in {retry_in}s");
                    self.state.mark_disconnected(Some(reason));
                    tokio::time::sleep(self.reconnect_interval).await;
                    self.state.mark_connecting();
                }
            }
        }
    }

    fn subscribe_all(&self) {
        for topic in &self.subscriptions {
            match self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                Ok(()) => debug!("subscribed {topic}"),
                Err(e) => {
                    error!("subscribe {topic} failed: {e}");
                    self.state.set_error(format!("subscribe_failed: {topic}"));
                }
            }
        }
    }
}

fn generated_client_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("fishway-gw-{}", &suffix[..8])
}
