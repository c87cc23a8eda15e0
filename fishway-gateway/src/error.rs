use thiserror::Error;

/// Errors surfaced by the gateway's public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Publish attempted while the bus is down. Never retried.
    #[error("mqtt_not_connected")]
    NotConnected,
    /// No matching reply within the deadline.
    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// A reply carried our request id but came from another device topic.
    #[error("bad_device: expected {expected}, reply came from {actual}")]
    DeviceMismatch { expected: String, actual: String },
    /// The device answered with `ok` falsy.
    #[error("{0}")]
    DeviceError(String),
    /// Non-JSON (or non UTF-8) telemetry/reply body.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("{0}")]
    InvalidRequest(String),
    /// The transport refused the outgoing packet.
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    /// Short machine label, used by the HTTP layer in `{"error": ...}` bodies.
    pub fn label(&self) -> &str {
        match self {
            GatewayError::NotConnected => "mqtt_not_connected",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::DeviceMismatch { .. } => "bad_device",
            GatewayError::DeviceError(e) => e.as_str(),
            GatewayError::MalformedPayload(_) => "bad_json",
            GatewayError::InvalidRequest(e) => e.as_str(),
            GatewayError::Publish(_) => "mqtt_publish_failed",
            GatewayError::Store(_) => "store_failed",
        }
    }
}
