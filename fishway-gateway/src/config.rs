use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
    #[error("unsupported broker scheme: {0}")]
    UnsupportedScheme(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    /// Used when a topic or a request does not name a device.
    pub default_device_id: String,
    /// Where the device registry keeps `devices.json`.
    pub data_dir: String,
    pub retention_days: u32,
    pub rpc_timeout_ms: u64,
    pub history: HistoryConf,
    pub log_cache: LogCacheConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Empty means "generate one at startup".
    pub client_id: String,
    pub telemetry_sub: String,
    pub reply_sub: String,
    pub log_sub: String,
    pub reconnect_secs: u64,
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HistoryConf {
    pub max_points: usize,
    /// Payload object holding the inner sensor reading (`{"mm": .., "valid": ..}`).
    pub inner_field: String,
    pub outer_field: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogCacheConf {
    pub max_bytes: usize,
    pub max_chunk_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http: HttpConf::default(),
            default_device_id: "fish1".into(),
            data_dir: "./data".into(),
            retention_days: 30,
            rpc_timeout_ms: 6000,
            history: HistoryConf::default(),
            log_cache: LogCacheConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            url: "mqtt://127.0.0.1:1883".into(),
            username: None,
            password: None,
            client_id: String::new(),
            telemetry_sub: "+/device/telemetry".into(),
            reply_sub: "+/device/reply".into(),
            log_sub: "+/device/log/+".into(),
            reconnect_secs: 2,
            connect_timeout_secs: 10,
            keep_alive_secs: 30,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0".into(), port: 8080 }
    }
}

impl Default for HistoryConf {
    fn default() -> Self {
        Self { max_points: 1200, inner_field: "sensor1".into(), outer_field: "sensor2".into() }
    }
}

impl Default for LogCacheConf {
    fn default() -> Self {
        Self { max_bytes: 256 * 1024, max_chunk_bytes: 2048 }
    }
}

impl MqttConf {
    /// Telemetry, reply and log filters, empty ones dropped, duplicates removed
    /// (first occurrence wins).
    pub fn subscriptions(&self) -> Vec<String> {
        let mut subs: Vec<String> = Vec::new();
        for topic in [&self.telemetry_sub, &self.reply_sub, &self.log_sub] {
            let topic = topic.trim();
            if !topic.is_empty() && !subs.iter().any(|s| s == topic) {
                subs.push(topic.to_string());
            }
        }
        subs
    }

    pub fn broker_addr(&self) -> Result<(String, u16), ConfigError> {
        parse_broker_url(&self.url)
    }
}

/// Accepts `mqtt://host[:port]`, `tcp://host[:port]` or a bare `host[:port]`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ConfigError> {
    let url = url.trim();
    let rest = match url.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => return Err(ConfigError::UnsupportedScheme(scheme.to_string())),
        None => url,
    };
    let authority = rest.split('/').next().unwrap_or_default();
    // credentials in the url are ignored, they come from MQTT_USERNAME/MQTT_PASSWORD
    let authority = authority.rsplit('@').next().unwrap_or_default();

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
            (host, port)
        }
        None => (authority, 1883),
    };
    if host.is_empty() {
        return Err(ConfigError::InvalidUrl(url.to_string()));
    }
    Ok((host.to_string(), port))
}

impl GatewayConfig {
    /// Applies environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty =
            |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = non_empty("MQTT_URL") {
            self.mqtt.url = url;
        }
        if let Some(user) = non_empty("MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(pw) = lookup("MQTT_PASSWORD").filter(|v| !v.is_empty()) {
            self.mqtt.password = Some(pw);
        }
        if let Some(id) = non_empty("MQTT_CLIENT_ID") {
            self.mqtt.client_id = id;
        }
        if let Some(dev) = non_empty("DEFAULT_DEVICE_ID") {
            self.default_device_id = dev;
        }
        match non_empty("HTTP_PORT").map(|p| p.parse::<u16>()) {
            Some(Ok(port)) => self.http.port = port,
            Some(Err(e)) => warn!("ignoring HTTP_PORT: {e}"),
            None => {}
        }
    }

    /// Clamps every numeric setting into the range the gateway supports.
    pub fn normalized(mut self) -> Self {
        self.retention_days = self.retention_days.clamp(1, 3650);
        self.rpc_timeout_ms = self.rpc_timeout_ms.max(crate::correlator::MIN_TIMEOUT_MS);
        self.history.max_points = self.history.max_points.clamp(100, 5000);
        self.log_cache.max_bytes = self.log_cache.max_bytes.clamp(16 * 1024, 2 * 1024 * 1024);
        self.log_cache.max_chunk_bytes = self.log_cache.max_chunk_bytes.clamp(128, 16 * 1024);
        self.mqtt.reconnect_secs = self.mqtt.reconnect_secs.clamp(1, 300);
        self.mqtt.connect_timeout_secs = self.mqtt.connect_timeout_secs.clamp(1, 120);
        self.mqtt.keep_alive_secs = self.mqtt.keep_alive_secs.clamp(5, 3600);
        if self.default_device_id.trim().is_empty() {
            self.default_device_id = GatewayConfig::default().default_device_id;
        }
        self
    }
}

pub async fn load_config() -> GatewayConfig {
    let path = std::env::var("FISHWAY_CONFIG").unwrap_or_else(|_| "gateway.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            GatewayConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                warn!("invalid config {path}: {e}, using defaults");
                GatewayConfig::default()
            })
        }
    } else {
        info!("no {path}, using default config");
        GatewayConfig::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg.normalized()
}
