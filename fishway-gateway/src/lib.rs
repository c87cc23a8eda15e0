//! Fishway gateway: bridges fishway controllers on an MQTT bus to the panel.
//!
//! Inbound device traffic is classified by topic and dispatched (telemetry
//! fan-out, reply correlation, log caching); outbound commands go through
//! the correlator or as fire-and-forget publishes.

pub mod bus;
pub mod config;
pub mod correlator;
pub mod devices;
pub mod error;
pub mod gateway;
pub mod health;
pub mod history;
pub mod http;
pub mod log_cache;
pub mod models;
pub mod store;
pub mod telemetry;
pub mod topics;

pub use error::GatewayError;
pub use gateway::{Gateway, GatewayHooks};
