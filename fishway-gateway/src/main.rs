/**
 * FISHWAY GATEWAY - Process entry point
 *
 * Wires config, the MQTT bus loop, telemetry store, device registry and the
 * HTTP API, then serves until ctrl-c. The device registry is flushed on the
 * way out.
 */

use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fishway_gateway::bus::BusConnection;
use fishway_gateway::config::load_config;
use fishway_gateway::devices::DeviceRegistry;
use fishway_gateway::gateway::Gateway;
use fishway_gateway::health::HealthTracker;
use fishway_gateway::history::Downsampler;
use fishway_gateway::http::{build_router, AppState};
use fishway_gateway::store::{
    spawn_retention_job, MemoryTelemetryStore, StorePersistence, TelemetryStore,
};
use fishway_gateway::telemetry::LiveFeed;

const RETENTION_EVERY: Duration = Duration::from_secs(30 * 60);
const REGISTRY_SAVE_EVERY: Duration = Duration::from_secs(60);
const LIVE_FEED_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cfg = Arc::new(load_config().await);

    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .with_context(|| format!("cannot create data dir {}", cfg.data_dir))?;

    let store: Arc<dyn TelemetryStore> = Arc::new(MemoryTelemetryStore::new());
    let devices = Arc::new(DeviceRegistry::new(Path::new(&cfg.data_dir).join("devices.json")));
    if let Err(e) = devices.load().await {
        warn!("device registry not loaded: {e:#}");
    }

    let live = LiveFeed::new(LIVE_FEED_CAPACITY);
    let persistence = Arc::new(StorePersistence::new(store.clone(), devices.clone()));

    let (bus, bus_loop) = BusConnection::new(&cfg.mqtt).context("invalid mqtt configuration")?;
    let gateway = Arc::new(Gateway::new(Arc::new(bus), persistence, Arc::new(live.clone()), &cfg));
    bus_loop.spawn(gateway.clone());

    spawn_retention_job(store.clone(), cfg.retention_days, RETENTION_EVERY);
    DeviceRegistry::start_autosave(devices.clone(), REGISTRY_SAVE_EVERY);

    let api_key: Option<Arc<str>> = std::env::var("FISHWAY_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .map(Arc::from);
    if api_key.is_none() {
        warn!("FISHWAY_API_KEY not set: every /api route will answer 401");
    }

    let app = build_router(AppState {
        gateway,
        store: store.clone(),
        devices: devices.clone(),
        history: Arc::new(Downsampler::new(store, &cfg.history)),
        health: HealthTracker::new(),
        live,
        cfg: cfg.clone(),
        api_key,
    });

    let addr: SocketAddr = format!("{}:{}", cfg.http.bind, cfg.http.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cfg.http.bind, cfg.http.port))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("cannot bind {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {e}");
            }
            info!("shutting down");
        })
        .await
        .context("http server failed")?;

    devices.save().await.context("saving device registry")?;
    Ok(())
}
