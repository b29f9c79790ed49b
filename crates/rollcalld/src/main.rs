use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod feed;
mod store;

use config::Config;
use dbus_interface::AttendanceService;
use store::SqliteStore;

/// Frames buffered between the feed reader and the engine.
const FEED_BUFFER: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env();
    config
        .attendance
        .validate()
        .context("invalid attendance configuration")?;

    let store = SqliteStore::open(&config.db_path, config.store_timeout)
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
    tracing::info!(
        db = %config.db_path.display(),
        faces = store.count_faces()?,
        "store opened"
    );

    let (obs_tx, obs_rx) = std::sync::mpsc::sync_channel(FEED_BUFFER);
    feed::spawn_reader(&config.feed, obs_tx)?;
    let engine = engine::spawn_engine(&config, store, obs_rx)?;

    let service = AttendanceService {
        engine,
        session_bus: config.session_bus,
    };

    let builder = if config.session_bus {
        tracing::warn!("using session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(feed = %config.feed, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
