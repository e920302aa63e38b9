//! Gatewatch API binary
//!
//! Serves the HTTP API backed by the same PostgreSQL store the receiver
//! writes to. Config changes made here reach the receiver process via
//! SIGUSR2.

use std::net::SocketAddr;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatewatch_store::{Store, StoreConfig};
use gatewatch_web::AppState;

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gatewatch={level},tower_http=warn,{level}").into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting Gatewatch API v{}", env!("CARGO_PKG_VERSION"));

    let store_config = StoreConfig::default();
    Store::wait_ready(&store_config, 30).await?;
    let store = Store::connect(&store_config).await?;

    // The receiver usually runs this first; the advisory lock makes it
    // safe for whichever process wins the race.
    if let Err(e) = store.run_timezone_backfill().await {
        error!("Timezone backfill failed: {e}");
    }

    let state = AppState::new(store).await;

    let port = std::env::var("API_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8000u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    gatewatch_web::serve(addr, state).await
}
