//! Application state

use std::sync::Arc;

use gatewatch_enrich::ThreatClient;
use gatewatch_store::Store;
use gatewatch_unifi::UnifiClient;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub threat: Arc<ThreatClient>,
    pub unifi: Arc<UnifiClient>,
    pub version: String,
}

impl AppState {
    pub async fn new(store: Store) -> Self {
        let threat = Arc::new(ThreatClient::new(store.clone()));
        let unifi = Arc::new(UnifiClient::new(store.clone()).await);
        Self {
            store,
            threat,
            unifi,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Nudge the receiver process to reload config from the store.
pub fn signal_receiver() {
    let result = std::process::Command::new("pkill")
        .args(["-SIGUSR2", "-f", "gatewatch-receiver"])
        .status();
    match result {
        Ok(_) => {
            let stamp = chrono::Utc::now().timestamp().to_string();
            if let Err(e) = std::fs::write("/tmp/config_update_requested", stamp) {
                tracing::debug!("Failed to write config-update marker: {e}");
            }
            tracing::info!("Signaled receiver process to reload config");
        }
        Err(e) => tracing::warn!("Failed to signal receiver: {e}"),
    }
}
