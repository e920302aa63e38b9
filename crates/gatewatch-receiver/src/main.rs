//! Gatewatch receiver binary
//!
//! Boots the ingestion process: store, enricher, controller client,
//! scheduler, backfill worker, and the UDP receive loop. Signals:
//! SIGTERM/SIGINT stop gracefully, SIGUSR1 reloads the GeoIP databases,
//! SIGUSR2 reloads config from the store.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatewatch_enrich::{BlacklistFetcher, Enricher};
use gatewatch_receiver::backfill::BackfillTask;
use gatewatch_receiver::receiver::SyslogReceiver;
use gatewatch_receiver::scheduler::Scheduler;
use gatewatch_receiver::{load_parser_context, SharedContext};
use gatewatch_store::{Store, StoreConfig};
use gatewatch_unifi::UnifiClient;

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gatewatch={level},{level}").into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Seed config for pre-wizard installations that already have data.
async fn migrate_existing_install(store: &Store) -> Result<()> {
    if store.get_config_value("setup_complete").await?.is_some() {
        return Ok(());
    }
    let firewall_logs = store.count_logs(Some("firewall")).await?;
    if firewall_logs == 0 {
        return Ok(());
    }

    info!("Migrating existing installation to dynamic config...");
    store.set_config("wan_interfaces", &vec!["ppp0".to_string()]).await?;
    store
        .set_config("interface_labels", &std::collections::HashMap::<String, String>::new())
        .await?;
    store.set_config("setup_complete", &true).await?;
    store.set_config("config_version", &1).await?;
    info!(
        "Migration complete with safe defaults (WAN=ppp0, labels=raw names). \
         Settings can be customised via the wizard."
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting Gatewatch receiver v{}", env!("CARGO_PKG_VERSION"));

    let store_config = StoreConfig::default();
    Store::wait_ready(&store_config, 30).await?;
    let store = Store::connect(&store_config).await?;

    // One-shot repairs, advisory-locked against the API process
    if let Err(e) = store.run_timezone_backfill().await {
        error!("Timezone backfill failed: {e}");
    }
    if let Err(e) = store.fix_function_ownership(&store_config.user).await {
        error!("Function ownership fix failed: {e}");
    }

    migrate_existing_install(&store).await?;

    // Detect and persist WAN/gateway addresses from existing data
    if let Err(e) = store.detect_wan_ip().await {
        error!("Startup WAN IP detection failed: {e}");
    }
    if let Err(e) = store.detect_gateway_ips().await {
        error!("Startup gateway IP detection failed: {e}");
    }

    let context: SharedContext = Arc::new(RwLock::new(load_parser_context(&store).await?));

    let geoip_dir = std::env::var("GEOIP_DB_DIR")
        .unwrap_or_else(|_| gatewatch_enrich::geoip::DEFAULT_DB_DIR.to_string());
    let enricher = Arc::new(Enricher::new(store.clone(), &geoip_dir));
    if let Err(e) = enricher.refresh_exclusions().await {
        warn!("Initial exclusion refresh failed: {e}");
    }

    let unifi = Arc::new(UnifiClient::new(store.clone()).await);
    unifi.clone().start_polling().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        store.clone(),
        enricher.clone(),
        Arc::new(BlacklistFetcher::new(store.clone())),
    );
    let scheduler_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    let backfill = BackfillTask::new(store.clone(), enricher.clone(), context.clone());
    let backfill_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { backfill.run(backfill_shutdown).await });

    // Signal wiring
    {
        let shutdown_tx = shutdown_tx.clone();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            }
            let _ = shutdown_tx.send(true);
        });
    }
    {
        let enricher = enricher.clone();
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        tokio::spawn(async move {
            while sigusr1.recv().await.is_some() {
                info!("Received SIGUSR1, reloading GeoIP databases...");
                enricher.reload_geoip();
            }
        });
    }
    {
        let store = store.clone();
        let context = context.clone();
        let enricher = enricher.clone();
        let unifi = unifi.clone();
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        tokio::spawn(async move {
            while sigusr2.recv().await.is_some() {
                info!("Received SIGUSR2, reloading config from the store...");
                match load_parser_context(&store).await {
                    Ok(fresh) => {
                        *context.write().unwrap_or_else(|e| e.into_inner()) = fresh;
                    }
                    Err(e) => error!("Config reload failed: {e}"),
                }
                if let Err(e) = enricher.refresh_exclusions().await {
                    error!("Exclusion refresh failed: {e}");
                }
                unifi.clone().reload_config().await;

                // Confirm completion for the API process
                let stamp = chrono::Utc::now().timestamp().to_string();
                if let Err(e) = std::fs::write("/tmp/config_reloaded", stamp) {
                    warn!("Failed to write reload marker: {e}");
                }
                info!("Config reloaded");
            }
        });
    }

    // Receive loop blocks until shutdown
    let receiver = SyslogReceiver::new(store.clone(), enricher.clone(), context.clone());
    receiver.run(shutdown_rx).await?;

    unifi.stop_polling();
    store.close().await;
    Ok(())
}
