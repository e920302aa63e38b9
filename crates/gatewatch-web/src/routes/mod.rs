//! HTTP routes, all JSON under the `/api` prefix.

pub mod health;
pub mod logs;
pub mod setup;
pub mod stats;
pub mod threat;
pub mod unifi;

use axum::routing::{get, patch, post};
use axum::Router;

use crate::state::AppState;

/// Build the complete application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // Logs
        .route("/logs", get(logs::list_logs))
        .route("/logs/:id", get(logs::get_log))
        .route("/export", get(logs::export_csv))
        .route("/services", get(logs::list_services))
        .route("/stats", get(stats::get_stats))
        .route("/health", get(health::health))
        // Configuration
        .route("/config", get(setup::get_config))
        .route("/config/export", get(setup::export_config))
        .route("/config/import", post(setup::import_config))
        .route(
            "/config/retention",
            get(setup::get_retention).post(setup::update_retention),
        )
        .route("/config/retention/cleanup", post(setup::run_retention_cleanup))
        .route("/config/vpn-networks", post(setup::update_vpn_networks))
        // Setup wizard
        .route("/setup/status", get(setup::setup_status))
        .route("/setup/wan-candidates", get(setup::wan_candidates))
        .route("/setup/network-segments", get(setup::network_segments))
        .route("/setup/unifi-network-config", get(unifi::network_config))
        .route("/setup/complete", post(setup::complete_setup))
        .route("/interfaces", get(setup::list_interfaces))
        // Threat client
        .route("/abuseipdb/status", get(threat::threat_status))
        .route("/enrich/:ip", post(threat::enrich_ip))
        // Controller settings + proxy
        .route(
            "/settings/unifi",
            get(unifi::get_settings).put(unifi::update_settings),
        )
        .route("/settings/unifi/test", post(unifi::test_connection))
        .route("/settings/unifi/dismiss-upgrade", post(unifi::dismiss_upgrade))
        .route("/settings/unifi/dismiss-vpn-toast", post(unifi::dismiss_vpn_toast))
        .route("/firewall/policies", get(unifi::firewall_policies))
        .route("/firewall/policies/:id", patch(unifi::patch_firewall_policy))
        .route("/firewall/policies/bulk-logging", post(unifi::bulk_logging))
        .route("/unifi/clients", get(unifi::list_clients))
        .route("/unifi/devices", get(unifi::list_devices))
        .route("/unifi/status", get(unifi::poll_status))
        .route("/unifi/backfill-device-names", post(unifi::backfill_device_names))
}
