//! Controller settings, connection test, firewall proxy, and device
//! endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use gatewatch_unifi::ControllerType;

use crate::error::{ApiError, ApiResult};
use crate::state::{signal_receiver, AppState};

/// GET /api/settings/unifi
pub async fn get_settings(State(state): State<AppState>) -> Json<gatewatch_unifi::UnifiSettings> {
    Json(state.unifi.settings_info().await)
}

#[derive(Debug, Deserialize)]
pub struct SettingsBody {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub controller_type: Option<String>,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub site: Option<String>,
    pub verify_ssl: Option<bool>,
    pub poll_interval: Option<u64>,
    pub features: Option<Value>,
}

/// PUT /api/settings/unifi
pub async fn update_settings(
    State(state): State<AppState>,
    Json(body): Json<SettingsBody>,
) -> ApiResult<Json<Value>> {
    let store = &state.store;

    if let Some(enabled) = body.enabled {
        store.set_config("unifi_enabled", &enabled).await?;
    }
    if let Some(host) = &body.host {
        store.set_config("unifi_host", host).await?;
    }
    if let Some(controller_type) = &body.controller_type {
        store.set_config("unifi_controller_type", controller_type).await?;
    }
    if let Some(api_key) = &body.api_key {
        store.set_encrypted_config("unifi_api_key", api_key).await?;
    }
    if let Some(username) = &body.username {
        store.set_encrypted_config("unifi_username", username).await?;
    }
    if let Some(password) = &body.password {
        store.set_encrypted_config("unifi_password", password).await?;
    }
    if let Some(site) = &body.site {
        store.set_config("unifi_site", site).await?;
        // A changed site must be re-resolved on the next legacy request
        store.set_config("unifi_site_id", &Value::Null).await?;
    }
    if let Some(verify_ssl) = body.verify_ssl {
        store.set_config("unifi_verify_ssl", &verify_ssl).await?;
    }
    if let Some(poll_interval) = body.poll_interval {
        store.set_config("unifi_poll_interval", &poll_interval).await?;
    }
    if let Some(features) = &body.features {
        store.set_config("unifi_features", features).await?;
    }

    state.unifi.clone().reload_config().await;
    signal_receiver();
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct TestBody {
    #[serde(default)]
    pub host: String,
    pub site: Option<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    pub controller_type: Option<String>,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub use_env_key: bool,
    #[serde(default)]
    pub use_saved_key: bool,
    #[serde(default)]
    pub use_saved_credentials: bool,
}

fn default_true() -> bool {
    true
}

/// POST /api/settings/unifi/test — probe the controller and persist the
/// settings only when the probe succeeds.
pub async fn test_connection(
    State(state): State<AppState>,
    Json(body): Json<TestBody>,
) -> ApiResult<Json<gatewatch_unifi::TestOutcome>> {
    let host = body.host.trim().to_string();
    let site = body.site.clone().unwrap_or_else(|| "default".to_string());
    let site = site.trim().to_string();
    let controller_type =
        ControllerType::from_config(body.controller_type.as_deref().unwrap_or("unifi_os"));
    let store = &state.store;

    let outcome = match controller_type {
        ControllerType::SelfHosted => {
            let (username, password) = if body.use_saved_credentials {
                let username = store.get_encrypted_config("unifi_username").await;
                let password = store.get_encrypted_config("unifi_password").await;
                if username.is_empty() || password.is_empty() {
                    return Err(ApiError::bad_request(
                        "No saved credentials found. Please enter username and password.",
                    ));
                }
                (username, password)
            } else {
                (
                    body.username.clone().unwrap_or_default().trim().to_string(),
                    body.password.clone().unwrap_or_default(),
                )
            };

            if host.is_empty() || username.is_empty() || password.is_empty() {
                return Err(ApiError::bad_request("host, username, and password are required"));
            }

            let outcome = state
                .unifi
                .test_connection(
                    &host,
                    &site,
                    body.verify_ssl,
                    ControllerType::SelfHosted,
                    None,
                    Some(&username),
                    Some(&password),
                )
                .await;

            if outcome.success {
                store.set_config("unifi_host", &host).await?;
                store.set_config("unifi_controller_type", &"self_hosted").await?;
                if !body.use_saved_credentials {
                    store.set_encrypted_config("unifi_username", &username).await?;
                    store.set_encrypted_config("unifi_password", &password).await?;
                }
                if let Some(site_id) = &outcome.site_id {
                    store.set_config("unifi_site_id", site_id).await?;
                }
                store.set_config("unifi_site", &site).await?;
                store.set_config("unifi_verify_ssl", &body.verify_ssl).await?;
                store
                    .set_config(
                        "unifi_controller_name",
                        outcome.controller_name.as_deref().unwrap_or(""),
                    )
                    .await?;
                store
                    .set_config(
                        "unifi_controller_version",
                        outcome.version.as_deref().unwrap_or(""),
                    )
                    .await?;
                store.set_config("unifi_enabled", &true).await?;
                state.unifi.clone().reload_config().await;
                signal_receiver();
            }
            outcome
        }
        ControllerType::UnifiOs => {
            let api_key = if body.use_env_key {
                std::env::var("UNIFI_API_KEY").unwrap_or_default()
            } else if body.use_saved_key {
                let key = store.get_encrypted_config("unifi_api_key").await;
                if key.is_empty() {
                    return Err(ApiError::bad_request(
                        "Saved API key could not be decrypted. Please re-enter your API key.",
                    ));
                }
                key
            } else {
                body.api_key.clone().unwrap_or_default().trim().to_string()
            };

            if host.is_empty() || api_key.is_empty() {
                return Err(ApiError::bad_request("host and api_key are required"));
            }

            let outcome = state
                .unifi
                .test_connection(
                    &host,
                    &site,
                    body.verify_ssl,
                    ControllerType::UnifiOs,
                    Some(&api_key),
                    None,
                    None,
                )
                .await;

            if outcome.success {
                store.set_config("unifi_host", &host).await?;
                store.set_config("unifi_controller_type", &"unifi_os").await?;
                if !body.use_env_key && !body.use_saved_key {
                    store.set_encrypted_config("unifi_api_key", &api_key).await?;
                }
                store.set_config("unifi_site", &site).await?;
                store.set_config("unifi_verify_ssl", &body.verify_ssl).await?;
                store
                    .set_config(
                        "unifi_controller_name",
                        outcome.controller_name.as_deref().unwrap_or(""),
                    )
                    .await?;
                store
                    .set_config(
                        "unifi_controller_version",
                        outcome.version.as_deref().unwrap_or(""),
                    )
                    .await?;
                store.set_config("unifi_enabled", &true).await?;
                state.unifi.clone().reload_config().await;
                signal_receiver();
            }
            outcome
        }
    };

    Ok(Json(outcome))
}

/// GET /api/setup/unifi-network-config
pub async fn network_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    if !state.unifi.enabled().await {
        return Err(ApiError::bad_request("Controller integration not configured"));
    }
    let config = state.unifi.network_config().await?;
    Ok(Json(serde_json::to_value(config).map_err(|_| ApiError::internal())?))
}

/// POST /api/settings/unifi/dismiss-upgrade
pub async fn dismiss_upgrade(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.store.set_config("upgrade_v2_dismissed", &true).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/settings/unifi/dismiss-vpn-toast
pub async fn dismiss_vpn_toast(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.store.set_config("vpn_toast_dismissed", &true).await?;
    Ok(Json(json!({ "success": true })))
}

// ── Firewall proxy ────────────────────────────────────────────────────

async fn require_firewall_management(state: &AppState) -> ApiResult<()> {
    if !state.unifi.enabled().await {
        return Err(ApiError::bad_request("Controller integration not configured"));
    }
    if !state.unifi.features().await.firewall_management {
        return Err(ApiError::bad_request(
            "Firewall management requires a UniFi OS gateway (not available on legacy controllers)",
        ));
    }
    Ok(())
}

/// GET /api/firewall/policies
pub async fn firewall_policies(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    require_firewall_management(&state).await?;
    let data = state.unifi.firewall_data().await?;
    Ok(Json(serde_json::to_value(data).map_err(|_| ApiError::internal())?))
}

#[derive(Debug, Deserialize)]
pub struct PatchPolicyBody {
    #[serde(rename = "loggingEnabled")]
    pub logging_enabled: Option<bool>,
    #[serde(default)]
    pub origin: String,
}

/// PATCH /api/firewall/policies/{id}
pub async fn patch_firewall_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
    Json(body): Json<PatchPolicyBody>,
) -> ApiResult<Json<Value>> {
    require_firewall_management(&state).await?;

    // Controller-generated rules are not editable through this surface
    if body.origin == "DERIVED" {
        return Err(ApiError::bad_request(
            "This rule is auto-generated and cannot be modified. Manage it on your controller under Traffic Rules.",
        ));
    }

    let logging_enabled = body
        .logging_enabled
        .ok_or_else(|| ApiError::bad_request("loggingEnabled is required"))?;

    let result = state
        .unifi
        .patch_firewall_policy(&policy_id, logging_enabled)
        .await?;
    Ok(Json(json!({ "success": true, "data": result })))
}

#[derive(Debug, Deserialize)]
pub struct BulkLoggingBody {
    #[serde(default)]
    pub policies: Vec<Value>,
}

/// POST /api/firewall/policies/bulk-logging
pub async fn bulk_logging(
    State(state): State<AppState>,
    Json(body): Json<BulkLoggingBody>,
) -> ApiResult<Json<Value>> {
    require_firewall_management(&state).await?;
    if body.policies.is_empty() {
        return Err(ApiError::bad_request("policies list is required"));
    }
    let summary = state.unifi.bulk_patch_logging(&body.policies).await;
    Ok(Json(serde_json::to_value(summary).map_err(|_| ApiError::internal())?))
}

// ── Device views ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClientsParams {
    pub search: Option<String>,
    #[serde(default = "default_client_limit")]
    pub limit: i64,
}

fn default_client_limit() -> i64 {
    200
}

#[allow(clippy::type_complexity)]
type ClientRow = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i32>,
    Option<bool>,
    Option<bool>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

/// GET /api/unifi/clients
pub async fn list_clients(
    State(state): State<AppState>,
    Query(params): Query<ClientsParams>,
) -> ApiResult<Json<Value>> {
    let limit = params.limit.clamp(1, 1000);

    let rows: Vec<ClientRow> = match &params.search {
        Some(search) if !search.is_empty() => {
            let pattern = format!("%{search}%");
            sqlx::query_as(
                "SELECT mac, host(ip), device_name, hostname, oui,
                        network, essid, vlan, is_fixed_ip, is_wired,
                        last_seen, updated_at
                 FROM unifi_clients
                 WHERE device_name ILIKE $1 OR hostname ILIKE $1
                    OR host(ip) LIKE $1 OR mac ILIKE $1
                 ORDER BY last_seen DESC NULLS LAST
                 LIMIT $2",
            )
            .bind(&pattern)
            .bind(limit)
            .fetch_all(state.store.pool())
            .await?
        }
        _ => {
            sqlx::query_as(
                "SELECT mac, host(ip), device_name, hostname, oui,
                        network, essid, vlan, is_fixed_ip, is_wired,
                        last_seen, updated_at
                 FROM unifi_clients
                 ORDER BY last_seen DESC NULLS LAST
                 LIMIT $1",
            )
            .bind(limit)
            .fetch_all(state.store.pool())
            .await?
        }
    };

    let clients: Vec<Value> = rows
        .into_iter()
        .map(
            |(mac, ip, device_name, hostname, oui, network, essid, vlan, is_fixed_ip, is_wired, last_seen, updated_at)| {
                json!({
                    "mac": mac, "ip": ip, "device_name": device_name,
                    "hostname": hostname, "oui": oui, "network": network,
                    "essid": essid, "vlan": vlan,
                    "is_fixed_ip": is_fixed_ip, "is_wired": is_wired,
                    "last_seen": last_seen.map(|t| t.to_rfc3339()),
                    "updated_at": updated_at.to_rfc3339(),
                })
            },
        )
        .collect();

    Ok(Json(json!({ "total": clients.len(), "clients": clients })))
}

#[allow(clippy::type_complexity)]
type DeviceRow = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i32>,
    Option<i64>,
    DateTime<Utc>,
);

/// GET /api/unifi/devices
pub async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let rows: Vec<DeviceRow> = sqlx::query_as(
        "SELECT mac, host(ip), device_name, model, shortname,
                device_type, firmware, serial, state, uptime, updated_at
         FROM unifi_devices
         ORDER BY device_name NULLS LAST, model",
    )
    .fetch_all(state.store.pool())
    .await?;

    let devices: Vec<Value> = rows
        .into_iter()
        .map(
            |(mac, ip, device_name, model, shortname, device_type, firmware, serial, dev_state, uptime, updated_at)| {
                json!({
                    "mac": mac, "ip": ip, "device_name": device_name,
                    "model": model, "shortname": shortname,
                    "device_type": device_type, "firmware": firmware,
                    "serial": serial, "state": dev_state, "uptime": uptime,
                    "updated_at": updated_at.to_rfc3339(),
                })
            },
        )
        .collect();

    Ok(Json(json!({ "total": devices.len(), "devices": devices })))
}

/// GET /api/unifi/status
pub async fn poll_status(State(state): State<AppState>) -> Json<Value> {
    let settings = state.unifi.settings_info().await;
    Json(json!({
        "enabled": settings.enabled,
        "status": settings.status,
        "features": settings.features,
        "poll_interval": settings.poll_interval,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BackfillNamesBody {
    pub since: Option<String>,
}

/// POST /api/unifi/backfill-device-names
///
/// Patch historical rows with device names: MAC-based join for the source
/// (stable across DHCP churn), time-bounded IP join for the destination.
pub async fn backfill_device_names(
    State(state): State<AppState>,
    Json(body): Json<BackfillNamesBody>,
) -> ApiResult<Json<Value>> {
    let since = body
        .since
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ApiError::bad_request("'since' date is required"))?;

    let src_patched = sqlx::query(
        "UPDATE logs
         SET src_device_name = COALESCE(c.device_name, c.hostname, c.oui)
         FROM unifi_clients c
         WHERE logs.mac_address = c.mac
           AND logs.src_device_name IS NULL
           AND logs.timestamp >= $1
           AND COALESCE(c.device_name, c.hostname, c.oui) IS NOT NULL",
    )
    .bind(since)
    .execute(state.store.pool())
    .await?
    .rows_affected();

    let dst_patched = sqlx::query(
        "UPDATE logs
         SET dst_device_name = sub.name
         FROM (
             SELECT DISTINCT ON (host(ip)) ip,
                    COALESCE(device_name, hostname, oui) AS name,
                    last_seen
             FROM unifi_clients
             WHERE COALESCE(device_name, hostname, oui) IS NOT NULL
             ORDER BY host(ip), last_seen DESC NULLS LAST
         ) sub
         WHERE logs.dst_ip = sub.ip
           AND logs.dst_device_name IS NULL
           AND logs.timestamp >= $1
           AND logs.timestamp >= sub.last_seen - INTERVAL '1 day'",
    )
    .bind(since)
    .execute(state.store.pool())
    .await?
    .rows_affected();

    tracing::info!(
        "Device name backfill: {src_patched} src, {dst_patched} dst patched (since {since})"
    );
    Ok(Json(json!({
        "success": true,
        "src_patched": src_patched,
        "dst_patched": dst_patched,
    })))
}
