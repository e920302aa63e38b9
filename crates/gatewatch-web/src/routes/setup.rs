//! Setup wizard, configuration CRUD, and retention endpoints.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use gatewatch_core::vpn::{is_vpn_interface, vpn_description_for};

use crate::annotate::VpnNetworkEntry;
use crate::error::{ApiError, ApiResult};
use crate::state::{signal_receiver, AppState};

/// Keys included in config export/import. Credentials are handled apart.
const EXPORTABLE_KEYS: &[&str] = &[
    "wan_interfaces",
    "interface_labels",
    "vpn_networks",
    "setup_complete",
    "config_version",
    "wizard_path",
    "unifi_enabled",
    "unifi_host",
    "unifi_site",
    "unifi_verify_ssl",
    "unifi_poll_interval",
    "unifi_features",
    "unifi_controller_name",
    "retention_days",
    "dns_retention_days",
];

const API_KEY_CONFIG_KEY: &str = "unifi_api_key";

/// GET /api/config
pub async fn get_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let store = &state.store;
    Ok(Json(json!({
        "wan_interfaces": store.get_config_or("wan_interfaces", vec!["ppp0".to_string()]).await,
        "interface_labels": store.get_config_or("interface_labels", HashMap::<String, String>::new()).await,
        "setup_complete": store.get_config_or("setup_complete", false).await,
        "config_version": store.get_config_or("config_version", 1i64).await,
        "upgrade_v2_dismissed": store.get_config_or("upgrade_v2_dismissed", false).await,
        "unifi_enabled": state.unifi.enabled().await,
    })))
}

/// GET /api/setup/status
pub async fn setup_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({
        "setup_complete": state.store.get_config_or("setup_complete", false).await,
        "logs_count": state.store.count_logs(Some("firewall")).await?,
    })))
}

/// GET /api/setup/wan-candidates
pub async fn wan_candidates(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let candidates = state.store.wan_ip_candidates().await?;
    Ok(Json(json!({ "candidates": candidates })))
}

#[derive(Debug, Deserialize)]
pub struct SegmentsParams {
    pub wan_interfaces: Option<String>,
}

/// GET /api/setup/network-segments
///
/// Every interface seen on firewall logs with a sample local IP and a
/// suggested label. Interfaces named in `wan_interfaces` get the detected
/// WAN IP and a WAN/WAN{n} label instead of a random local address.
pub async fn network_segments(
    State(state): State<AppState>,
    Query(params): Query<SegmentsParams>,
) -> ApiResult<Json<Value>> {
    let wan_list: Vec<String> = params
        .wan_interfaces
        .as_deref()
        .map(|raw| raw.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    let rows: Vec<(String, Option<Vec<String>>)> = sqlx::query_as(
        "WITH interface_ips AS (
             SELECT interface_in AS iface, src_ip
             FROM logs
             WHERE log_type = 'firewall'
               AND interface_in IS NOT NULL
               AND (src_ip << '10.0.0.0/8'::inet
                    OR src_ip << '172.16.0.0/12'::inet
                    OR src_ip << '192.168.0.0/16'::inet
                    OR src_ip << 'fc00::/7'::inet
                    OR src_ip << 'fe80::/10'::inet)
             UNION
             SELECT interface_out AS iface, dst_ip AS src_ip
             FROM logs
             WHERE log_type = 'firewall'
               AND interface_out IS NOT NULL
               AND (dst_ip << '10.0.0.0/8'::inet
                    OR dst_ip << '172.16.0.0/12'::inet
                    OR dst_ip << '192.168.0.0/16'::inet
                    OR dst_ip << 'fc00::/7'::inet
                    OR dst_ip << 'fe80::/10'::inet)
         )
         SELECT iface,
                ARRAY_AGG(DISTINCT host(src_ip) ORDER BY host(src_ip)) AS sample_ips
         FROM interface_ips
         GROUP BY iface
         ORDER BY iface
         LIMIT 30",
    )
    .fetch_all(state.store.pool())
    .await?;

    // WAN interfaces show their public IP, not a stray local sample
    let wan_ips = if wan_list.is_empty() {
        HashMap::new()
    } else {
        state.store.wan_ips_by_interface(&wan_list).await?
    };

    // Integration-API VPN overlay, when the controller is reachable
    let vpn_overlay: HashMap<String, gatewatch_unifi::VpnNetwork> = state
        .unifi
        .vpn_networks()
        .await
        .into_iter()
        .filter_map(|net| net.interface.clone().map(|iface| (iface, net)))
        .collect();

    let mut segments = Vec::new();
    for (iface, sample_ips) in rows {
        let ips = sample_ips.unwrap_or_default();
        let is_wan = wan_list.contains(&iface);

        let (suggested, display_ip) = if is_wan {
            let label = if wan_list.len() == 1 {
                "WAN".to_string()
            } else {
                let index = wan_list.iter().position(|w| *w == iface).unwrap_or(0);
                format!("WAN{}", index + 1)
            };
            (label, wan_ips.get(&iface).cloned().unwrap_or_default())
        } else if iface == "br0" {
            ("Main LAN".to_string(), ips.first().cloned().unwrap_or_default())
        } else if let Some(num) = iface.strip_prefix("br") {
            let label = if num.chars().all(|c| c.is_ascii_digit()) && !num.is_empty() {
                format!("VLAN {num}")
            } else {
                iface.clone()
            };
            (label, ips.first().cloned().unwrap_or_default())
        } else if let Some(num) = iface.strip_prefix("vlan") {
            let label = if num.chars().all(|c| c.is_ascii_digit()) && !num.is_empty() {
                format!("VLAN {num}")
            } else {
                iface.clone()
            };
            (label, ips.first().cloned().unwrap_or_default())
        } else if let Some(num) = iface.strip_prefix("eth") {
            let label = if num.chars().all(|c| c.is_ascii_digit()) && !num.is_empty() {
                format!("Ethernet {num}")
            } else {
                iface.clone()
            };
            (label, ips.first().cloned().unwrap_or_default())
        } else {
            (String::new(), ips.first().cloned().unwrap_or_default())
        };

        let mut segment = json!({
            "interface": iface,
            "sample_local_ip": display_ip,
            "suggested_label": suggested,
            "is_wan": is_wan,
        });
        if let Some(vpn) = vpn_overlay.get(&iface) {
            segment["vpn_name"] = json!(vpn.name);
            segment["vpn_badge"] = json!(vpn.badge);
            segment["vpn_cidr"] = json!(vpn.cidr);
        }
        segments.push(segment);
    }

    Ok(Json(json!({ "segments": segments })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteSetupBody {
    pub wan_interfaces: Option<Vec<String>>,
    #[serde(default)]
    pub interface_labels: HashMap<String, String>,
    #[serde(default)]
    pub vpn_networks: Option<HashMap<String, VpnNetworkEntry>>,
    pub wizard_path: Option<String>,
    #[serde(default)]
    pub wan_ip_by_iface: Option<HashMap<String, String>>,
    #[serde(default)]
    pub wan_ips: Option<Vec<String>>,
}

/// POST /api/setup/complete
pub async fn complete_setup(
    State(state): State<AppState>,
    Json(body): Json<CompleteSetupBody>,
) -> ApiResult<Json<Value>> {
    let wan_interfaces = body
        .wan_interfaces
        .filter(|w| !w.is_empty())
        .ok_or_else(|| ApiError::bad_request("wan_interfaces required"))?;

    let store = &state.store;

    // Before overwriting, note whether WAN actually changed: a change
    // invalidates every stored direction.
    let current_wan: Vec<String> =
        store.get_config_or("wan_interfaces", vec!["ppp0".to_string()]).await;

    store.set_config("wan_interfaces", &wan_interfaces).await?;
    store.set_config("interface_labels", &body.interface_labels).await?;
    store.set_config("setup_complete", &true).await?;
    store.set_config("config_version", &2).await?;

    if let Some(vpn_networks) = &body.vpn_networks {
        store.set_config("vpn_networks", vpn_networks).await?;
    }
    if let Some(by_iface) = &body.wan_ip_by_iface {
        store.set_config("wan_ip_by_iface", by_iface).await?;
    }
    if let Some(wan_ips) = &body.wan_ips {
        store.set_config("wan_ips", wan_ips).await?;
        if let Some(first) = wan_ips.first() {
            store.set_config("wan_ip", first).await?;
        }
    }

    let wizard_path = body.wizard_path.unwrap_or_else(|| "log_detection".to_string());
    store.set_config("wizard_path", &wizard_path).await?;
    if wizard_path == "unifi_api" {
        store.set_config("unifi_enabled", &true).await?;
        state.unifi.clone().reload_config().await;
    }

    let changed = {
        let mut old = current_wan.clone();
        let mut new = wan_interfaces.clone();
        old.sort();
        new.sort();
        old != new
    };
    if changed {
        store.set_config("direction_backfill_pending", &true).await?;
    }

    signal_receiver();
    Ok(Json(json!({ "success": true })))
}

/// GET /api/interfaces — discovered interfaces tagged wan/vpn/vlan/eth.
pub async fn list_interfaces(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let labels: HashMap<String, String> =
        state.store.get_config_or("interface_labels", HashMap::new()).await;
    let wan_interfaces: Vec<String> =
        state.store.get_config_or("wan_interfaces", vec!["ppp0".to_string()]).await;

    let rows: Vec<(Option<String>,)> = sqlx::query_as(
        "SELECT DISTINCT unnest(ARRAY[interface_in, interface_out]) AS iface
         FROM logs
         WHERE log_type = 'firewall'
           AND (interface_in IS NOT NULL OR interface_out IS NOT NULL)",
    )
    .fetch_all(state.store.pool())
    .await?;

    let mut interfaces: Vec<String> = rows.into_iter().filter_map(|(iface,)| iface).collect();
    interfaces.sort();

    let result: Vec<Value> = interfaces
        .into_iter()
        .map(|iface| {
            let kind = if wan_interfaces.contains(&iface) {
                "wan"
            } else if is_vpn_interface(&iface) {
                "vpn"
            } else if iface.starts_with("br") || iface.starts_with("vlan") {
                "vlan"
            } else {
                "eth"
            };
            let mut entry = json!({
                "name": iface,
                "label": labels.get(&iface).cloned().unwrap_or_else(|| iface.clone()),
                "type": kind,
            });
            if let Some(desc) = vpn_description_for(&iface) {
                entry["description"] = json!(desc);
            }
            entry
        })
        .collect();

    Ok(Json(json!({ "interfaces": result })))
}

// ── Config export / import ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExportConfigParams {
    #[serde(default)]
    pub include_api_key: bool,
}

/// GET /api/config/export
pub async fn export_config(
    State(state): State<AppState>,
    Query(params): Query<ExportConfigParams>,
) -> ApiResult<Json<Value>> {
    let mut config = serde_json::Map::new();
    for key in EXPORTABLE_KEYS {
        if let Some(value) = state.store.get_config_value(key).await? {
            config.insert(key.to_string(), value);
        }
    }

    let mut includes_api_key = false;
    if params.include_api_key {
        let plaintext = state.store.get_encrypted_config(API_KEY_CONFIG_KEY).await;
        if !plaintext.is_empty() {
            config.insert(API_KEY_CONFIG_KEY.to_string(), json!(plaintext));
            includes_api_key = true;
        }
    }

    Ok(Json(json!({
        "version": state.version,
        "exported_at": Utc::now().to_rfc3339(),
        "includes_api_key": includes_api_key,
        "config": config,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ImportConfigBody {
    pub config: Option<Value>,
}

/// POST /api/config/import
pub async fn import_config(
    State(state): State<AppState>,
    Json(body): Json<ImportConfigBody>,
) -> ApiResult<Json<Value>> {
    let config = body
        .config
        .as_ref()
        .and_then(Value::as_object)
        .ok_or_else(|| {
            ApiError::bad_request("Invalid config format — expected {config: {...}}")
        })?;

    let mut imported_keys = Vec::new();
    let mut failed_keys = Vec::new();
    for key in EXPORTABLE_KEYS {
        if let Some(value) = config.get(*key) {
            state.store.set_config(key, value).await?;
            imported_keys.push(key.to_string());
        }
    }

    // The API key travels in plaintext and is re-encrypted for storage
    if let Some(plaintext) = config.get(API_KEY_CONFIG_KEY).and_then(Value::as_str) {
        if !plaintext.is_empty() {
            match state.store.set_encrypted_config(API_KEY_CONFIG_KEY, plaintext).await {
                Ok(()) => imported_keys.push(API_KEY_CONFIG_KEY.to_string()),
                Err(e) => {
                    tracing::warn!("Failed to encrypt imported API key: {e}");
                    failed_keys.push(API_KEY_CONFIG_KEY.to_string());
                }
            }
        }
    }

    signal_receiver();
    if imported_keys.iter().any(|k| k.starts_with("unifi_")) {
        state.unifi.clone().reload_config().await;
    }

    let mut result = json!({ "success": true, "imported_keys": imported_keys });
    if !failed_keys.is_empty() {
        result["failed_keys"] = json!(failed_keys);
    }
    Ok(Json(result))
}

// ── Retention ─────────────────────────────────────────────────────────

/// Slider steps the UI offers; estimates extrapolate the 7-day rate.
const RETENTION_STEPS: &[i64] = &[60, 120, 180, 270, 365];

async fn estimate_log_counts(state: &AppState) -> HashMap<String, Option<i64>> {
    let row: Result<(i64, Option<f64>), _> = sqlx::query_as(
        "SELECT COUNT(*),
                EXTRACT(EPOCH FROM (MAX(timestamp) - MIN(timestamp)))::float8 / 86400.0
         FROM logs
         WHERE log_type != 'dns'
           AND timestamp >= NOW() - INTERVAL '7 days'",
    )
    .fetch_one(state.store.pool())
    .await;

    let (count_7d, span_days) = match row {
        Ok((count, span)) => (count, span.unwrap_or(0.0)),
        Err(e) => {
            tracing::debug!("Failed to estimate log counts: {e}");
            (0, 0.0)
        }
    };

    if span_days < 0.5 || count_7d < 10 {
        return RETENTION_STEPS.iter().map(|s| (s.to_string(), None)).collect();
    }

    let daily_rate = count_7d as f64 / span_days;
    RETENTION_STEPS
        .iter()
        .map(|s| (s.to_string(), Some((daily_rate * *s as f64) as i64)))
        .collect()
}

/// GET /api/config/retention
pub async fn get_retention(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let (general, dns) = state.store.effective_retention().await;
    Ok(Json(json!({
        "retention_days": general.days,
        "dns_retention_days": dns.days,
        "general_source": general.source,
        "dns_source": dns.source,
        "estimates": estimate_log_counts(&state).await,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RetentionBody {
    pub retention_days: Option<i64>,
    pub dns_retention_days: Option<i64>,
}

/// POST /api/config/retention
pub async fn update_retention(
    State(state): State<AppState>,
    Json(body): Json<RetentionBody>,
) -> ApiResult<Json<Value>> {
    if let Some(days) = body.retention_days {
        if !(1..=3650).contains(&days) {
            return Err(ApiError::bad_request("retention_days must be between 1 and 3650"));
        }
        state.store.set_config("retention_days", &days).await?;
    }
    if let Some(days) = body.dns_retention_days {
        if !(1..=3650).contains(&days) {
            return Err(ApiError::bad_request(
                "dns_retention_days must be between 1 and 3650",
            ));
        }
        state.store.set_config("dns_retention_days", &days).await?;
    }
    Ok(Json(json!({ "success": true })))
}

/// POST /api/config/retention/cleanup — run retention immediately.
pub async fn run_retention_cleanup(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let (general, dns) = state.store.effective_retention().await;
    let deleted = state
        .store
        .run_retention(general.days as i32, dns.days as i32)
        .await?;
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}

/// POST /api/config/vpn-networks — save the manual VPN network map.
pub async fn update_vpn_networks(
    State(state): State<AppState>,
    Json(body): Json<HashMap<String, VpnNetworkEntry>>,
) -> ApiResult<Json<Value>> {
    state.store.set_config("vpn_networks", &body).await?;
    signal_receiver();
    Ok(Json(json!({ "success": true })))
}
