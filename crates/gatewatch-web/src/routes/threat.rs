//! Threat-client status and manual enrichment endpoints.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use gatewatch_core::net::is_public_ip_str;
use gatewatch_enrich::threat::STATS_FILE;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn read_stats_file() -> Option<Value> {
    let raw = std::fs::read_to_string(STATS_FILE).ok()?;
    serde_json::from_str(&raw).ok()
}

fn quota_reset_pending(stats: &Value, now: i64) -> bool {
    let remaining = stats.get("remaining").and_then(Value::as_i64).unwrap_or(0);
    let reset_at = stats.get("reset_at").and_then(Value::as_i64);
    matches!(reset_at, Some(reset) if remaining <= 0 && now > reset)
}

/// GET /api/abuseipdb/status
pub async fn threat_status(State(_state): State<AppState>) -> Json<Value> {
    let now = Utc::now().timestamp();
    match read_stats_file() {
        Some(mut stats) => {
            if quota_reset_pending(&stats, now) {
                stats["quota_reset_pending"] = json!(true);
            }
            Json(stats)
        }
        None => Json(json!({ "remaining": null, "limit": null })),
    }
}

/// POST /api/enrich/{ip}
///
/// Force-refresh one IP: invalidate both cache tiers, hit the API, and
/// patch every blocked firewall row touching that IP.
pub async fn enrich_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<Value>> {
    if !is_public_ip_str(&ip) {
        return Err(ApiError::bad_request("Not a public IP"));
    }

    // Never enrich ourselves: a WAN/gateway entry in the threat cache
    // contaminates every row it later joins against.
    let exclusions = state.store.exclusion_set().await?;
    if exclusions.contains_str(&ip) {
        return Err(ApiError::bad_request("Cannot enrich WAN/gateway IP"));
    }

    if !state.threat.enabled {
        return Err(ApiError::bad_request("AbuseIPDB not configured"));
    }

    // Budget gate: the receiver process owns the live limiter state, so
    // the shared stats file is the source of truth here.
    if let Some(stats) = read_stats_file() {
        let now = Utc::now().timestamp();
        if let Some(paused_until) = stats.get("paused_until").and_then(Value::as_i64) {
            if now < paused_until {
                return Err(ApiError::too_many_requests(
                    "Threat service is rate limited — try again later",
                ));
            }
        }
        let remaining = stats.get("remaining").and_then(Value::as_i64).unwrap_or(0);
        if remaining <= 0 && !quota_reset_pending(&stats, now) {
            return Err(ApiError::too_many_requests(
                "No API budget remaining — resets daily",
            ));
        }
        if remaining <= 0 {
            tracing::info!("Manual enrich: quota reset detected, allowing call for {ip}");
        }
    }

    state.threat.set_exclusions(exclusions);

    // Invalidate both tiers so lookup() must go to the API
    state.threat.invalidate(&ip);
    if let Err(e) = state.store.expire_threats(&[ip.clone()]).await {
        tracing::debug!("Could not backdate threat entry for {ip} (may not exist yet): {e}");
    }

    let entry = state
        .threat
        .lookup(&ip)
        .await
        .ok_or_else(|| ApiError::bad_gateway("AbuseIPDB lookup failed"))?;

    // Patch rows on both sides of the join, never through our own IPs
    let mut excluded = state.store.wan_ips_from_config().await?;
    excluded.extend(state.store.gateway_ips_from_config().await?);
    let logs_patched = state.store.patch_rows_for_ip(&ip, &excluded).await?;

    Ok(Json(json!({
        "ip": ip,
        "threat_score": entry.threat_score,
        "threat_categories": entry.threat_categories,
        "abuse_usage_type": entry.abuse_usage_type,
        "abuse_hostnames": entry.abuse_hostnames,
        "abuse_total_reports": entry.abuse_total_reports,
        "abuse_last_reported": entry.abuse_last_reported,
        "abuse_is_whitelisted": entry.abuse_is_whitelisted,
        "abuse_is_tor": entry.abuse_is_tor,
        "logs_patched": logs_patched,
        "remaining_budget": state.threat.remaining_budget(),
    })))
}
