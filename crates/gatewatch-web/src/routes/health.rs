//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Datelike, Duration, Local, Timelike, Utc};
use serde_json::{json, Value};

use gatewatch_enrich::geoip::{ASN_DB, CITY_DB, DEFAULT_DB_DIR};
use gatewatch_enrich::threat::{RATE_LIMIT_CONFIG_KEY, STATS_FILE};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn mmdb_mtime(filename: &str) -> Option<String> {
    let dir = std::env::var("GEOIP_DB_DIR").unwrap_or_else(|_| DEFAULT_DB_DIR.to_string());
    let metadata = std::fs::metadata(std::path::Path::new(&dir).join(filename)).ok()?;
    let mtime = metadata.modified().ok()?;
    Some(DateTime::<Utc>::from(mtime).to_rfc3339())
}

/// Next scheduled GeoLite2 refresh: Wednesdays and Saturdays at 07:00
/// local, matching the geoipupdate cron.
fn next_maxmind_update() -> Option<String> {
    let now = Local::now();
    let target_today = now
        .with_hour(7)?
        .with_minute(0)?
        .with_second(0)?
        .with_nanosecond(0)?;

    let is_update_day = |weekday: chrono::Weekday| {
        matches!(weekday, chrono::Weekday::Wed | chrono::Weekday::Sat)
    };

    if is_update_day(now.weekday()) && now < target_today {
        return Some(target_today.to_rfc3339());
    }
    for days_ahead in 1..8 {
        let candidate = target_today + Duration::days(days_ahead);
        if is_update_day(candidate.weekday()) {
            return Some(candidate.to_rfc3339());
        }
    }
    None
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let (total, oldest, latest) = state.store.log_bounds().await.map_err(|e| {
        tracing::error!("Health check failed: {e}");
        ApiError::new(axum::http::StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
    })?;

    let (general, dns) = state.store.effective_retention().await;

    // Rate-limit stats: the shared file is freshest; the config mirror
    // covers a receiver that hasn't written it yet this boot.
    let now = Utc::now().timestamp();
    let mut threat_stats: Option<Value> = std::fs::read_to_string(STATS_FILE)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());
    let file_is_useful = threat_stats
        .as_ref()
        .map(|s| !s.get("limit").map(Value::is_null).unwrap_or(true))
        .unwrap_or(false);
    if !file_is_useful {
        if let Ok(Some(mirrored)) = state.store.get_config::<Value>(RATE_LIMIT_CONFIG_KEY).await {
            let pause_active = mirrored
                .get("paused_until")
                .and_then(Value::as_i64)
                .map(|p| now < p)
                .unwrap_or(false);
            let has_limit = !mirrored.get("limit").map(Value::is_null).unwrap_or(true);
            if has_limit || pause_active {
                threat_stats = Some(mirrored);
            }
        }
    }
    if let Some(stats) = threat_stats.as_mut() {
        let remaining = stats.get("remaining").and_then(Value::as_i64).unwrap_or(0);
        if let Some(reset_at) = stats.get("reset_at").and_then(Value::as_i64) {
            if remaining <= 0 && now > reset_at {
                stats["quota_reset_pending"] = json!(true);
            }
        }
    }

    Ok(Json(json!({
        "status": "ok",
        "version": state.version,
        "total_logs": total,
        "oldest_log_at": oldest.map(|t| t.to_rfc3339()),
        "latest_log": latest.map(|t| t.to_rfc3339()),
        "retention_days": general.days,
        "retention_source": general.source,
        "dns_retention_days": dns.days,
        "dns_retention_source": dns.source,
        "abuseipdb": threat_stats,
        "maxmind_last_update": mmdb_mtime(CITY_DB),
        "maxmind_asn_last_update": mmdb_mtime(ASN_DB),
        "maxmind_next_update": next_maxmind_update(),
    })))
}
