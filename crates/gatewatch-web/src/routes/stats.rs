//! Dashboard statistics endpoint.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::annotate::Annotator;
use crate::error::ApiResult;
use crate::filter::parse_time_range;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    #[serde(default = "default_range")]
    pub time_range: String,
}

fn default_range() -> String {
    "24h".to_string()
}

/// Series bucket width by range: hourly up to a day, daily to two months,
/// weekly around a quarter, monthly beyond.
fn bucket_for(time_range: &str) -> &'static str {
    match time_range {
        "1h" | "6h" | "24h" => "hour",
        "7d" | "30d" | "60d" => "day",
        "90d" => "week",
        "180d" | "365d" => "month",
        _ => "day",
    }
}

const PRIVATE_SRC: &str = "(src_ip << '10.0.0.0/8'::inet
    OR src_ip << '172.16.0.0/12'::inet
    OR src_ip << '192.168.0.0/16'::inet)";

const NON_ROUTABLE_SRC: &str = "(src_ip << '10.0.0.0/8'::inet OR src_ip << '172.16.0.0/12'::inet
    OR src_ip << '192.168.0.0/16'::inet OR src_ip << '127.0.0.0/8'::inet
    OR src_ip << 'fe80::/10'::inet OR src_ip << 'fc00::/7'::inet)";

const NON_ROUTABLE_DST: &str = "(dst_ip << '10.0.0.0/8'::inet OR dst_ip << '172.16.0.0/12'::inet
    OR dst_ip << '192.168.0.0/16'::inet OR dst_ip << '127.0.0.0/8'::inet
    OR dst_ip << '0.0.0.0/8'::inet OR dst_ip << '169.254.0.0/16'::inet
    OR dst_ip << '224.0.0.0/4'::inet OR dst_ip << '240.0.0.0/4'::inet
    OR dst_ip << 'fe80::/10'::inet OR dst_ip << 'fc00::/7'::inet
    OR dst_ip << 'ff00::/8'::inet OR dst_ip << '::1/128'::inet)";

/// GET /api/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<Value>> {
    let cutoff = parse_time_range(&params.time_range)
        .unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let bucket = bucket_for(&params.time_range);
    let pool = state.store.pool();

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM logs WHERE timestamp >= $1")
        .bind(cutoff)
        .fetch_one(pool)
        .await?;

    let by_type: Vec<(String, i64)> = sqlx::query_as(
        "SELECT log_type, COUNT(*) FROM logs
         WHERE timestamp >= $1 GROUP BY log_type ORDER BY count DESC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let (blocked,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM logs WHERE timestamp >= $1 AND rule_action = 'block'",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await?;

    let (threats,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM logs WHERE timestamp >= $1 AND threat_score > 50",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await?;

    let (allowed,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM logs
         WHERE timestamp >= $1 AND log_type = 'firewall' AND rule_action = 'allow'",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await?;

    let top_blocked_countries: Vec<(String, i64)> = sqlx::query_as(
        "SELECT geo_country, COUNT(*) FROM logs
         WHERE timestamp >= $1 AND rule_action = 'block' AND geo_country IS NOT NULL
         GROUP BY geo_country ORDER BY count DESC LIMIT 10",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    // Our own WAN IPs never rank as attackers
    let mut exclude_ips = vec!["0.0.0.0".to_string()];
    for ip in state.store.wan_ips_from_config().await? {
        if !exclude_ips.contains(&ip) {
            exclude_ips.push(ip);
        }
    }

    let top_blocked_ips: Vec<(String, i64, Option<String>, Option<String>, Option<i32>)> =
        sqlx::query_as(&format!(
            "SELECT host(src_ip), COUNT(*),
                    MAX(geo_country), MAX(asn_name), MAX(threat_score)
             FROM logs
             WHERE timestamp >= $1 AND rule_action = 'block' AND src_ip IS NOT NULL
               AND host(src_ip) != ALL($2)
               AND NOT {NON_ROUTABLE_SRC}
             GROUP BY src_ip ORDER BY count DESC LIMIT 10"
        ))
        .bind(cutoff)
        .bind(&exclude_ips)
        .fetch_all(pool)
        .await?;

    // Internal blocked sources, with a cutoff-anchored recency window on
    // the name lookup: a 30-day aggregate must not restrict names to
    // clients seen in the last day.
    let top_blocked_internal: Vec<(String, i64, Option<String>)> = sqlx::query_as(&format!(
        "WITH top_ips AS (
             SELECT src_ip, host(src_ip) AS ip, COUNT(*) AS count
             FROM logs
             WHERE timestamp >= $1 AND rule_action = 'block' AND src_ip IS NOT NULL
               AND {PRIVATE_SRC}
             GROUP BY src_ip ORDER BY count DESC LIMIT 10
         )
         SELECT t.ip, t.count, c.device_name
         FROM top_ips t
         LEFT JOIN LATERAL (
             SELECT COALESCE(device_name, hostname, oui) AS device_name
             FROM unifi_clients
             WHERE ip = t.src_ip AND last_seen >= $1 - INTERVAL '1 day'
             ORDER BY last_seen DESC NULLS LAST LIMIT 1
         ) c ON true
         ORDER BY t.count DESC"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    #[allow(clippy::type_complexity)]
    let top_threat_ips: Vec<(
        String,
        i64,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<i32>,
        Option<Vec<String>>,
        Option<DateTime<Utc>>,
    )> = sqlx::query_as(
        "SELECT host(l.src_ip), COUNT(*),
                MAX(l.geo_country), MAX(l.asn_name), MAX(l.geo_city), MAX(l.rdns),
                MAX(l.threat_score),
                COALESCE(MAX(l.threat_categories), MAX(t.threat_categories)),
                MAX(l.timestamp)
         FROM logs l
         LEFT JOIN ip_threats t ON l.src_ip = t.ip
         WHERE l.timestamp >= $1 AND l.threat_score > 50 AND l.src_ip IS NOT NULL
           AND host(l.src_ip) != ALL($2)
         GROUP BY l.src_ip ORDER BY MAX(l.threat_score) DESC, count DESC LIMIT 10",
    )
    .bind(cutoff)
    .bind(&exclude_ips)
    .fetch_all(pool)
    .await?;

    let logs_over_time: Vec<(DateTime<Utc>, i64)> = sqlx::query_as(&format!(
        "SELECT date_trunc('{bucket}', timestamp) AS period, COUNT(*)
         FROM logs WHERE timestamp >= $1
         GROUP BY period ORDER BY period"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let action_rows: Vec<(DateTime<Utc>, String, i64)> = sqlx::query_as(&format!(
        "SELECT date_trunc('{bucket}', timestamp) AS period, rule_action, COUNT(*)
         FROM logs
         WHERE timestamp >= $1 AND log_type = 'firewall' AND rule_action IS NOT NULL
         GROUP BY period, rule_action ORDER BY period"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    // Pivot into one object per bucket with allow/block/redirect counts
    let mut traffic_by_action: Vec<Value> = Vec::new();
    for (period, action, count) in action_rows {
        let period = period.to_rfc3339();
        if !matches!(action.as_str(), "allow" | "block" | "redirect") {
            continue;
        }
        match traffic_by_action
            .iter_mut()
            .find(|entry| entry["period"] == period.as_str())
        {
            Some(entry) => entry[action.as_str()] = json!(count),
            None => {
                let mut entry = json!({"period": period, "allow": 0, "block": 0, "redirect": 0});
                entry[action.as_str()] = json!(count);
                traffic_by_action.push(entry);
            }
        }
    }

    let by_direction: Vec<(String, i64)> = sqlx::query_as(
        "SELECT direction, COUNT(*) FROM logs
         WHERE timestamp >= $1 AND direction IS NOT NULL
         GROUP BY direction ORDER BY count DESC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let top_dns: Vec<(String, i64)> = sqlx::query_as(
        "SELECT dns_query, COUNT(*) FROM logs
         WHERE timestamp >= $1 AND log_type = 'dns' AND dns_query IS NOT NULL
         GROUP BY dns_query ORDER BY count DESC LIMIT 10",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let top_blocked_services: Vec<(String, i64)> = sqlx::query_as(
        "SELECT service_name, COUNT(*) FROM logs
         WHERE timestamp >= $1 AND rule_action = 'block' AND service_name IS NOT NULL
         GROUP BY service_name ORDER BY count DESC LIMIT 10",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let top_allowed_destinations: Vec<(String, i64, Option<String>, Option<String>)> =
        sqlx::query_as(&format!(
            "SELECT host(dst_ip), COUNT(*), MAX(geo_country), MAX(asn_name)
             FROM logs
             WHERE timestamp >= $1 AND rule_action = 'allow' AND dst_ip IS NOT NULL
               AND host(dst_ip) != ALL($2)
               AND NOT {NON_ROUTABLE_DST}
             GROUP BY dst_ip ORDER BY count DESC LIMIT 10"
        ))
        .bind(cutoff)
        .bind(&exclude_ips)
        .fetch_all(pool)
        .await?;

    let top_allowed_countries: Vec<(String, i64)> = sqlx::query_as(
        "SELECT geo_country, COUNT(*) FROM logs
         WHERE timestamp >= $1 AND rule_action = 'allow'
           AND geo_country IS NOT NULL AND direction = 'outbound'
         GROUP BY geo_country ORDER BY count DESC LIMIT 10",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let top_allowed_services: Vec<(String, i64)> = sqlx::query_as(
        "SELECT service_name, COUNT(*) FROM logs
         WHERE timestamp >= $1 AND rule_action = 'allow' AND service_name IS NOT NULL
         GROUP BY service_name ORDER BY count DESC LIMIT 10",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    // Busiest internal sources; the router's own VLAN addresses would
    // otherwise dominate the list
    let gateway_ips = state.store.gateway_ips_from_config().await?;
    let top_active_internal: Vec<(String, i64, Option<String>)> = sqlx::query_as(&format!(
        "WITH top_ips AS (
             SELECT src_ip, host(src_ip) AS ip, COUNT(*) AS count
             FROM logs
             WHERE timestamp >= $1 AND rule_action = 'allow' AND src_ip IS NOT NULL
               AND {PRIVATE_SRC}
               AND host(src_ip) != ALL($2)
             GROUP BY src_ip ORDER BY count DESC LIMIT 10
         )
         SELECT t.ip, t.count, c.device_name
         FROM top_ips t
         LEFT JOIN LATERAL (
             SELECT COALESCE(device_name, hostname, oui) AS device_name
             FROM unifi_clients
             WHERE ip = t.src_ip AND last_seen >= $1 - INTERVAL '1 day'
             ORDER BY last_seen DESC NULLS LAST LIMIT 1
         ) c ON true
         ORDER BY t.count DESC"
    ))
    .bind(cutoff)
    .bind(&gateway_ips)
    .fetch_all(pool)
    .await?;

    // Annotate internal lists with gateway/WAN labels
    let annotator = Annotator::load(&state.store).await?;
    let mut top_blocked_internal: Vec<Value> = top_blocked_internal
        .into_iter()
        .map(|(ip, count, name)| json!({"ip": ip, "count": count, "device_name": name}))
        .collect();
    let mut top_active_internal: Vec<Value> = top_active_internal
        .into_iter()
        .map(|(ip, count, name)| json!({"ip": ip, "count": count, "device_name": name}))
        .collect();
    for entry in top_blocked_internal.iter_mut().chain(top_active_internal.iter_mut()) {
        annotator.annotate_ip_entry(entry);
    }

    let logs_over_time: Vec<Value> = logs_over_time
        .into_iter()
        .map(|(period, count)| json!({"period": period.to_rfc3339(), "count": count}))
        .collect();

    Ok(Json(json!({
        "time_range": params.time_range,
        "total": total,
        "by_type": by_type
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect::<serde_json::Map<String, Value>>(),
        "blocked": blocked,
        "threats": threats,
        "allowed": allowed,
        "by_direction": by_direction
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect::<serde_json::Map<String, Value>>(),
        "top_blocked_countries": top_blocked_countries
            .into_iter()
            .map(|(country, count)| json!({"country": country, "count": count}))
            .collect::<Vec<_>>(),
        "top_blocked_ips": top_blocked_ips
            .into_iter()
            .map(|(ip, count, country, asn, threat_score)| json!({
                "ip": ip, "count": count, "country": country,
                "asn": asn, "threat_score": threat_score,
            }))
            .collect::<Vec<_>>(),
        "top_blocked_internal_ips": top_blocked_internal,
        "top_threat_ips": top_threat_ips
            .into_iter()
            .map(|(ip, count, country, asn, city, rdns, threat_score, categories, last_seen)| json!({
                "ip": ip, "count": count, "country": country, "asn": asn,
                "city": city, "rdns": rdns, "threat_score": threat_score,
                "threat_categories": categories,
                "last_seen": last_seen.map(|t| t.to_rfc3339()),
            }))
            .collect::<Vec<_>>(),
        "top_blocked_services": top_blocked_services
            .into_iter()
            .map(|(service_name, count)| json!({"service_name": service_name, "count": count}))
            .collect::<Vec<_>>(),
        "top_allowed_destinations": top_allowed_destinations
            .into_iter()
            .map(|(ip, count, country, asn)| json!({
                "ip": ip, "count": count, "country": country, "asn": asn,
            }))
            .collect::<Vec<_>>(),
        "top_allowed_countries": top_allowed_countries
            .into_iter()
            .map(|(country, count)| json!({"country": country, "count": count}))
            .collect::<Vec<_>>(),
        "top_allowed_services": top_allowed_services
            .into_iter()
            .map(|(service_name, count)| json!({"service_name": service_name, "count": count}))
            .collect::<Vec<_>>(),
        "top_active_internal_ips": top_active_internal,
        "top_dns": top_dns
            .into_iter()
            .map(|(dns_query, count)| json!({"dns_query": dns_query, "count": count}))
            .collect::<Vec<_>>(),
        "logs_over_time": logs_over_time,
        "traffic_by_action": traffic_by_action,
    })))
}
