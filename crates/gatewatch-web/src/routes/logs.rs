//! Log list, detail, CSV export, and service-name endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use sqlx::QueryBuilder;

use crate::annotate::{Annotator, ApiLogRow};
use crate::error::{ApiError, ApiResult};
use crate::filter::{push_filters, sanitize_sort, LogFilter, MAX_EXPORT_LIMIT, MAX_PAGE_SIZE};
use crate::state::AppState;

/// Column list shared by the list and export queries: bare-text IPs plus
/// LATERAL-resolved device names.
const PAGE_SELECT: &str = "SELECT p.id, p.created_at, p.timestamp, p.log_type, p.direction,
       host(p.src_ip) AS src_ip, p.src_port, host(p.dst_ip) AS dst_ip, p.dst_port,
       p.protocol, p.service_name, p.rule_name, p.rule_desc, p.rule_action,
       p.interface_in, p.interface_out, p.mac_address, p.hostname,
       p.dhcp_event, p.dns_query, p.dns_type, p.dns_answer, p.wifi_event,
       p.geo_country, p.geo_city, p.geo_lat, p.geo_lon, p.asn_number, p.asn_name, p.rdns,
       p.threat_score, p.threat_categories,
       p.abuse_usage_type, p.abuse_hostnames, p.abuse_total_reports,
       p.abuse_last_reported, p.abuse_is_whitelisted, p.abuse_is_tor,
       p.raw_log,
       COALESCE(p.src_device_name, sc.name, sd.name) AS src_device_name,
       COALESCE(p.dst_device_name, dc.name, dd.name) AS dst_device_name
FROM page p
LEFT JOIN LATERAL (
    SELECT COALESCE(device_name, hostname, oui) AS name
    FROM unifi_clients
    WHERE mac = p.mac_address
    ORDER BY last_seen DESC NULLS LAST LIMIT 1
) sc ON true
LEFT JOIN LATERAL (
    SELECT COALESCE(device_name, model) AS name
    FROM unifi_devices WHERE mac = p.mac_address LIMIT 1
) sd ON true
LEFT JOIN LATERAL (
    SELECT COALESCE(device_name, hostname, oui) AS name
    FROM unifi_clients
    WHERE ip = p.dst_ip AND last_seen >= p.timestamp - INTERVAL '1 day'
    ORDER BY last_seen DESC NULLS LAST LIMIT 1
) dc ON true
LEFT JOIN LATERAL (
    SELECT COALESCE(device_name, model) AS name
    FROM unifi_devices WHERE ip = p.dst_ip LIMIT 1
) dd ON true";

/// GET /api/logs
pub async fn list_logs(
    State(state): State<AppState>,
    Query(params): Query<LogFilter>,
) -> ApiResult<Json<serde_json::Value>> {
    let per_page = params.per_page.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
    let page = params.page.unwrap_or(1).max(1);
    let offset = (page - 1) * per_page;
    let (sort_col, sort_dir) = sanitize_sort(
        params.sort.as_deref().unwrap_or("timestamp"),
        params.order.as_deref().unwrap_or("desc"),
    );

    let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM logs WHERE 1=1");
    push_filters(&mut count_qb, &params);
    let (total,): (i64,) = count_qb
        .build_query_as()
        .fetch_one(state.store.pool())
        .await?;

    let mut qb = QueryBuilder::new("WITH page AS (SELECT * FROM logs WHERE 1=1");
    push_filters(&mut qb, &params);
    qb.push(format!(" ORDER BY {sort_col} {sort_dir} LIMIT "));
    qb.push_bind(per_page);
    qb.push(" OFFSET ");
    qb.push_bind(offset);
    qb.push(") ");
    qb.push(PAGE_SELECT);
    qb.push(format!(" ORDER BY p.{sort_col} {sort_dir}"));

    let rows: Vec<ApiLogRow> = qb.build_query_as().fetch_all(state.store.pool()).await?;

    let annotator = Annotator::load(&state.store).await?;
    let logs: Vec<_> = rows.into_iter().map(|row| annotator.annotate(row)).collect();

    Ok(Json(serde_json::json!({
        "data": logs,
        "total": total,
        "page": page,
        "per_page": per_page,
        "pages": if per_page > 0 { (total + per_page - 1) / per_page } else { 0 },
    })))
}

/// GET /api/logs/{id}
pub async fn get_log(
    State(state): State<AppState>,
    Path(log_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut qb = QueryBuilder::new("WITH page AS (SELECT * FROM logs WHERE id = ");
    qb.push_bind(log_id);
    qb.push(") ");
    qb.push(PAGE_SELECT);

    let row: Option<ApiLogRow> = qb
        .build_query_as()
        .fetch_optional(state.store.pool())
        .await?;
    let row = row.ok_or_else(|| ApiError::not_found("Log not found"))?;

    let annotator = Annotator::load(&state.store).await?;
    let mut log = serde_json::to_value(annotator.annotate(row))
        .map_err(|_| ApiError::internal())?;

    // Pull any not-yet-patched threat fields from the cache. The join
    // side follows direction so only the remote party's data bleeds in:
    // inbound traffic is about the source, outbound about the destination.
    let wan_ips = state.store.wan_ips_from_config().await?;
    let direction = log.get("direction").and_then(serde_json::Value::as_str);
    let src = log.get("src_ip").and_then(serde_json::Value::as_str).map(str::to_string);
    let dst = log.get("dst_ip").and_then(serde_json::Value::as_str).map(str::to_string);
    let join_ip = match direction {
        Some("inbound") => src,
        Some("outbound") => dst,
        _ => src.or(dst),
    };

    if let Some(ip) = join_ip.filter(|ip| !wan_ips.contains(ip)) {
        // No freshness bound: detail views prefer stale data over none
        if let Ok(Some(entry)) = state.store.get_threat(&ip, 3650).await {
            let fill = |log: &mut serde_json::Value, key: &str, value: serde_json::Value| {
                if log.get(key).map(serde_json::Value::is_null).unwrap_or(true) && !value.is_null() {
                    log[key] = value;
                }
            };
            fill(&mut log, "abuse_usage_type", serde_json::json!(entry.abuse_usage_type));
            fill(&mut log, "abuse_hostnames", serde_json::json!(entry.abuse_hostnames));
            fill(&mut log, "abuse_total_reports", serde_json::json!(entry.abuse_total_reports));
            fill(&mut log, "abuse_last_reported", serde_json::json!(entry.abuse_last_reported));
            fill(&mut log, "abuse_is_whitelisted", serde_json::json!(entry.abuse_is_whitelisted));
            fill(&mut log, "abuse_is_tor", serde_json::json!(entry.abuse_is_tor));
            let categories_empty = log
                .get("threat_categories")
                .and_then(serde_json::Value::as_array)
                .map(|a| a.is_empty())
                .unwrap_or(true);
            if categories_empty && !entry.threat_categories.is_empty() {
                log["threat_categories"] = serde_json::json!(entry.threat_categories);
            }
        }
    }

    // IANA description for the expanded detail view
    let dst_port = log
        .get("dst_port")
        .and_then(serde_json::Value::as_i64)
        .and_then(|p| u16::try_from(p).ok());
    let protocol = log
        .get("protocol")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    if let Some(desc) = gatewatch_catalog::service_description(dst_port, protocol.as_deref()) {
        log["service_description"] = serde_json::json!(desc);
    }

    Ok(Json(log))
}

/// Export column order; the annotation columns are appended after these.
const EXPORT_COLUMNS: &[&str] = &[
    "timestamp",
    "log_type",
    "direction",
    "src_ip",
    "src_port",
    "dst_ip",
    "dst_port",
    "protocol",
    "service_name",
    "rule_name",
    "rule_desc",
    "rule_action",
    "interface_in",
    "interface_out",
    "mac_address",
    "hostname",
    "dns_query",
    "dns_type",
    "dns_answer",
    "geo_country",
    "geo_city",
    "asn_name",
    "threat_score",
    "threat_categories",
    "rdns",
    "abuse_usage_type",
    "abuse_total_reports",
    "abuse_last_reported",
    "abuse_is_tor",
];

fn csv_opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// GET /api/export
pub async fn export_csv(
    State(state): State<AppState>,
    Query(params): Query<LogFilter>,
) -> ApiResult<Response> {
    let limit = params.limit.unwrap_or(10_000).clamp(1, MAX_EXPORT_LIMIT);

    let mut qb = QueryBuilder::new("WITH page AS (SELECT * FROM logs WHERE 1=1");
    push_filters(&mut qb, &params);
    qb.push(" ORDER BY timestamp DESC LIMIT ");
    qb.push_bind(limit);
    qb.push(") ");
    qb.push(PAGE_SELECT);
    qb.push(" ORDER BY p.timestamp DESC");

    let rows: Vec<ApiLogRow> = qb.build_query_as().fetch_all(state.store.pool()).await?;
    let annotator = Annotator::load(&state.store).await?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header: Vec<&str> = EXPORT_COLUMNS.to_vec();
    header.extend([
        "src_device_name",
        "dst_device_name",
        "src_device_vlan",
        "dst_device_vlan",
        "src_vpn_network",
        "dst_vpn_network",
    ]);
    writer
        .write_record(&header)
        .map_err(|_| ApiError::internal())?;

    for row in rows {
        let annotated = annotator.annotate(row);
        let r = &annotated.row;
        let record = vec![
            r.timestamp.to_rfc3339(),
            r.log_type.clone(),
            csv_opt(&r.direction),
            csv_opt(&r.src_ip),
            csv_opt(&r.src_port),
            csv_opt(&r.dst_ip),
            csv_opt(&r.dst_port),
            csv_opt(&r.protocol),
            csv_opt(&r.service_name),
            csv_opt(&r.rule_name),
            csv_opt(&r.rule_desc),
            csv_opt(&r.rule_action),
            csv_opt(&r.interface_in),
            csv_opt(&r.interface_out),
            csv_opt(&r.mac_address),
            csv_opt(&r.hostname),
            csv_opt(&r.dns_query),
            csv_opt(&r.dns_type),
            csv_opt(&r.dns_answer),
            csv_opt(&r.geo_country),
            csv_opt(&r.geo_city),
            csv_opt(&r.asn_name),
            csv_opt(&r.threat_score),
            r.threat_categories
                .as_ref()
                .map(|c| c.join(";"))
                .unwrap_or_default(),
            csv_opt(&r.rdns),
            csv_opt(&r.abuse_usage_type),
            csv_opt(&r.abuse_total_reports),
            r.abuse_last_reported
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            csv_opt(&r.abuse_is_tor),
            csv_opt(&r.src_device_name),
            csv_opt(&r.dst_device_name),
            csv_opt(&annotated.src_device_vlan),
            csv_opt(&annotated.dst_device_vlan),
            csv_opt(&annotated.src_vpn_network),
            csv_opt(&annotated.dst_vpn_network),
        ];
        writer.write_record(&record).map_err(|_| ApiError::internal())?;
    }

    let body = writer
        .into_inner()
        .map_err(|_| ApiError::internal())?;
    let filename = format!(
        "gatewatch_logs_export_{}.csv",
        Utc::now().format("%Y%m%d_%H%M%S")
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response())
}

/// GET /api/services — distinct service names for autocomplete filtering.
pub async fn list_services(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT service_name FROM logs
         WHERE service_name IS NOT NULL
         ORDER BY service_name",
    )
    .fetch_all(state.store.pool())
    .await?;

    let services: Vec<String> = rows.into_iter().map(|(s,)| s).collect();
    Ok(Json(serde_json::json!({ "services": services })))
}
