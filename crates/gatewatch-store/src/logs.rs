//! Log-table operations: batched inserts with per-row fallback, retention,
//! stats, and the bulk maintenance queries the backfill worker drives.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::{FromRow, QueryBuilder};
use tracing::{debug, warn};

use gatewatch_core::{Error, LogRecord, Result, ThreatEntry};

use crate::Store;

/// Effective retention horizon and where it came from (ui/env/default).
#[derive(Debug, Clone)]
pub struct RetentionSetting {
    pub days: i64,
    pub source: &'static str,
}

pub const DEFAULT_RETENTION_DAYS: i64 = 60;
pub const DEFAULT_DNS_RETENTION_DAYS: i64 = 10;

#[derive(Debug, Clone, FromRow)]
pub struct FirewallDirectionRow {
    pub id: i64,
    pub interface_in: Option<String>,
    pub interface_out: Option<String>,
    pub rule_name: Option<String>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WanEnrichedRow {
    pub id: i64,
    pub dst_ip: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ContaminatedAbuseRow {
    pub id: i64,
    pub src_ip: Option<String>,
}

/// Replacement geo/rDNS fields for one contaminated row. Threat and abuse
/// columns are always nulled so the cache patch can re-fill them.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentRewrite {
    pub id: i64,
    pub geo_country: Option<String>,
    pub geo_city: Option<String>,
    pub geo_lat: Option<f64>,
    pub geo_lon: Option<f64>,
    pub asn_number: Option<i64>,
    pub asn_name: Option<String>,
    pub rdns: Option<String>,
}

fn push_record_binds(
    b: &mut sqlx::query_builder::Separated<'_, '_, sqlx::Postgres, &'static str>,
    record: &LogRecord,
) {
    b.push_bind(record.timestamp)
        .push_bind(record.log_type.to_string())
        .push_bind(record.direction.map(|d| d.to_string()))
        .push_bind(record.src_ip.map(IpNetwork::from))
        .push_bind(record.src_port)
        .push_bind(record.dst_ip.map(IpNetwork::from))
        .push_bind(record.dst_port)
        .push_bind(record.protocol.clone())
        .push_bind(record.service_name.clone())
        .push_bind(record.rule_name.clone())
        .push_bind(record.rule_desc.clone())
        .push_bind(record.rule_action.map(|a| a.to_string()))
        .push_bind(record.interface_in.clone())
        .push_bind(record.interface_out.clone())
        .push_bind(record.mac_address.clone())
        .push_bind(record.hostname.clone())
        .push_bind(record.dns_query.clone())
        .push_bind(record.dns_type.clone())
        .push_bind(record.dns_answer.clone())
        .push_bind(record.dhcp_event.clone())
        .push_bind(record.wifi_event.clone())
        .push_bind(record.geo_country.clone())
        .push_bind(record.geo_city.clone())
        .push_bind(record.geo_lat)
        .push_bind(record.geo_lon)
        .push_bind(record.asn_number)
        .push_bind(record.asn_name.clone())
        .push_bind(record.rdns.clone())
        .push_bind(record.threat_score)
        .push_bind(record.threat_categories.clone())
        .push_bind(record.abuse_usage_type.clone())
        .push_bind(record.abuse_hostnames.clone())
        .push_bind(record.abuse_total_reports)
        .push_bind(record.abuse_last_reported)
        .push_bind(record.abuse_is_whitelisted)
        .push_bind(record.abuse_is_tor)
        .push_bind(record.raw_log.clone());
}

const INSERT_PREFIX: &str = "INSERT INTO logs (
    timestamp, log_type, direction,
    src_ip, src_port, dst_ip, dst_port, protocol, service_name,
    rule_name, rule_desc, rule_action, interface_in, interface_out,
    mac_address, hostname, dns_query, dns_type, dns_answer,
    dhcp_event, wifi_event,
    geo_country, geo_city, geo_lat, geo_lon, asn_number, asn_name, rdns,
    threat_score, threat_categories,
    abuse_usage_type, abuse_hostnames, abuse_total_reports,
    abuse_last_reported, abuse_is_whitelisted, abuse_is_tor,
    raw_log) ";

impl Store {
    /// Insert a batch as one statement. On failure fall back to per-row
    /// inserts and drop rows that still fail; the pipeline never stalls on
    /// a poison row. Returns the number of rows actually inserted.
    pub async fn insert_batch(&self, records: &[LogRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(INSERT_PREFIX);
        qb.push_values(records, |mut b, record| push_record_binds(&mut b, record));
        match qb.build().execute(self.pool()).await {
            Ok(_) => {
                debug!("Batch inserted {} logs", records.len());
                Ok(records.len())
            }
            Err(batch_err) => {
                warn!(
                    "Batch insert of {} logs failed ({batch_err}); retrying row by row",
                    records.len()
                );
                let mut inserted = 0usize;
                for record in records {
                    match self.insert_one(record).await {
                        Ok(()) => inserted += 1,
                        Err(e) => debug!("Dropped log row: {e}"),
                    }
                }
                if inserted < records.len() {
                    warn!(
                        "Row-level fallback: {} of {} logs inserted, {} dropped",
                        inserted,
                        records.len(),
                        records.len() - inserted
                    );
                }
                Ok(inserted)
            }
        }
    }

    async fn insert_one(&self, record: &LogRecord) -> Result<()> {
        let mut qb = QueryBuilder::new(INSERT_PREFIX);
        qb.push_values(std::iter::once(record), |mut b, record| {
            push_record_binds(&mut b, record)
        });
        qb.build()
            .execute(self.pool())
            .await
            .map_err(|e| Error::Store(format!("Failed to insert log: {e}")))?;
        Ok(())
    }

    /// Run the retention procedure. Returns the number of deleted rows.
    pub async fn run_retention(&self, general_days: i32, dns_days: i32) -> Result<i64> {
        let (deleted,): (i64,) = sqlx::query_as("SELECT cleanup_old_logs($1, $2)")
            .bind(general_days)
            .bind(dns_days)
            .fetch_one(self.pool())
            .await
            .map_err(|e| Error::Store(format!("Retention cleanup failed: {e}")))?;
        if deleted > 0 {
            tracing::info!("Retention cleanup: deleted {deleted} old logs");
        }
        Ok(deleted)
    }

    /// Effective retention horizons. Precedence: UI (config) > env > default.
    pub async fn effective_retention(&self) -> (RetentionSetting, RetentionSetting) {
        let general = self
            .resolve_retention("retention_days", "RETENTION_DAYS", DEFAULT_RETENTION_DAYS)
            .await;
        let dns = self
            .resolve_retention("dns_retention_days", "DNS_RETENTION_DAYS", DEFAULT_DNS_RETENTION_DAYS)
            .await;
        (general, dns)
    }

    async fn resolve_retention(&self, key: &str, env_var: &str, default: i64) -> RetentionSetting {
        if let Ok(Some(days)) = self.get_config::<i64>(key).await {
            return RetentionSetting { days, source: "ui" };
        }
        if let Ok(raw) = std::env::var(env_var) {
            match raw.parse::<i64>() {
                Ok(days) => return RetentionSetting { days, source: "env" },
                Err(_) => warn!("Invalid {env_var} env value: {raw:?}, using default"),
            }
        }
        RetentionSetting { days: default, source: "default" }
    }

    pub async fn count_logs(&self, log_type: Option<&str>) -> Result<i64> {
        let (count,): (i64,) = match log_type {
            Some(lt) => sqlx::query_as("SELECT COUNT(*) FROM logs WHERE log_type = $1")
                .bind(lt)
                .fetch_one(self.pool())
                .await,
            None => sqlx::query_as("SELECT COUNT(*) FROM logs").fetch_one(self.pool()).await,
        }
        .map_err(|e| Error::Store(format!("Failed to count logs: {e}")))?;
        Ok(count)
    }

    /// Total rows plus oldest/latest origin timestamps, for health.
    pub async fn log_bounds(&self) -> Result<(i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        sqlx::query_as("SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM logs")
            .fetch_one(self.pool())
            .await
            .map_err(|e| Error::Store(format!("Failed to read log bounds: {e}")))
    }

    /// Per-type counts for the last hour, for the periodic stats line.
    pub async fn hourly_breakdown(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as(
            "SELECT log_type, COUNT(*) FROM logs
             WHERE timestamp > NOW() - INTERVAL '1 hour'
             GROUP BY log_type ORDER BY count DESC",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to read hourly stats: {e}")))
    }

    // ── Direction backfill ────────────────────────────────────────────

    /// Firewall rows after the id cursor, oldest first.
    pub async fn firewall_rows_after(
        &self,
        last_id: i64,
        limit: i64,
    ) -> Result<Vec<FirewallDirectionRow>> {
        sqlx::query_as(
            "SELECT id, interface_in, interface_out, rule_name,
                    host(src_ip) AS src_ip, host(dst_ip) AS dst_ip
             FROM logs
             WHERE log_type = 'firewall' AND id > $1
             ORDER BY id
             LIMIT $2",
        )
        .bind(last_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to fetch firewall rows: {e}")))
    }

    /// Batch-update direction values by id.
    pub async fn update_directions(&self, updates: &[(i64, Option<String>)]) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = updates.iter().map(|(id, _)| *id).collect();
        let directions: Vec<Option<String>> = updates.iter().map(|(_, d)| d.clone()).collect();
        let affected = sqlx::query(
            "UPDATE logs SET direction = v.direction
             FROM (SELECT unnest($1::bigint[]) AS id, unnest($2::text[]) AS direction) v
             WHERE logs.id = v.id",
        )
        .bind(&ids)
        .bind(&directions)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to update directions: {e}")))?
        .rows_affected();
        Ok(affected)
    }

    // ── WAN self-enrichment repair ────────────────────────────────────

    /// Firewall rows whose src is one of our WAN IPs yet carry geo data:
    /// they were enriched against ourselves instead of the remote party.
    pub async fn wan_enriched_rows_after(
        &self,
        wan_ips: &[String],
        last_id: i64,
        limit: i64,
    ) -> Result<Vec<WanEnrichedRow>> {
        sqlx::query_as(
            "SELECT id, host(dst_ip) AS dst_ip
             FROM logs
             WHERE log_type = 'firewall'
               AND src_ip = ANY($1::inet[])
               AND geo_country IS NOT NULL
               AND dst_ip IS NOT NULL
               AND id > $2
             ORDER BY id
             LIMIT $3",
        )
        .bind(wan_ips)
        .bind(last_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to fetch WAN-enriched rows: {e}")))
    }

    /// Replace geo/rDNS fields and null all threat/abuse columns so the
    /// cache patch can re-fill them from the correct IP.
    pub async fn rewrite_enrichment(&self, updates: &[EnrichmentRewrite]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Store(format!("Failed to open transaction: {e}")))?;
        for u in updates {
            sqlx::query(
                "UPDATE logs SET
                     geo_country = $1, geo_city = $2, geo_lat = $3, geo_lon = $4,
                     asn_number = $5, asn_name = $6, rdns = $7,
                     threat_score = NULL, threat_categories = NULL,
                     abuse_usage_type = NULL, abuse_hostnames = NULL,
                     abuse_total_reports = NULL, abuse_last_reported = NULL,
                     abuse_is_whitelisted = NULL, abuse_is_tor = NULL
                 WHERE id = $8",
            )
            .bind(&u.geo_country)
            .bind(&u.geo_city)
            .bind(u.geo_lat)
            .bind(u.geo_lon)
            .bind(u.asn_number)
            .bind(&u.asn_name)
            .bind(&u.rdns)
            .bind(u.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Store(format!("Failed to rewrite enrichment: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::Store(format!("Failed to commit enrichment rewrite: {e}")))
    }

    // ── Abuse-field contamination repair ──────────────────────────────

    /// Inbound rows addressed to one of our WAN IPs that carry abuse
    /// fields: the manual-enrich path once wrote the WAN IP's own abuse
    /// data onto them.
    pub async fn contaminated_abuse_rows_after(
        &self,
        wan_ips: &[String],
        excluded: &[String],
        last_id: i64,
        limit: i64,
    ) -> Result<Vec<ContaminatedAbuseRow>> {
        sqlx::query_as(
            "SELECT id, host(src_ip) AS src_ip
             FROM logs
             WHERE dst_ip = ANY($1::inet[])
               AND direction IN ('inbound', 'in')
               AND src_ip != ALL($2::inet[])
               AND (abuse_hostnames IS NOT NULL OR abuse_usage_type IS NOT NULL)
               AND id > $3
             ORDER BY id
             LIMIT $4",
        )
        .bind(wan_ips)
        .bind(excluded)
        .bind(last_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to fetch contaminated rows: {e}")))
    }

    /// Write the remote party's cached entry onto each row, or null the
    /// threat fields when no entry exists (no data beats wrong data).
    pub async fn apply_threat_entries(
        &self,
        updates: &[(i64, Option<ThreatEntry>)],
    ) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Store(format!("Failed to open transaction: {e}")))?;
        for (id, entry) in updates {
            match entry {
                Some(t) => {
                    sqlx::query(
                        "UPDATE logs SET
                             threat_score = $1, threat_categories = $2,
                             abuse_usage_type = $3, abuse_hostnames = $4,
                             abuse_total_reports = $5, abuse_last_reported = $6,
                             abuse_is_whitelisted = $7, abuse_is_tor = $8
                         WHERE id = $9",
                    )
                    .bind(t.threat_score)
                    .bind(&t.threat_categories)
                    .bind(&t.abuse_usage_type)
                    .bind(&t.abuse_hostnames)
                    .bind(t.abuse_total_reports)
                    .bind(t.abuse_last_reported)
                    .bind(t.abuse_is_whitelisted)
                    .bind(t.abuse_is_tor)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                }
                None => {
                    sqlx::query(
                        "UPDATE logs SET
                             threat_score = NULL, threat_categories = NULL,
                             abuse_usage_type = NULL, abuse_hostnames = NULL,
                             abuse_total_reports = NULL, abuse_last_reported = NULL,
                             abuse_is_whitelisted = NULL, abuse_is_tor = NULL
                         WHERE id = $1",
                    )
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                }
            }
            .map_err(|e| Error::Store(format!("Failed to apply threat entry: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::Store(format!("Failed to commit threat repair: {e}")))
    }

    // ── Service-name backfill ─────────────────────────────────────────

    /// Fill `service_name` on historical firewall rows from the bundled
    /// catalog, in one UPDATE joined against unnested arrays.
    pub async fn patch_service_names(&self) -> Result<u64> {
        let (has_nulls,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                 SELECT 1 FROM logs
                 WHERE dst_port IS NOT NULL
                   AND service_name IS NULL
                   AND log_type = 'firewall'
                 LIMIT 1
             )",
        )
        .fetch_one(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to probe service-name gaps: {e}")))?;

        if !has_nulls {
            return Ok(0);
        }

        let mut ports: Vec<i32> = Vec::new();
        let mut protocols: Vec<String> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        for (port, proto, name) in gatewatch_catalog::mappings() {
            ports.push(i32::from(port));
            protocols.push(proto.to_string());
            names.push(name);
        }

        let patched = sqlx::query(
            "UPDATE logs SET service_name = v.service_name
             FROM (SELECT unnest($1::int[]) AS port,
                          unnest($2::text[]) AS protocol,
                          unnest($3::text[]) AS service_name) v
             WHERE logs.dst_port = v.port
               AND logs.protocol = v.protocol
               AND logs.service_name IS NULL
               AND logs.log_type = 'firewall'",
        )
        .bind(&ports)
        .bind(&protocols)
        .bind(&names)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Service-name backfill failed: {e}")))?
        .rows_affected();

        if patched > 0 {
            debug!("Service name backfill: patched {patched} historical firewall rows");
        }
        Ok(patched)
    }
}
