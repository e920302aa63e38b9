//! `ip_threats` cache operations.
//!
//! Every write path rejects the installation's own WAN and gateway
//! addresses: a record about us must never carry a remote party's threat
//! data, and vice versa.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::{debug, info};

use gatewatch_core::net::{normalize_ip, ExclusionSet};
use gatewatch_core::{Error, Result, ThreatEntry};

use crate::Store;

#[derive(Debug, FromRow)]
struct ThreatRow {
    threat_score: i32,
    threat_categories: Option<Vec<String>>,
    abuse_usage_type: Option<String>,
    abuse_hostnames: Option<String>,
    abuse_total_reports: Option<i32>,
    abuse_last_reported: Option<DateTime<Utc>>,
    abuse_is_whitelisted: Option<bool>,
    abuse_is_tor: Option<bool>,
}

impl From<ThreatRow> for ThreatEntry {
    fn from(row: ThreatRow) -> Self {
        ThreatEntry {
            threat_score: row.threat_score,
            threat_categories: row.threat_categories.unwrap_or_default(),
            abuse_usage_type: row.abuse_usage_type,
            abuse_hostnames: row.abuse_hostnames,
            abuse_total_reports: row.abuse_total_reports,
            abuse_last_reported: row.abuse_last_reported,
            abuse_is_whitelisted: row.abuse_is_whitelisted,
            abuse_is_tor: row.abuse_is_tor,
        }
    }
}

impl Store {
    /// Cached entry for an IP, or `None` when absent or older than the
    /// freshness window.
    pub async fn get_threat(&self, ip: &str, max_age_days: i32) -> Result<Option<ThreatEntry>> {
        let row: Option<ThreatRow> = sqlx::query_as(
            "SELECT threat_score, threat_categories,
                    abuse_usage_type, abuse_hostnames, abuse_total_reports,
                    abuse_last_reported, abuse_is_whitelisted, abuse_is_tor
             FROM ip_threats
             WHERE ip = $1::inet
               AND looked_up_at > NOW() - make_interval(days => $2)",
        )
        .bind(normalize_ip(ip))
        .bind(max_age_days)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Threat cache read failed for {ip}: {e}")))?;

        Ok(row.map(ThreatEntry::from))
    }

    /// Bulk fetch of cached entries, keyed by bare IP text.
    pub async fn get_threats(
        &self,
        ips: &[String],
    ) -> Result<std::collections::HashMap<String, ThreatEntry>> {
        #[derive(FromRow)]
        struct KeyedRow {
            ip_text: String,
            #[sqlx(flatten)]
            row: ThreatRow,
        }

        let rows: Vec<KeyedRow> = sqlx::query_as(
            "SELECT host(ip) AS ip_text, threat_score, threat_categories,
                    abuse_usage_type, abuse_hostnames, abuse_total_reports,
                    abuse_last_reported, abuse_is_whitelisted, abuse_is_tor
             FROM ip_threats WHERE ip = ANY($1::inet[])",
        )
        .bind(ips)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Threat cache bulk read failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| (r.ip_text, ThreatEntry::from(r.row)))
            .collect())
    }

    /// Upsert one entry. COALESCE preserves prior non-null detail fields
    /// when the incoming entry lacks them; `looked_up_at` always refreshes.
    /// Returns false (and writes nothing) for excluded IPs.
    pub async fn upsert_threat(
        &self,
        ip: &str,
        entry: &ThreatEntry,
        exclusions: &ExclusionSet,
    ) -> Result<bool> {
        let normalized = normalize_ip(ip);
        if exclusions.contains_str(&normalized) {
            debug!("Refusing to cache threat data for own IP {normalized}");
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO ip_threats
                 (ip, threat_score, threat_categories,
                  abuse_usage_type, abuse_hostnames, abuse_total_reports,
                  abuse_last_reported, abuse_is_whitelisted, abuse_is_tor, looked_up_at)
             VALUES ($1::inet, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
             ON CONFLICT (ip) DO UPDATE SET
                 threat_score = EXCLUDED.threat_score,
                 threat_categories = EXCLUDED.threat_categories,
                 abuse_usage_type = COALESCE(EXCLUDED.abuse_usage_type, ip_threats.abuse_usage_type),
                 abuse_hostnames = COALESCE(EXCLUDED.abuse_hostnames, ip_threats.abuse_hostnames),
                 abuse_total_reports = COALESCE(EXCLUDED.abuse_total_reports, ip_threats.abuse_total_reports),
                 abuse_last_reported = COALESCE(EXCLUDED.abuse_last_reported, ip_threats.abuse_last_reported),
                 abuse_is_whitelisted = COALESCE(EXCLUDED.abuse_is_whitelisted, ip_threats.abuse_is_whitelisted),
                 abuse_is_tor = COALESCE(EXCLUDED.abuse_is_tor, ip_threats.abuse_is_tor),
                 looked_up_at = NOW()",
        )
        .bind(&normalized)
        .bind(entry.threat_score)
        .bind(&entry.threat_categories)
        .bind(&entry.abuse_usage_type)
        .bind(&entry.abuse_hostnames)
        .bind(entry.abuse_total_reports)
        .bind(entry.abuse_last_reported)
        .bind(entry.abuse_is_whitelisted)
        .bind(entry.abuse_is_tor)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Threat cache write failed for {normalized}: {e}")))?;

        Ok(true)
    }

    /// Blacklist-style bulk upsert: `(ip, score)` pairs with a single
    /// "blacklist" category. Merging keeps the higher score and the richer
    /// category array (API lookups can carry many categories, imports one).
    pub async fn bulk_upsert_threats(
        &self,
        entries: &[(String, i32)],
        exclusions: &ExclusionSet,
    ) -> Result<usize> {
        let kept: Vec<&(String, i32)> = entries
            .iter()
            .filter(|(ip, _)| !exclusions.contains_str(&normalize_ip(ip)))
            .collect();
        let filtered = entries.len() - kept.len();
        if filtered > 0 {
            info!("Blacklist: filtered {filtered} WAN/gateway IPs from import");
        }
        if kept.is_empty() {
            return Ok(0);
        }

        let ips: Vec<String> = kept.iter().map(|(ip, _)| normalize_ip(ip)).collect();
        let scores: Vec<i32> = kept.iter().map(|(_, score)| *score).collect();

        sqlx::query(
            "INSERT INTO ip_threats (ip, threat_score, threat_categories, looked_up_at)
             SELECT ip::inet, score, ARRAY['blacklist'], NOW()
             FROM unnest($1::text[], $2::int[]) AS v(ip, score)
             ON CONFLICT (ip) DO UPDATE SET
                 threat_score = GREATEST(ip_threats.threat_score, EXCLUDED.threat_score),
                 threat_categories = CASE
                     WHEN COALESCE(array_length(ip_threats.threat_categories, 1), 0)
                          >= COALESCE(array_length(EXCLUDED.threat_categories, 1), 0)
                     THEN ip_threats.threat_categories
                     ELSE EXCLUDED.threat_categories
                 END,
                 looked_up_at = NOW()",
        )
        .bind(&ips)
        .bind(&scores)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Blacklist bulk upsert failed: {e}")))?;

        Ok(kept.len())
    }

    /// Backdate `looked_up_at` so the next lookup treats the entry as
    /// expired and goes to the remote API.
    pub async fn expire_threats(&self, ips: &[String]) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE ip_threats
             SET looked_up_at = NOW() - INTERVAL '30 days'
             WHERE ip = ANY($1::inet[])",
        )
        .bind(ips)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to expire threat entries: {e}")))?
        .rows_affected();
        Ok(affected)
    }

    pub async fn delete_threats(&self, ips: &[String]) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM ip_threats WHERE ip = ANY($1::inet[])")
            .bind(ips)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Store(format!("Failed to delete threat entries: {e}")))?
            .rows_affected();
        Ok(affected)
    }

    /// Pass 1/2 of the null-score patch: copy scores and missing detail
    /// fields from the cache onto blocked firewall rows whose score is
    /// still null. WAN IPs are excluded on both sides of the join.
    pub async fn patch_null_scores(&self, wan_ips: &[String]) -> Result<u64> {
        let mut patched = 0u64;
        for ip_column in ["src_ip", "dst_ip"] {
            patched += sqlx::query(&format!(
                "UPDATE logs
                 SET threat_score = t.threat_score,
                     threat_categories = t.threat_categories,
                     abuse_usage_type = COALESCE(logs.abuse_usage_type, t.abuse_usage_type),
                     abuse_hostnames = COALESCE(logs.abuse_hostnames, t.abuse_hostnames),
                     abuse_total_reports = COALESCE(logs.abuse_total_reports, t.abuse_total_reports),
                     abuse_last_reported = COALESCE(logs.abuse_last_reported, t.abuse_last_reported),
                     abuse_is_whitelisted = COALESCE(logs.abuse_is_whitelisted, t.abuse_is_whitelisted),
                     abuse_is_tor = COALESCE(logs.abuse_is_tor, t.abuse_is_tor)
                 FROM ip_threats t
                 WHERE logs.{ip_column} = t.ip
                   AND NOT (logs.{ip_column} = ANY($1::inet[]))
                   AND logs.threat_score IS NULL
                   AND logs.log_type = 'firewall'
                   AND logs.rule_action = 'block'"
            ))
            .bind(wan_ips)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Store(format!("Null-score patch failed: {e}")))?
            .rows_affected();
        }
        Ok(patched)
    }

    /// Pass 1/2 of the detail patch: rows that already carry a score but
    /// no detail fields get them overwritten from cache entries that have
    /// them. Categories only replace an empty array.
    pub async fn patch_abuse_details(&self, wan_ips: &[String]) -> Result<u64> {
        let mut patched = 0u64;
        for ip_column in ["src_ip", "dst_ip"] {
            patched += sqlx::query(&format!(
                "UPDATE logs
                 SET abuse_usage_type = t.abuse_usage_type,
                     abuse_hostnames = t.abuse_hostnames,
                     abuse_total_reports = t.abuse_total_reports,
                     abuse_last_reported = t.abuse_last_reported,
                     abuse_is_whitelisted = t.abuse_is_whitelisted,
                     abuse_is_tor = t.abuse_is_tor,
                     threat_categories = CASE
                         WHEN t.threat_categories IS NOT NULL
                              AND array_length(t.threat_categories, 1) > 0
                              AND (logs.threat_categories IS NULL
                                   OR array_length(logs.threat_categories, 1) IS NULL
                                   OR array_length(logs.threat_categories, 1) = 0)
                         THEN t.threat_categories
                         ELSE logs.threat_categories
                     END
                 FROM ip_threats t
                 WHERE logs.{ip_column} = t.ip
                   AND NOT (logs.{ip_column} = ANY($1::inet[]))
                   AND logs.threat_score IS NOT NULL
                   AND logs.abuse_usage_type IS NULL
                   AND t.abuse_usage_type IS NOT NULL
                   AND logs.log_type = 'firewall'
                   AND logs.rule_action = 'block'"
            ))
            .bind(wan_ips)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Store(format!("Abuse-detail patch failed: {e}")))?
            .rows_affected();
        }
        Ok(patched)
    }

    /// Direction-aware patch of every blocked firewall row touching one
    /// IP, after a manual lookup refreshed its cache entry. Both passes
    /// exclude WAN/gateway IPs so only the remote side picks up the data.
    pub async fn patch_rows_for_ip(&self, ip: &str, excluded: &[String]) -> Result<u64> {
        let normalized = normalize_ip(ip);
        let mut patched = 0u64;
        for ip_column in ["src_ip", "dst_ip"] {
            patched += sqlx::query(&format!(
                "UPDATE logs
                 SET threat_score = COALESCE(t.threat_score, logs.threat_score),
                     abuse_usage_type = t.abuse_usage_type,
                     abuse_hostnames = t.abuse_hostnames,
                     abuse_total_reports = t.abuse_total_reports,
                     abuse_last_reported = t.abuse_last_reported,
                     abuse_is_whitelisted = t.abuse_is_whitelisted,
                     abuse_is_tor = t.abuse_is_tor,
                     threat_categories = COALESCE(
                         CASE WHEN array_length(t.threat_categories, 1) > 0
                              THEN t.threat_categories ELSE NULL END,
                         logs.threat_categories)
                 FROM ip_threats t
                 WHERE logs.{ip_column} = t.ip
                   AND t.ip = $1::inet
                   AND NOT (logs.{ip_column} = ANY($2::inet[]))
                   AND logs.log_type = 'firewall'
                   AND logs.rule_action = 'block'"
            ))
            .bind(&normalized)
            .bind(excluded)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Store(format!("Row patch for {normalized} failed: {e}")))?
            .rows_affected();
        }
        Ok(patched)
    }

    /// Distinct remote-candidate IPs on NULL-score blocked firewall rows
    /// with no cache entry at all. The caller filters for remote scope.
    pub async fn find_orphan_ips(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT host(ip) FROM (
                 SELECT l.src_ip AS ip
                 FROM logs l
                 LEFT JOIN ip_threats t ON l.src_ip = t.ip
                 WHERE l.threat_score IS NULL
                   AND l.log_type = 'firewall'
                   AND l.rule_action = 'block'
                   AND l.src_ip IS NOT NULL
                   AND t.ip IS NULL
                 UNION
                 SELECT l.dst_ip AS ip
                 FROM logs l
                 LEFT JOIN ip_threats t ON l.dst_ip = t.ip
                 WHERE l.threat_score IS NULL
                   AND l.log_type = 'firewall'
                   AND l.rule_action = 'block'
                   AND l.dst_ip IS NOT NULL
                   AND t.ip IS NULL
             ) sub",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Orphan IP scan failed: {e}")))?;
        Ok(rows.into_iter().map(|(ip,)| ip).collect())
    }

    /// Cache entries that carry a score but no detail fields and appear on
    /// recently seen blocked logs: the best candidates for re-enrichment.
    /// Two-stage selection: the 100 most recently seen, then the top N by
    /// score.
    pub async fn stale_threat_candidates(&self, limit: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT ip_str FROM (
                 SELECT host(t.ip) AS ip_str, t.threat_score,
                        MAX(l.timestamp) AS last_seen
                 FROM ip_threats t
                 JOIN logs l ON (l.src_ip = t.ip OR l.dst_ip = t.ip)
                 WHERE t.abuse_usage_type IS NULL
                   AND (t.threat_categories IS NULL
                        OR t.threat_categories = '{}'
                        OR t.threat_categories = '{\"blacklist\"}')
                   AND t.threat_score > 0
                   AND l.log_type = 'firewall'
                   AND l.rule_action = 'block'
                 GROUP BY t.ip, t.threat_score
                 ORDER BY last_seen DESC
                 LIMIT 100
             ) recent
             ORDER BY threat_score DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Stale threat scan failed: {e}")))?;
        Ok(rows.into_iter().map(|(ip,)| ip).collect())
    }
}
