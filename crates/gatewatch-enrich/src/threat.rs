//! AbuseIPDB threat lookups with a two-tier cache and header-driven rate
//! limiting.
//!
//! Lookup order: in-memory cache (24 h) → persistent `ip_threats` cache
//! (4 days) → remote API, gated on the provider's own rate-limit headers.
//! The provider is the single source of truth: limit/remaining/reset come
//! back on every response and a 429 carries the pause duration.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Deserialize;
use tracing::{debug, info, warn};

use gatewatch_core::net::ExclusionSet;
use gatewatch_core::{RateLimitSnapshot, ThreatEntry};
use gatewatch_store::Store;

const API_URL: &str = "https://api.abuseipdb.com/api/v2/check";

/// Shared RAM-backed stats file, read directly by the HTTP API process.
pub const STATS_FILE: &str = "/tmp/abuseipdb_stats.json";

/// Config key mirroring the stats file, durable across restarts.
pub const RATE_LIMIT_CONFIG_KEY: &str = "abuseipdb_rate_limit";

/// Reserve held back from the provider's remaining quota. Zero: the only
/// reserve is the provider's own daily reset.
pub const SAFETY_BUFFER: i64 = 0;

/// Persistent-cache freshness window.
pub const STALE_DAYS: i32 = 4;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_TTL: Duration = Duration::from_secs(24 * 3600);
const PAUSE_FALLBACK_SECS: i64 = 3600;

/// Rate-limit state machine. Three states:
/// - unknown: `remaining` is None (bootstrap or just past a reset) — allow
///   calls so the next response re-teaches us the numbers;
/// - known: gate on `remaining > SAFETY_BUFFER`;
/// - paused: `paused_until` in the future (entered on 429) — gate closed.
#[derive(Debug, Default, Clone)]
struct RateLimitState {
    limit: Option<i64>,
    remaining: Option<i64>,
    reset_at: Option<i64>,
    paused_until: Option<i64>,
}

impl RateLimitState {
    /// May we call the API right now? Mutates state when a stored reset
    /// time has passed (quota renewed → back to unknown).
    fn allow(&mut self, now: i64) -> bool {
        if let Some(paused_until) = self.paused_until {
            if now < paused_until {
                return false;
            }
        }

        if let Some(reset_at) = self.reset_at {
            if now > reset_at {
                info!("AbuseIPDB quota reset (reset_at {reset_at} has passed)");
                self.remaining = None;
                self.reset_at = None;
                self.paused_until = None;
            }
        }

        match self.remaining {
            // Unknown: one call to re-learn the headers
            None => true,
            Some(remaining) => remaining > SAFETY_BUFFER,
        }
    }

    fn budget(&self) -> i64 {
        match self.remaining {
            // Unknown — don't let bulk consumers guess
            None => 0,
            Some(remaining) => (remaining - SAFETY_BUFFER).max(0),
        }
    }

    fn snapshot(&self, now: i64) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
            paused_until: self.paused_until.filter(|p| *p > now),
            updated_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    data: CheckData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckData {
    #[serde(default)]
    abuse_confidence_score: i32,
    usage_type: Option<String>,
    #[serde(default)]
    hostnames: Vec<String>,
    total_reports: Option<i32>,
    last_reported_at: Option<String>,
    is_whitelisted: Option<bool>,
    is_tor: Option<bool>,
    #[serde(default)]
    reports: Vec<CheckReport>,
}

#[derive(Debug, Deserialize)]
struct CheckReport {
    #[serde(default)]
    categories: Vec<i64>,
}

impl CheckData {
    fn into_entry(self) -> ThreatEntry {
        // Aggregate categories from every report into a sorted, deduplicated set
        let mut categories: Vec<String> = self
            .reports
            .iter()
            .flat_map(|r| r.categories.iter().map(|c| c.to_string()))
            .collect();
        categories.sort();
        categories.dedup();

        ThreatEntry {
            threat_score: self.abuse_confidence_score,
            threat_categories: categories,
            abuse_usage_type: self.usage_type.filter(|s| !s.is_empty()),
            abuse_hostnames: if self.hostnames.is_empty() {
                None
            } else {
                Some(self.hostnames.join(", "))
            },
            abuse_total_reports: self.total_reports,
            abuse_last_reported: self
                .last_reported_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            abuse_is_whitelisted: self.is_whitelisted.filter(|v| *v),
            abuse_is_tor: self.is_tor.filter(|v| *v),
        }
    }
}

pub struct ThreatClient {
    api_key: String,
    pub enabled: bool,
    store: Store,
    http: reqwest::Client,
    cache: Cache<String, ThreatEntry>,
    state: Mutex<RateLimitState>,
    exclusions: Mutex<ExclusionSet>,
}

impl ThreatClient {
    pub fn new(store: Store) -> Self {
        let api_key = std::env::var("ABUSEIPDB_API_KEY").unwrap_or_default();
        let enabled = !api_key.is_empty();
        if enabled {
            info!("AbuseIPDB enrichment enabled (safety buffer: {SAFETY_BUFFER})");
        } else {
            warn!("AbuseIPDB API key not set — threat enrichment disabled");
        }

        Self {
            api_key,
            enabled,
            store,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            cache: Cache::builder().time_to_live(MEMORY_TTL).build(),
            state: Mutex::new(RateLimitState::default()),
            exclusions: Mutex::new(ExclusionSet::default()),
        }
    }

    /// Replace the WAN/gateway exclusion set; called at the top of every
    /// enrichment pass and after config reloads.
    pub fn set_exclusions(&self, exclusions: ExclusionSet) {
        *self.exclusions.lock().unwrap_or_else(|e| e.into_inner()) = exclusions;
    }

    fn is_excluded(&self, ip: &str) -> bool {
        self.exclusions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_str(ip)
    }

    /// API calls still available this period. Zero when unknown.
    pub fn remaining_budget(&self) -> i64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).budget()
    }

    /// limit − remaining, when both are known.
    pub fn daily_usage(&self) -> i64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match (state.limit, state.remaining) {
            (Some(limit), Some(remaining)) => limit - remaining,
            _ => 0,
        }
    }

    pub fn cache_size(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Drop an IP from the in-memory tier (the persistent tier is expired
    /// separately by backdating `looked_up_at`).
    pub fn invalidate(&self, ip: &str) {
        self.cache.invalidate(&ip.to_string());
    }

    /// Look up an IP. Empty result means: excluded, gated, or the service
    /// failed — the caller persists null threat fields and the backfill
    /// worker retries later.
    pub async fn lookup(&self, ip: &str) -> Option<ThreatEntry> {
        if !self.enabled || self.is_excluded(ip) {
            return None;
        }

        if let Some(cached) = self.cache.get(ip) {
            return Some(cached);
        }

        match self.store.get_threat(ip, STALE_DAYS).await {
            Ok(Some(entry)) => {
                // Promote to the memory tier
                self.cache.insert(ip.to_string(), entry.clone());
                return Some(entry);
            }
            Ok(None) => {}
            Err(e) => debug!("DB threat cache lookup failed for {ip}: {e}"),
        }

        let allowed = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allow(Utc::now().timestamp());
        if !allowed {
            return None;
        }

        self.fetch_remote(ip).await
    }

    async fn fetch_remote(&self, ip: &str) -> Option<ThreatEntry> {
        let response = self
            .http
            .get(API_URL)
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("ipAddress", ip), ("maxAgeInDays", "90"), ("verbose", "true")])
            .send()
            .await;

        let response = match response {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!("AbuseIPDB timeout for {ip}");
                return None;
            }
            Err(e) => {
                warn!("AbuseIPDB error for {ip}: {e}");
                return None;
            }
        };

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.enter_pause(&response);
            self.write_stats().await;
            return None;
        }

        if !response.status().is_success() {
            warn!("AbuseIPDB returned {} for {ip}", response.status());
            return None;
        }

        self.update_rate_limits(response.headers());

        let body: CheckResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("AbuseIPDB response decode failed for {ip}: {e}");
                return None;
            }
        };
        let entry = body.data.into_entry();

        let exclusions = self
            .exclusions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Err(e) = self.store.upsert_threat(ip, &entry, &exclusions).await {
            debug!("DB threat cache write failed for {ip}: {e}");
        }

        self.write_stats().await;
        self.cache.insert(ip.to_string(), entry.clone());
        Some(entry)
    }

    fn enter_pause(&self, response: &reqwest::Response) {
        let now = Utc::now().timestamp();
        let headers = response.headers();
        let header_i64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
        };

        let paused_until = if let Some(retry_after) = header_i64("Retry-After") {
            now + retry_after
        } else if let Some(reset) = header_i64("X-RateLimit-Reset") {
            reset
        } else {
            now + PAUSE_FALLBACK_SECS
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.paused_until = Some(paused_until);
        state.remaining = Some(0);
        drop(state);

        warn!(
            "AbuseIPDB 429 — paused until {}",
            DateTime::from_timestamp(paused_until, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| paused_until.to_string())
        );
    }

    fn update_rate_limits(&self, headers: &reqwest::header::HeaderMap) {
        let header_i64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(limit) = header_i64("X-RateLimit-Limit") {
            state.limit = Some(limit);
        }
        if let Some(remaining) = header_i64("X-RateLimit-Remaining") {
            state.remaining = Some(remaining);
        }
        if let Some(reset) = header_i64("X-RateLimit-Reset") {
            state.reset_at = Some(reset);
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot(Utc::now().timestamp())
    }

    /// Serialise rate-limit state to the shared stats file (fast path for
    /// the API process) and to the config store (survives restarts).
    pub async fn write_stats(&self) {
        let snapshot = self.snapshot();

        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(STATS_FILE, bytes) {
                    debug!("Failed to write rate-limit stats file: {e}");
                }
            }
            Err(e) => debug!("Failed to serialise rate-limit stats: {e}"),
        }

        if let Err(e) = self.store.set_config(RATE_LIMIT_CONFIG_KEY, &snapshot).await {
            debug!("Failed to mirror rate-limit stats to config: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_state_allows_bootstrap() {
        let mut state = RateLimitState::default();
        assert!(state.allow(1_000));
        assert_eq!(state.budget(), 0);
    }

    #[test]
    fn test_known_state_gates_on_remaining() {
        let mut state = RateLimitState {
            limit: Some(1000),
            remaining: Some(5),
            reset_at: Some(10_000),
            paused_until: None,
        };
        assert!(state.allow(1_000));
        assert_eq!(state.budget(), 5);

        state.remaining = Some(0);
        assert!(!state.allow(1_000));
        assert_eq!(state.budget(), 0);
    }

    #[test]
    fn test_pause_closes_gate() {
        let mut state = RateLimitState {
            limit: Some(1000),
            remaining: Some(0),
            reset_at: Some(2_000),
            paused_until: Some(1_600),
        };
        assert!(!state.allow(1_000));
    }

    #[test]
    fn test_reset_in_past_returns_to_unknown() {
        let mut state = RateLimitState {
            limit: Some(1000),
            remaining: Some(0),
            reset_at: Some(2_000),
            paused_until: None,
        };
        // reset_at exactly now: still exhausted
        assert!(!state.allow(2_000));
        // one second later: quota renewed, back to unknown, gate open
        assert!(state.allow(2_001));
        assert_eq!(state.remaining, None);
        assert_eq!(state.reset_at, None);
    }

    #[test]
    fn test_snapshot_drops_expired_pause() {
        let state = RateLimitState {
            limit: Some(1000),
            remaining: Some(10),
            reset_at: Some(9_000),
            paused_until: Some(500),
        };
        let snap = state.snapshot(1_000);
        assert_eq!(snap.paused_until, None);
        assert_eq!(snap.remaining, Some(10));
    }

    #[test]
    fn test_category_aggregation() {
        let data = CheckData {
            abuse_confidence_score: 80,
            usage_type: Some("Data Center/Web Hosting/Transit".into()),
            hostnames: vec!["a.example".into(), "b.example".into()],
            total_reports: Some(42),
            last_reported_at: Some("2026-07-01T10:00:00+00:00".into()),
            is_whitelisted: Some(false),
            is_tor: Some(true),
            reports: vec![
                CheckReport { categories: vec![18, 14] },
                CheckReport { categories: vec![14, 22] },
            ],
        };
        let entry = data.into_entry();
        assert_eq!(entry.threat_score, 80);
        assert_eq!(entry.threat_categories, vec!["14", "18", "22"]);
        assert_eq!(entry.abuse_hostnames.as_deref(), Some("a.example, b.example"));
        // false flags collapse to None; only true is recorded
        assert_eq!(entry.abuse_is_whitelisted, None);
        assert_eq!(entry.abuse_is_tor, Some(true));
        assert!(entry.abuse_last_reported.is_some());
    }
}
