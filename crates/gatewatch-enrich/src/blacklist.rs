//! AbuseIPDB blacklist bulk import.
//!
//! The blacklist endpoint has its own quota, separate from per-IP checks.
//! A daily pull pre-seeds `ip_threats` so freshly blocked addresses score
//! instantly without burning check quota.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use gatewatch_core::Result;
use gatewatch_store::Store;

const BLACKLIST_URL: &str = "https://api.abuseipdb.com/api/v2/blacklist";
const CONFIDENCE_MINIMUM: u32 = 75;
const FETCH_LIMIT: u32 = 10_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct BlacklistResponse {
    #[serde(default)]
    data: Vec<BlacklistEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlacklistEntry {
    ip_address: Option<String>,
    #[serde(default = "default_score")]
    abuse_confidence_score: i32,
}

fn default_score() -> i32 {
    100
}

pub struct BlacklistFetcher {
    store: Store,
    api_key: String,
    pub enabled: bool,
    http: reqwest::Client,
}

impl BlacklistFetcher {
    pub fn new(store: Store) -> Self {
        let api_key = std::env::var("ABUSEIPDB_API_KEY").unwrap_or_default();
        Self {
            store,
            enabled: !api_key.is_empty(),
            api_key,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Pull the blacklist and upsert into `ip_threats`. Returns how many
    /// entries were stored.
    pub async fn fetch_and_store(&self) -> Result<usize> {
        if !self.enabled {
            warn!("Blacklist fetch skipped — no API key");
            return Ok(0);
        }

        let response = match self
            .http
            .get(BLACKLIST_URL)
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("confidenceMinimum", CONFIDENCE_MINIMUM.to_string()),
                ("limit", FETCH_LIMIT.to_string()),
            ])
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!("Blacklist fetch timed out");
                return Ok(0);
            }
            Err(e) => {
                warn!("Blacklist fetch error: {e}");
                return Ok(0);
            }
        };

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("Blacklist fetch rate limited (429)");
            return Ok(0);
        }
        if !response.status().is_success() {
            warn!("Blacklist fetch returned {}", response.status());
            return Ok(0);
        }

        let body: BlacklistResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Blacklist response decode failed: {e}");
                return Ok(0);
            }
        };

        if body.data.is_empty() {
            warn!("Blacklist returned empty data");
            return Ok(0);
        }

        let fetched = body.data.len();
        let entries: Vec<(String, i32)> = body
            .data
            .into_iter()
            .filter_map(|e| e.ip_address.map(|ip| (ip, e.abuse_confidence_score)))
            .collect();

        // WAN/gateway self-IPs are filtered by the store's bulk upsert
        let exclusions = self.store.exclusion_set().await?;
        let stored = self.store.bulk_upsert_threats(&entries, &exclusions).await?;
        info!("Blacklist: fetched {fetched} IPs, upserted {stored} into ip_threats");
        Ok(stored)
    }
}
