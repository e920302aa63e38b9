//! Reverse DNS (PTR) lookups with caching.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use moka::sync::Cache;
use tracing::{debug, warn};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);
const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const CACHE_CAPACITY: u64 = 100_000;

/// PTR lookups through the host resolver. Answers and failures are both
/// cached for 24 h so a noisy address costs one query a day either way.
pub struct RdnsEnricher {
    resolver: Option<TokioAsyncResolver>,
    cache: Cache<IpAddr, Option<String>>,
}

impl RdnsEnricher {
    pub fn new() -> Self {
        let resolver = match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, mut opts)) => {
                opts.timeout = LOOKUP_TIMEOUT;
                opts.attempts = 1;
                Some(TokioAsyncResolver::tokio(config, opts))
            }
            Err(e) => {
                warn!("Could not read system resolver config, rDNS disabled: {e}");
                None
            }
        };
        Self {
            resolver,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    /// Resolve the PTR name for an address, or `None` on any failure.
    pub async fn lookup(&self, ip: IpAddr) -> Option<String> {
        if let Some(cached) = self.cache.get(&ip) {
            return cached;
        }

        let resolver = self.resolver.as_ref()?;
        let result = match resolver.reverse_lookup(ip).await {
            Ok(response) => response
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!("rDNS lookup failed for {ip}: {e}");
                None
            }
        };

        self.cache.insert(ip, result.clone());
        result
    }

    pub fn cache_size(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for RdnsEnricher {
    fn default() -> Self {
        Self::new()
    }
}
