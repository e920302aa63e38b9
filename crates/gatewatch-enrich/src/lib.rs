//! Gatewatch enrichment engine
//!
//! Adds GeoIP/ASN, reverse DNS, and threat-intelligence data to parsed
//! log records. GeoIP and rDNS run for every remote address; the threat
//! client runs only for blocked firewall traffic and is gated by the
//! provider's rate limits.

pub mod blacklist;
pub mod geoip;
pub mod rdns;
pub mod threat;

use std::net::IpAddr;
use std::sync::RwLock;

use serde::Serialize;
use tracing::debug;

use gatewatch_core::net::{is_remote_ip, ExclusionSet};
use gatewatch_core::{LogRecord, LogType, Result, RuleAction};
use gatewatch_store::Store;

pub use blacklist::BlacklistFetcher;
pub use geoip::{GeoFields, GeoIpEnricher};
pub use rdns::RdnsEnricher;
pub use threat::ThreatClient;

/// Cache/enablement stats for the periodic log line and health endpoint.
#[derive(Debug, Serialize)]
pub struct EnrichStats {
    pub geoip_loaded: bool,
    pub asn_loaded: bool,
    pub threat_enabled: bool,
    pub threat_daily_usage: i64,
    pub threat_cache_size: u64,
    pub rdns_cache_size: u64,
}

/// Orchestrates all enrichment for one parsed record.
pub struct Enricher {
    pub geoip: GeoIpEnricher,
    pub rdns: RdnsEnricher,
    pub threat: ThreatClient,
    store: Store,
    exclusions: RwLock<ExclusionSet>,
}

impl Enricher {
    pub fn new(store: Store, geoip_dir: &str) -> Self {
        Self {
            geoip: GeoIpEnricher::new(geoip_dir),
            rdns: RdnsEnricher::new(),
            threat: ThreatClient::new(store.clone()),
            store,
            exclusions: RwLock::new(ExclusionSet::default()),
        }
    }

    /// Rebuild the WAN/gateway exclusion set from config and inject it
    /// into the threat client. Called on startup, on config reload, and at
    /// the top of each backfill cycle.
    pub async fn refresh_exclusions(&self) -> Result<()> {
        let exclusions = self.store.exclusion_set().await?;
        self.threat.set_exclusions(exclusions.clone());
        *self.exclusions.write().unwrap_or_else(|e| e.into_inner()) = exclusions;
        Ok(())
    }

    /// Register a WAN IP learned by the parser fallback path.
    pub fn exclude_ip(&self, ip: IpAddr) {
        let mut guard = self.exclusions.write().unwrap_or_else(|e| e.into_inner());
        let mut ips: Vec<IpAddr> = guard.iter().copied().collect();
        if !ips.contains(&ip) {
            debug!("Excluding learned WAN IP {ip} from enrichment");
            ips.push(ip);
            let updated = ExclusionSet::new(ips);
            self.threat.set_exclusions(updated.clone());
            *guard = updated;
        }
    }

    pub fn exclusions(&self) -> ExclusionSet {
        self.exclusions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// True when the address is worth enriching: publicly routable and
    /// not one of this installation's own WAN/gateway addresses.
    pub fn is_remote(&self, ip: IpAddr) -> bool {
        let exclusions = self.exclusions.read().unwrap_or_else(|e| e.into_inner());
        is_remote_ip(ip, &exclusions)
    }

    /// Which address of the pair to enrich: src if remote, else dst if
    /// remote, else none.
    pub fn pick_remote_ip(&self, src: Option<IpAddr>, dst: Option<IpAddr>) -> Option<IpAddr> {
        src.filter(|ip| self.is_remote(*ip))
            .or_else(|| dst.filter(|ip| self.is_remote(*ip)))
    }

    /// Enrich a parsed record in place.
    pub async fn enrich(&self, record: &mut LogRecord) {
        let Some(ip) = self.pick_remote_ip(record.src_ip, record.dst_ip) else {
            return;
        };

        // GeoIP + ASN: local lookups, always run
        let geo = self.geoip.lookup(ip);
        record.geo_country = geo.geo_country;
        record.geo_city = geo.geo_city;
        record.geo_lat = geo.geo_lat;
        record.geo_lon = geo.geo_lon;
        record.asn_number = geo.asn_number;
        record.asn_name = geo.asn_name;

        record.rdns = self.rdns.lookup(ip).await;

        // Threat intel only for blocked firewall traffic
        if record.log_type == LogType::Firewall && record.rule_action == Some(RuleAction::Block) {
            if let Some(entry) = self.threat.lookup(&ip.to_string()).await {
                entry.apply_to(record);
            }
        }
    }

    /// Re-open the GeoIP databases (SIGUSR1 path).
    pub fn reload_geoip(&self) {
        self.geoip.reload();
    }

    pub fn stats(&self) -> EnrichStats {
        EnrichStats {
            geoip_loaded: self.geoip.city_loaded(),
            asn_loaded: self.geoip.asn_loaded(),
            threat_enabled: self.threat.enabled,
            threat_daily_usage: self.threat.daily_usage(),
            threat_cache_size: self.threat.cache_size(),
            rdns_cache_size: self.rdns.cache_size(),
        }
    }
}
