//! MaxMind GeoLite2 lookups for City and ASN.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use maxminddb::{geoip2, Reader};
use tracing::{error, info, warn};

/// Default mount point for the GeoLite2 databases inside the container.
pub const DEFAULT_DB_DIR: &str = "/app/maxmind";
pub const CITY_DB: &str = "GeoLite2-City.mmdb";
pub const ASN_DB: &str = "GeoLite2-ASN.mmdb";

/// GeoIP + ASN fields for one address; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoFields {
    pub geo_country: Option<String>,
    pub geo_city: Option<String>,
    pub geo_lat: Option<f64>,
    pub geo_lon: Option<f64>,
    pub asn_number: Option<i64>,
    pub asn_name: Option<String>,
}

type MmdbReader = Reader<Vec<u8>>;

/// City + ASN readers, hot-swappable behind locks so `reload()` can bring
/// new databases online without a gap: the new readers go live before the
/// old ones are dropped.
pub struct GeoIpEnricher {
    db_dir: PathBuf,
    city: RwLock<Option<MmdbReader>>,
    asn: RwLock<Option<MmdbReader>>,
}

impl GeoIpEnricher {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        let db_dir = db_dir.into();
        let enricher = Self {
            db_dir,
            city: RwLock::new(None),
            asn: RwLock::new(None),
        };
        enricher.load_databases();
        enricher
    }

    fn open(path: &Path, label: &str) -> Option<MmdbReader> {
        if !path.exists() {
            warn!("{label} not found at {}", path.display());
            return None;
        }
        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("Loaded {label} database");
                Some(reader)
            }
            Err(e) => {
                error!("Failed to load {label}: {e}");
                None
            }
        }
    }

    fn load_databases(&self) {
        let city = Self::open(&self.db_dir.join(CITY_DB), "GeoLite2-City");
        let asn = Self::open(&self.db_dir.join(ASN_DB), "GeoLite2-ASN");
        *self.city.write().unwrap_or_else(|e| e.into_inner()) = city;
        *self.asn.write().unwrap_or_else(|e| e.into_inner()) = asn;
    }

    /// Re-open the databases from disk (after geoipupdate ran).
    pub fn reload(&self) {
        info!("Reloading MaxMind databases...");
        self.load_databases();
        info!("MaxMind databases reloaded");
    }

    pub fn city_loaded(&self) -> bool {
        self.city.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn asn_loaded(&self) -> bool {
        self.asn.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Look up geo + ASN data. Misses leave fields as `None`.
    pub fn lookup(&self, ip: IpAddr) -> GeoFields {
        let mut fields = GeoFields::default();

        if let Some(reader) = self.city.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if let Ok(city) = reader.lookup::<geoip2::City>(ip) {
                fields.geo_country = city
                    .country
                    .as_ref()
                    .and_then(|c| c.iso_code)
                    .map(str::to_string);
                fields.geo_city = city
                    .city
                    .as_ref()
                    .and_then(|c| c.names.as_ref())
                    .and_then(|names| names.get("en"))
                    .map(|name| name.to_string());
                if let Some(location) = city.location.as_ref() {
                    fields.geo_lat = location.latitude;
                    fields.geo_lon = location.longitude;
                }
            }
        }

        if let Some(reader) = self.asn.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if let Ok(asn) = reader.lookup::<geoip2::Asn>(ip) {
                fields.asn_number = asn.autonomous_system_number.map(i64::from);
                fields.asn_name = asn.autonomous_system_organization.map(str::to_string);
            }
        }

        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_databases_degrade_to_empty() {
        let enricher = GeoIpEnricher::new("/nonexistent/geoip");
        assert!(!enricher.city_loaded());
        assert!(!enricher.asn_loaded());
        let fields = enricher.lookup("8.8.8.8".parse().unwrap());
        assert_eq!(fields, GeoFields::default());
    }
}
