//! WAN and gateway address detection from accumulated firewall logs.
//!
//! These queries power the setup wizard and the periodic rediscovery job.
//! The WAN IP of an interface is taken as the statistical mode of the
//! globally-routable destination addresses seen on it: router-bound
//! traffic on an uplink overwhelmingly targets the uplink's own address.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::FromRow;
use tracing::{debug, info};

use gatewatch_core::vpn::VPN_INTERFACE_PREFIXES;
use gatewatch_core::{Error, Result};

use crate::Store;

/// One candidate uplink for the wizard's WAN step.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WanCandidate {
    pub interface: String,
    pub event_count: i64,
    pub wan_ip: Option<String>,
}

const GLOBAL_SCOPE_FILTER: &str = "dst_ip IS NOT NULL
    AND NOT (dst_ip << '10.0.0.0/8'::inet
          OR dst_ip << '172.16.0.0/12'::inet
          OR dst_ip << '192.168.0.0/16'::inet
          OR dst_ip << '127.0.0.0/8'::inet
          OR dst_ip << '0.0.0.0/8'::inet
          OR dst_ip << '169.254.0.0/16'::inet
          OR dst_ip << '224.0.0.0/4'::inet
          OR dst_ip << '240.0.0.0/4'::inet
          OR dst_ip << 'fe80::/10'::inet
          OR dst_ip << 'fc00::/7'::inet
          OR dst_ip << 'ff00::/8'::inet)";

fn vpn_prefix_exclusion() -> String {
    VPN_INTERFACE_PREFIXES
        .iter()
        .map(|prefix| format!("interface_in NOT LIKE '{prefix}%'"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl Store {
    /// Per non-bridge, non-VPN interface: event volume and the mode of the
    /// global-scope destination IPs, ordered by volume.
    pub async fn wan_ip_candidates(&self) -> Result<Vec<WanCandidate>> {
        let sql = format!(
            "SELECT interface_in AS interface,
                    COUNT(*) AS event_count,
                    MODE() WITHIN GROUP (ORDER BY host(dst_ip))
                        FILTER (WHERE {GLOBAL_SCOPE_FILTER}) AS wan_ip
             FROM logs
             WHERE log_type = 'firewall'
               AND interface_in IS NOT NULL
               AND interface_in NOT LIKE 'br%'
               AND {vpn_exclusion}
             GROUP BY interface_in
             ORDER BY event_count DESC
             LIMIT 20",
            vpn_exclusion = vpn_prefix_exclusion()
        );
        sqlx::query_as(&sql)
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::Store(format!("WAN candidate scan failed: {e}")))
    }

    /// Mode-of-destination WAN IP for each of the given interfaces.
    pub async fn wan_ips_by_interface(
        &self,
        interfaces: &[String],
    ) -> Result<HashMap<String, String>> {
        if interfaces.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT interface_in AS interface,
                    COUNT(*) AS event_count,
                    MODE() WITHIN GROUP (ORDER BY host(dst_ip))
                        FILTER (WHERE {GLOBAL_SCOPE_FILTER}) AS wan_ip
             FROM logs
             WHERE log_type = 'firewall'
               AND interface_in = ANY($1)
             GROUP BY interface_in"
        );
        let rows: Vec<WanCandidate> = sqlx::query_as(&sql)
            .bind(interfaces)
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::Store(format!("WAN-by-interface scan failed: {e}")))?;

        Ok(rows
            .into_iter()
            .filter_map(|c| c.wan_ip.map(|ip| (c.interface, ip)))
            .collect())
    }

    /// Refresh the `wan_ips`/`wan_ip` config keys.
    ///
    /// When the controller integration is active its `wan_ip_by_iface`
    /// mapping is authoritative; otherwise the list is recomputed from
    /// logs. Writes only when the result differs from what is stored.
    pub async fn detect_wan_ip(&self) -> Result<Vec<String>> {
        let wan_interfaces: Vec<String> =
            self.get_config_or("wan_interfaces", vec!["ppp0".to_string()]).await;

        let unifi_enabled = self.get_config_or("unifi_enabled", false).await;
        let by_iface: HashMap<String, String> =
            self.get_config_or("wan_ip_by_iface", HashMap::new()).await;

        let detected: Vec<String> = if unifi_enabled && !by_iface.is_empty() {
            wan_interfaces
                .iter()
                .filter_map(|iface| by_iface.get(iface).cloned())
                .collect()
        } else {
            let from_logs = self.wan_ips_by_interface(&wan_interfaces).await?;
            wan_interfaces
                .iter()
                .filter_map(|iface| from_logs.get(iface).cloned())
                .collect()
        };

        if detected.is_empty() {
            debug!("WAN IP detection found nothing yet");
            return Ok(detected);
        }

        let stored: Vec<String> = self.get_config_or("wan_ips", Vec::new()).await;
        if stored != detected {
            info!("Detected WAN IPs: {detected:?}");
            self.set_config("wan_ips", &detected).await?;
            self.set_config("wan_ip", &detected[0]).await?;
        }
        Ok(detected)
    }

    /// Extract the router's own per-VLAN addresses: private-scope
    /// destinations of rules following the `_LOCAL` naming convention.
    pub async fn detect_gateway_ips(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT host(dst_ip)
             FROM logs
             WHERE log_type = 'firewall'
               AND rule_name LIKE '%_LOCAL%'
               AND dst_ip IS NOT NULL
               AND (dst_ip << '10.0.0.0/8'::inet
                 OR dst_ip << '172.16.0.0/12'::inet
                 OR dst_ip << '192.168.0.0/16'::inet)
             ORDER BY 1",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Gateway IP scan failed: {e}")))?;

        let detected: Vec<String> = rows.into_iter().map(|(ip,)| ip).collect();
        if detected.is_empty() {
            return Ok(detected);
        }

        let stored: Vec<String> = self.get_config_or("gateway_ips", Vec::new()).await;
        if stored != detected {
            info!("Detected gateway IPs: {detected:?}");
            self.set_config("gateway_ips", &detected).await?;
        }
        Ok(detected)
    }
}
