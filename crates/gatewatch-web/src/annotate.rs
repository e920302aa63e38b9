//! Post-fetch row annotation: gateway VLAN metadata, WAN-IP labels, and
//! VPN badges derived from configured CIDRs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use gatewatch_core::Result;
use gatewatch_store::Store;

/// Log row as served by the list/export endpoints. IPs come back as bare
/// text via `host()`; device names are resolved by the LATERAL joins.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ApiLogRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub log_type: String,
    pub direction: Option<String>,
    pub src_ip: Option<String>,
    pub src_port: Option<i32>,
    pub dst_ip: Option<String>,
    pub dst_port: Option<i32>,
    pub protocol: Option<String>,
    pub service_name: Option<String>,
    pub rule_name: Option<String>,
    pub rule_desc: Option<String>,
    pub rule_action: Option<String>,
    pub interface_in: Option<String>,
    pub interface_out: Option<String>,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub dhcp_event: Option<String>,
    pub dns_query: Option<String>,
    pub dns_type: Option<String>,
    pub dns_answer: Option<String>,
    pub wifi_event: Option<String>,
    pub geo_country: Option<String>,
    pub geo_city: Option<String>,
    pub geo_lat: Option<f64>,
    pub geo_lon: Option<f64>,
    pub asn_number: Option<i64>,
    pub asn_name: Option<String>,
    pub rdns: Option<String>,
    pub threat_score: Option<i32>,
    pub threat_categories: Option<Vec<String>>,
    pub abuse_usage_type: Option<String>,
    pub abuse_hostnames: Option<String>,
    pub abuse_total_reports: Option<i32>,
    pub abuse_last_reported: Option<DateTime<Utc>>,
    pub abuse_is_whitelisted: Option<bool>,
    pub abuse_is_tor: Option<bool>,
    pub raw_log: String,
    pub src_device_name: Option<String>,
    pub dst_device_name: Option<String>,
}

/// Row plus the annotation columns.
#[derive(Debug, Serialize)]
pub struct AnnotatedLog {
    #[serde(flatten)]
    pub row: ApiLogRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_device_vlan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_device_vlan: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_vpn_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_vpn_network: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayVlan {
    pub vlan: Option<i64>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnNetworkEntry {
    #[serde(default)]
    pub cidr: String,
    #[serde(default)]
    pub badge: String,
    #[serde(default)]
    pub name: String,
}

/// Config-derived lookup tables, loaded once per request.
#[derive(Debug, Default)]
pub struct Annotator {
    gateway_vlans: HashMap<String, GatewayVlan>,
    wan_ip_names: HashMap<String, String>,
    vpn_networks: Vec<(IpNetwork, String)>,
}

impl Annotator {
    pub async fn load(store: &Store) -> Result<Self> {
        let gateway_vlans: HashMap<String, GatewayVlan> =
            store.get_config_or("gateway_ip_vlans", HashMap::new()).await;
        let wan_ip_names: HashMap<String, String> =
            store.get_config_or("wan_ip_names", HashMap::new()).await;
        let configured: HashMap<String, VpnNetworkEntry> =
            store.get_config_or("vpn_networks", HashMap::new()).await;

        let vpn_networks = configured
            .into_values()
            .filter_map(|entry| {
                let net: IpNetwork = entry.cidr.parse().ok()?;
                let label = if entry.badge.is_empty() { entry.name } else { entry.badge };
                (!label.is_empty()).then_some((net, label))
            })
            .collect();

        Ok(Self {
            gateway_vlans,
            wan_ip_names,
            vpn_networks,
        })
    }

    fn vpn_label(&self, ip: &str) -> Option<String> {
        let addr: std::net::IpAddr = ip.parse().ok()?;
        self.vpn_networks
            .iter()
            .find(|(net, _)| net.contains(addr))
            .map(|(_, label)| label.clone())
    }

    /// Fill device name, VLAN, and VPN-network columns for one side.
    /// Returns `(device_name, vlan, vpn_network)`.
    fn annotate_side(
        &self,
        ip: Option<&str>,
        device_name: Option<String>,
    ) -> (Option<String>, Option<i64>, Option<String>) {
        let Some(ip) = ip else {
            return (device_name, None, None);
        };

        if let Some(gateway) = self.gateway_vlans.get(ip) {
            let name = device_name.unwrap_or_else(|| "Gateway".to_string());
            return (Some(name), gateway.vlan, None);
        }
        if let Some(label) = self.wan_ip_names.get(ip) {
            return (Some(device_name.unwrap_or_else(|| label.clone())), None, None);
        }

        // Gateway/WAN addresses never get a VPN badge; anything else is
        // matched against the configured tunnel CIDRs.
        let vpn = self.vpn_label(ip);
        (device_name, None, vpn)
    }

    pub fn annotate(&self, row: ApiLogRow) -> AnnotatedLog {
        let (src_name, src_vlan, src_vpn) =
            self.annotate_side(row.src_ip.as_deref(), row.src_device_name.clone());
        let (dst_name, dst_vlan, dst_vpn) =
            self.annotate_side(row.dst_ip.as_deref(), row.dst_device_name.clone());

        let mut row = row;
        row.src_device_name = src_name;
        row.dst_device_name = dst_name;

        AnnotatedLog {
            row,
            src_device_vlan: src_vlan,
            dst_device_vlan: dst_vlan,
            src_vpn_network: src_vpn,
            dst_vpn_network: dst_vpn,
        }
    }

    /// Annotate the bare `{ip, count, device_name}` aggregates on the
    /// stats endpoint.
    pub fn annotate_ip_entry(&self, entry: &mut serde_json::Value) {
        let Some(ip) = entry.get("ip").and_then(serde_json::Value::as_str).map(str::to_string)
        else {
            return;
        };
        let has_name = entry
            .get("device_name")
            .and_then(serde_json::Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if has_name {
            return;
        }

        if let Some(gateway) = self.gateway_vlans.get(&ip) {
            entry["device_name"] = serde_json::json!("Gateway");
            entry["vlan"] = serde_json::json!(gateway.vlan);
        } else if let Some(label) = self.wan_ip_names.get(&ip) {
            entry["device_name"] = serde_json::json!(label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotator() -> Annotator {
        let mut gateway_vlans = HashMap::new();
        gateway_vlans.insert(
            "192.168.20.1".to_string(),
            GatewayVlan { vlan: Some(20), name: "IoT".to_string() },
        );
        let mut wan_ip_names = HashMap::new();
        wan_ip_names.insert("203.0.113.4".to_string(), "Dream Router".to_string());
        Annotator {
            gateway_vlans,
            wan_ip_names,
            vpn_networks: vec![(
                "10.10.50.0/24".parse().unwrap(),
                "WGD SRV".to_string(),
            )],
        }
    }

    #[test]
    fn test_gateway_side_gets_name_and_vlan() {
        let (name, vlan, vpn) = annotator().annotate_side(Some("192.168.20.1"), None);
        assert_eq!(name.as_deref(), Some("Gateway"));
        assert_eq!(vlan, Some(20));
        assert_eq!(vpn, None);
    }

    #[test]
    fn test_wan_side_gets_label_not_vpn_badge() {
        let (name, vlan, vpn) = annotator().annotate_side(Some("203.0.113.4"), None);
        assert_eq!(name.as_deref(), Some("Dream Router"));
        assert_eq!(vlan, None);
        assert_eq!(vpn, None);
    }

    #[test]
    fn test_vpn_cidr_match() {
        let (name, _, vpn) = annotator().annotate_side(Some("10.10.50.7"), None);
        assert_eq!(name, None);
        assert_eq!(vpn.as_deref(), Some("WGD SRV"));
    }

    #[test]
    fn test_existing_device_name_is_kept() {
        let (name, vlan, _) =
            annotator().annotate_side(Some("192.168.20.1"), Some("NAS".to_string()));
        assert_eq!(name.as_deref(), Some("NAS"));
        assert_eq!(vlan, Some(20));
    }

    #[test]
    fn test_stats_entry_annotation() {
        let mut entry = serde_json::json!({"ip": "192.168.20.1", "count": 9, "device_name": null});
        annotator().annotate_ip_entry(&mut entry);
        assert_eq!(entry["device_name"], "Gateway");
        assert_eq!(entry["vlan"], 20);
    }
}
