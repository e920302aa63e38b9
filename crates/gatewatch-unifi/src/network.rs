//! Network topology for the wizard: WAN interfaces, VLAN segments, and
//! VPN network discovery.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{UnifiClient, UnifiResult};

/// WAN physical interface fallback from `(wan_type, wan_networkgroup)`,
/// used when the gateway device doesn't report its uplink interface.
const WAN_PHYSICAL_MAP: &[((&str, &str), &str)] = &[
    (("pppoe", "WAN"), "ppp0"),
    (("pppoe", "WAN2"), "ppp1"),
    (("dhcp", "WAN"), "eth4"),
    (("static", "WAN"), "eth4"),
    (("dhcp", "WAN2"), "eth5"),
    (("static", "WAN2"), "eth5"),
];

/// UniFi `vpn_type` → (interface prefix, badge). `openvpn-client` maps to
/// the dedicated `tunovpnc` prefix so it never collides with `tun`.
const VPN_TYPE_MAP: &[(&str, (&str, &str))] = &[
    ("wireguard-server", ("wgsrv", "WGD SRV")),
    ("wireguard-client", ("wgclt", "WGD CLT")),
    ("site-magic-wan", ("wgsts", "S MAGIC")),
    ("teleport", ("tlprt", "TELEPORT")),
    ("ipsec-vpn", ("vti", "S2S IPSEC")),
    ("openvpn-server", ("tun", "OVPN SRV")),
    ("openvpn-client", ("tunovpnc", "OVPN CLT")),
    ("l2tp-server", ("l2tp", "L2TP SRV")),
];

#[derive(Debug, Clone, Serialize)]
pub struct WanInterface {
    pub name: String,
    pub wan_ip: Option<String>,
    #[serde(rename = "type")]
    pub wan_type: String,
    pub networkgroup: String,
    pub physical_interface: String,
    pub active: bool,
    pub detected_from: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkSegment {
    pub name: String,
    pub interface: String,
    pub vlan: i64,
    pub ip_subnet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfig {
    pub source: &'static str,
    pub wan_interfaces: Vec<WanInterface>,
    pub networks: Vec<NetworkSegment>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VpnNetwork {
    pub interface: Option<String>,
    pub name: String,
    pub badge: String,
    pub cidr: String,
    pub vpn_type: String,
    pub enabled: bool,
}

/// Derive the tunnel interface name for one networkconf entry.
///
/// WireGuard-family types carry `wireguard_id`. OpenVPN records instead
/// carry `tunnel_id` (or the legacy `x_openvpn_tunnel_id`), falling back
/// to 0. `tunnel_id: 0` is a real id, not an absent one.
fn derive_vpn_interface(net: &Value, vpn_type: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return None;
    }
    if let Some(wg_id) = net.get("wireguard_id").and_then(Value::as_i64) {
        return Some(format!("{prefix}{wg_id}"));
    }
    if matches!(vpn_type, "openvpn-server" | "openvpn-client") {
        let id = net
            .get("tunnel_id")
            .and_then(Value::as_i64)
            .or_else(|| net.get("x_openvpn_tunnel_id").and_then(Value::as_i64))
            .unwrap_or(0);
        return Some(format!("{prefix}{id}"));
    }
    Some(format!("{prefix}0"))
}

/// Pure half of VPN discovery, split out for testing against mock
/// networkconf payloads.
pub fn vpn_networks_from_conf(networks: &[Value]) -> Vec<VpnNetwork> {
    let mut results = Vec::new();
    for net in networks {
        let vpn_type = net.get("vpn_type").and_then(Value::as_str).unwrap_or("");
        if vpn_type.is_empty() {
            continue;
        }
        let Some((_, (prefix, badge))) = VPN_TYPE_MAP.iter().find(|(t, _)| *t == vpn_type) else {
            debug!("Unknown vpn_type {vpn_type:?}, skipping");
            continue;
        };

        results.push(VpnNetwork {
            interface: derive_vpn_interface(net, vpn_type, prefix),
            name: net
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string(),
            badge: badge.to_string(),
            cidr: net.get("ip_subnet").and_then(Value::as_str).unwrap_or("").to_string(),
            vpn_type: vpn_type.to_string(),
            enabled: net.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        });
    }
    results
}

impl UnifiClient {
    /// VPN network configs from the classic `rest/networkconf` endpoint.
    pub async fn vpn_networks(&self) -> Vec<VpnNetwork> {
        if !self.enabled().await {
            return Vec::new();
        }
        let conf = match self.get_classic("rest/networkconf").await {
            Ok(conf) => conf,
            Err(e) => {
                warn!("Failed to fetch VPN networkconf: {e}");
                return Vec::new();
            }
        };
        let networks = conf
            .pointer("/data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        vpn_networks_from_conf(&networks)
    }

    /// Full network topology for the wizard: classic + integration APIs.
    pub async fn network_config(&self) -> UnifiResult<NetworkConfig> {
        if !self.enabled().await {
            return Ok(NetworkConfig {
                source: "unifi_api",
                wan_interfaces: Vec::new(),
                networks: Vec::new(),
            });
        }

        let netconf = self.get_classic("rest/networkconf").await?;
        let networks_raw = netconf
            .pointer("/data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Per-WAN health: subsystem 'wan' → WAN, 'wan2' → WAN2, ...
        let health = self.get_classic("stat/health").await?;
        let mut wan_health: Vec<(String, Value)> = Vec::new();
        for subsystem in health.pointer("/data").and_then(Value::as_array).into_iter().flatten() {
            let sub_name = subsystem.get("subsystem").and_then(Value::as_str).unwrap_or("");
            if sub_name == "wan" {
                wan_health.push(("WAN".to_string(), subsystem.clone()));
            } else if let Some(suffix) = sub_name.strip_prefix("wan") {
                if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                    wan_health.push((format!("WAN{suffix}"), subsystem.clone()));
                }
            }
        }

        // Gateway device wan1/wan2 objects carry the uplink interface name
        let mut device_wan_map: Vec<(String, String)> = Vec::new();
        let mut device_wan_ips: Vec<(String, String)> = Vec::new();
        match self.get_classic("stat/device").await {
            Ok(devices) => {
                for dev in devices.pointer("/data").and_then(Value::as_array).into_iter().flatten() {
                    let Some(obj) = dev.as_object() else { continue };
                    let mut wan_keys: Vec<&String> = obj
                        .keys()
                        .filter(|k| {
                            k.strip_prefix("wan")
                                .map(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
                                .unwrap_or(false)
                        })
                        .collect();
                    if wan_keys.is_empty() {
                        continue;
                    }
                    wan_keys.sort();
                    for key in wan_keys {
                        let Some(wan_obj) = obj.get(key).and_then(Value::as_object) else {
                            continue;
                        };
                        let idx = &key[3..];
                        let group = if idx == "1" { "WAN".to_string() } else { format!("WAN{idx}") };
                        if let Some(uplink) = wan_obj.get("uplink_ifname").and_then(Value::as_str) {
                            if !device_wan_map.iter().any(|(g, _)| *g == group) {
                                device_wan_map.push((group.clone(), uplink.to_string()));
                            }
                        }
                        if let Some(ip) = wan_obj.get("ip").and_then(Value::as_str) {
                            if !device_wan_ips.iter().any(|(g, _)| *g == group) {
                                device_wan_ips.push((group.clone(), ip.to_string()));
                            }
                        }
                    }
                    if !device_wan_map.is_empty() {
                        info!("Resolved WAN interfaces from gateway device: {device_wan_map:?}");
                    }
                    break; // only the first gateway matters
                }
            }
            Err(e) => debug!("Could not resolve WAN from stat/device: {e}"),
        }

        let lookup = |pairs: &[(String, String)], group: &str| -> Option<String> {
            pairs.iter().find(|(g, _)| g == group).map(|(_, v)| v.clone())
        };

        let mut wan_interfaces = Vec::new();
        for net in &networks_raw {
            if net.get("enabled").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            if net.get("purpose").and_then(Value::as_str) != Some("wan") {
                continue;
            }

            let name = net.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let networkgroup = net
                .get("wan_networkgroup")
                .or_else(|| net.get("networkgroup"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let wan_type = net
                .get("wan_type")
                .and_then(Value::as_str)
                .unwrap_or("dhcp")
                .to_string();
            let wan_type_lower = wan_type.to_lowercase();

            // Gateway device detection beats the static fallback map
            let (physical, detected_from) = match lookup(&device_wan_map, &networkgroup) {
                Some(uplink) => (uplink, "device"),
                None => {
                    let mapped = WAN_PHYSICAL_MAP
                        .iter()
                        .find(|((t, g), _)| *t == wan_type_lower && *g == networkgroup)
                        .map(|(_, iface)| iface.to_string());
                    let physical = mapped.clone().unwrap_or_else(|| {
                        if networkgroup == "WAN" { "eth4".to_string() } else { "eth5".to_string() }
                    });
                    if mapped.is_none() {
                        warn!(
                            "Unmapped WAN type: wan_type={wan_type:?}, wan_networkgroup={networkgroup} -> defaulting to {physical}"
                        );
                    }
                    (physical, "map")
                }
            };

            let health_ip = wan_health
                .iter()
                .find(|(g, _)| *g == networkgroup)
                .and_then(|(_, sub)| sub.get("wan_ip").and_then(Value::as_str))
                .map(str::to_string);
            let wan_ip = health_ip.or_else(|| lookup(&device_wan_ips, &networkgroup));

            wan_interfaces.push(WanInterface {
                name,
                active: wan_ip.is_some(),
                wan_ip,
                wan_type,
                networkgroup,
                physical_interface: physical,
                detected_from,
            });
        }

        // Subnets keyed by network name, for the integration-API segments
        let subnet_by_name: Vec<(String, String)> = networks_raw
            .iter()
            .filter_map(|net| {
                let name = net.get("name").and_then(Value::as_str)?;
                let subnet = net.get("ip_subnet").and_then(Value::as_str)?;
                (!name.is_empty() && !subnet.is_empty())
                    .then(|| (name.to_string(), subnet.to_string()))
            })
            .collect();

        let networks = match self.get_integration_site("/networks").await {
            Ok(int_networks) => {
                let mut segments = Vec::new();
                for net in int_networks.pointer("/data").and_then(Value::as_array).into_iter().flatten() {
                    if net.get("enabled").and_then(Value::as_bool) == Some(false) {
                        continue;
                    }
                    let Some(vlan_id) = net.get("vlanId").and_then(Value::as_i64) else {
                        continue;
                    };
                    let name = net.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                    segments.push(NetworkSegment {
                        interface: if vlan_id == 1 { "br0".to_string() } else { format!("br{vlan_id}") },
                        vlan: vlan_id,
                        ip_subnet: subnet_by_name
                            .iter()
                            .find(|(n, _)| *n == name)
                            .map(|(_, s)| s.clone())
                            .unwrap_or_default(),
                        name,
                    });
                }
                segments
            }
            Err(e) => {
                warn!("Integration API /networks failed, falling back to classic: {e}");
                let mut segments = Vec::new();
                for net in &networks_raw {
                    if net.get("enabled").and_then(Value::as_bool) == Some(false) {
                        continue;
                    }
                    let purpose = net.get("purpose").and_then(Value::as_str).unwrap_or("");
                    if !matches!(purpose, "corporate" | "guest" | "vlan-only") {
                        continue;
                    }
                    let vlan = net.get("vlan").and_then(Value::as_i64);
                    let vlan_enabled = net.get("vlan_enabled").and_then(Value::as_bool).unwrap_or(false);
                    let vlan_id = match (vlan, vlan_enabled) {
                        (Some(v), true) if v > 0 => v,
                        _ => 1,
                    };
                    segments.push(NetworkSegment {
                        name: net.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                        interface: if vlan_id == 1 { "br0".to_string() } else { format!("br{vlan_id}") },
                        vlan: vlan_id,
                        ip_subnet: net
                            .get("ip_subnet")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    });
                }
                segments
            }
        };

        Ok(NetworkConfig {
            source: "unifi_api",
            wan_interfaces,
            networks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conf(entries: Vec<Value>) -> Vec<Value> {
        entries
    }

    #[test]
    fn test_vpn_discovery_all_types() {
        let networks = conf(vec![
            json!({"name": "WG Server Home", "vpn_type": "wireguard-server", "enabled": true,
                   "wireguard_id": 0, "ip_subnet": "10.10.50.1/24"}),
            json!({"name": "WG Client Remote", "vpn_type": "wireguard-client", "enabled": true,
                   "wireguard_id": 1, "ip_subnet": "10.10.60.1/24"}),
            json!({"name": "OVPN Server Office", "vpn_type": "openvpn-server", "enabled": true,
                   "tunnel_id": 0, "ip_subnet": "10.10.70.1/29"}),
            json!({"name": "VPN Provider", "vpn_type": "openvpn-client", "enabled": true,
                   "tunnel_id": 1, "ip_subnet": ""}),
            json!({"name": "Site Magic Link", "vpn_type": "site-magic-wan", "enabled": true,
                   "wireguard_id": 2, "ip_subnet": "10.10.100.1/30"}),
            json!({"name": "Branch Office IPsec", "vpn_type": "ipsec-vpn", "enabled": true,
                   "wireguard_id": 0, "ip_subnet": "10.10.110.0/24"}),
            json!({"name": "L2TP Remote Access", "vpn_type": "l2tp-server", "enabled": true,
                   "wireguard_id": 0, "ip_subnet": "10.10.120.1/24"}),
            json!({"name": "Default LAN", "purpose": "corporate", "ip_subnet": "192.168.1.1/24"}),
        ]);

        let results = vpn_networks_from_conf(&networks);
        let find = |name: &str| results.iter().find(|r| r.name == name).unwrap();

        assert!(results.iter().all(|r| r.name != "Default LAN"));
        assert_eq!(find("WG Server Home").interface.as_deref(), Some("wgsrv0"));
        assert_eq!(find("WG Server Home").badge, "WGD SRV");
        assert_eq!(find("WG Client Remote").interface.as_deref(), Some("wgclt1"));
        assert_eq!(find("OVPN Server Office").interface.as_deref(), Some("tun0"));
        assert_eq!(find("OVPN Server Office").badge, "OVPN SRV");
        assert_eq!(find("VPN Provider").interface.as_deref(), Some("tunovpnc1"));
        assert_eq!(find("VPN Provider").badge, "OVPN CLT");
        assert_eq!(find("Site Magic Link").interface.as_deref(), Some("wgsts2"));
        assert_eq!(find("Branch Office IPsec").interface.as_deref(), Some("vti0"));
        assert_eq!(find("L2TP Remote Access").interface.as_deref(), Some("l2tp0"));
    }

    #[test]
    fn test_openvpn_client_without_tunnel_id_falls_back_to_zero() {
        let networks = conf(vec![json!({
            "name": "Minimal OVPN Client", "vpn_type": "openvpn-client",
            "enabled": true, "ip_subnet": "10.10.80.0/24"
        })]);
        let results = vpn_networks_from_conf(&networks);
        assert_eq!(results[0].interface.as_deref(), Some("tunovpnc0"));
    }

    #[test]
    fn test_openvpn_client_legacy_id_field() {
        let networks = conf(vec![json!({
            "name": "OVPN Client Alt Field", "vpn_type": "openvpn-client",
            "enabled": true, "x_openvpn_tunnel_id": 3, "ip_subnet": "10.10.90.0/24"
        })]);
        let results = vpn_networks_from_conf(&networks);
        assert_eq!(results[0].interface.as_deref(), Some("tunovpnc3"));
    }

    #[test]
    fn test_openvpn_tunnel_id_zero_is_honoured() {
        let networks = conf(vec![json!({
            "name": "OVPN Zero", "vpn_type": "openvpn-client",
            "enabled": true, "tunnel_id": 0, "ip_subnet": "10.0.0.0/24"
        })]);
        let results = vpn_networks_from_conf(&networks);
        assert_eq!(results[0].interface.as_deref(), Some("tunovpnc0"));
    }

    #[test]
    fn test_unknown_vpn_type_skipped() {
        let networks = conf(vec![json!({
            "name": "Mystery", "vpn_type": "carrier-pigeon", "enabled": true
        })]);
        assert!(vpn_networks_from_conf(&networks).is_empty());
    }
}
