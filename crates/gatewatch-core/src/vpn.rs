//! VPN interface naming conventions.
//!
//! UniFi gateways name tunnel interfaces by VPN type: `wgsrv0`, `tun0`,
//! `tunovpnc1`, and so on. These tables drive direction derivation, badge
//! annotation, and the `vpn_only` log filter.

/// VPN interface prefix → badge abbreviation (max 8 chars).
///
/// `tunovpnc` MUST stay ahead of `tun`: every lookup walks this slice in
/// order with `starts_with`, and an OpenVPN-client interface would
/// otherwise be claimed by the OpenVPN-server prefix.
pub const VPN_PREFIX_BADGES: &[(&str, &str)] = &[
    ("wgsrv", "WGD SRV"),
    ("wgclt", "WGD CLT"),
    ("wgsts", "S MAGIC"),
    ("tlprt", "TELEPORT"),
    ("vti", "S2S IPSEC"),
    ("tunovpnc", "OVPN CLT"),
    ("tun", "OVPN TUN"),
    ("vtun", "OVPN VTN"),
    ("l2tp", "L2TP SRV"),
];

/// All known VPN interface prefixes, in match-priority order.
pub const VPN_INTERFACE_PREFIXES: &[&str] = &[
    "wgsrv", "wgclt", "wgsts", "tlprt", "vti", "tunovpnc", "tun", "vtun", "l2tp",
];

/// Badge abbreviation → human-readable full name (UI dropdowns).
pub const VPN_BADGE_LABELS: &[(&str, &str)] = &[
    ("WGD SRV", "WireGuard Server"),
    ("WGD CLT", "WireGuard Client"),
    ("OVPN SRV", "OpenVPN Server"),
    ("OVPN CLT", "OpenVPN Client"),
    ("OVPN TUN", "OpenVPN / Tunnel 1"),
    ("OVPN VTN", "OpenVPN / Tunnel 2"),
    ("L2TP SRV", "L2TP Server"),
    ("TELEPORT", "Teleport"),
    ("S MAGIC", "Site Magic"),
    ("S2S IPSEC", "Site-to-Site IPsec"),
];

/// Ordered badge choices for UI dropdowns.
pub const VPN_BADGE_CHOICES: &[&str] = &[
    "WGD SRV", "WGD CLT", "OVPN SRV", "OVPN CLT", "OVPN TUN", "OVPN VTN", "L2TP SRV",
    "TELEPORT", "S MAGIC", "S2S IPSEC",
];

/// Interface prefix → description shown under the interface name.
pub const VPN_PREFIX_DESCRIPTIONS: &[(&str, &str)] = &[
    ("wgsrv", "WireGuard Server"),
    ("wgclt", "WireGuard Client"),
    ("wgsts", "Site Magic"),
    ("tlprt", "Teleport"),
    ("vti", "Site-to-Site IPsec"),
    ("tunovpnc", "OpenVPN Client"),
    ("tun", "OpenVPN / Tunnel 1"),
    ("vtun", "OpenVPN / Tunnel 2"),
    ("l2tp", "L2TP Server"),
];

/// First VPN prefix matching the interface name, honouring priority order.
pub fn vpn_prefix_for(iface: &str) -> Option<&'static str> {
    VPN_INTERFACE_PREFIXES
        .iter()
        .find(|prefix| iface.starts_with(**prefix))
        .copied()
}

pub fn is_vpn_interface(iface: &str) -> bool {
    vpn_prefix_for(iface).is_some()
}

/// Badge for a VPN interface name, if any prefix matches.
pub fn vpn_badge_for(iface: &str) -> Option<&'static str> {
    VPN_PREFIX_BADGES
        .iter()
        .find(|(prefix, _)| iface.starts_with(*prefix))
        .map(|(_, badge)| *badge)
}

/// Description for a VPN interface name, if any prefix matches.
pub fn vpn_description_for(iface: &str) -> Option<&'static str> {
    VPN_PREFIX_DESCRIPTIONS
        .iter()
        .find(|(prefix, _)| iface.starts_with(*prefix))
        .map(|(_, desc)| *desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunovpnc_matches_before_tun() {
        assert_eq!(vpn_prefix_for("tunovpnc1"), Some("tunovpnc"));
        assert_eq!(vpn_prefix_for("tun0"), Some("tun"));
        assert_eq!(vpn_badge_for("tunovpnc1"), Some("OVPN CLT"));
        assert_eq!(vpn_badge_for("tun0"), Some("OVPN TUN"));
        assert_eq!(vpn_description_for("tunovpnc1"), Some("OpenVPN Client"));
    }

    #[test]
    fn test_ordering_in_every_table() {
        let pos = |slice: &[&str], needle: &str| slice.iter().position(|p| *p == needle).unwrap();
        assert!(pos(VPN_INTERFACE_PREFIXES, "tunovpnc") < pos(VPN_INTERFACE_PREFIXES, "tun"));

        let badge_keys: Vec<_> = VPN_PREFIX_BADGES.iter().map(|(p, _)| *p).collect();
        assert!(pos(&badge_keys, "tunovpnc") < pos(&badge_keys, "tun"));

        let desc_keys: Vec<_> = VPN_PREFIX_DESCRIPTIONS.iter().map(|(p, _)| *p).collect();
        assert!(pos(&desc_keys, "tunovpnc") < pos(&desc_keys, "tun"));
    }

    #[test]
    fn test_non_vpn_interfaces() {
        assert_eq!(vpn_prefix_for("br0"), None);
        assert_eq!(vpn_prefix_for("eth4"), None);
        assert_eq!(vpn_prefix_for("ppp0"), None);
        assert!(!is_vpn_interface("vlan20"));
    }

    #[test]
    fn test_every_badge_has_a_label() {
        for (_, badge) in VPN_PREFIX_BADGES {
            assert!(
                VPN_BADGE_LABELS.iter().any(|(b, _)| b == badge),
                "badge {badge} missing a label"
            );
        }
    }
}
