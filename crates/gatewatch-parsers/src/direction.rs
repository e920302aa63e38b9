//! Direction and action derivation from firewall log fields.

use std::net::IpAddr;

use gatewatch_core::net::{is_broadcast_or_multicast, is_public_ip};
use gatewatch_core::vpn::is_vpn_interface;
use gatewatch_core::{Direction, RuleAction};

use crate::ParserContext;

/// Inputs to direction derivation, all borrowed from the parsed record.
#[derive(Debug, Default)]
pub struct DirectionInput<'a> {
    pub interface_in: Option<&'a str>,
    pub interface_out: Option<&'a str>,
    pub rule_name: Option<&'a str>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
}

/// Result of direction derivation. `learned_wan_ip` is set when the
/// fallback auto-detection spotted a new WAN address; the caller owns
/// persisting it into config and the shared context.
#[derive(Debug, Default)]
pub struct DirectionOutcome {
    pub direction: Option<Direction>,
    pub learned_wan_ip: Option<IpAddr>,
}

/// Derive traffic direction from interfaces, rule name, and IPs.
pub fn derive_direction(input: &DirectionInput<'_>, ctx: &ParserContext) -> DirectionOutcome {
    let iface_in = input.interface_in.unwrap_or("");
    let iface_out = input.interface_out.unwrap_or("");
    let rule_name = input.rule_name.unwrap_or("");

    if iface_in.is_empty() && iface_out.is_empty() {
        return DirectionOutcome::default();
    }

    let in_is_wan = ctx.wan_interfaces.contains(iface_in);

    // Auto-learn WAN IP from WAN_LOCAL rules (IN=WAN interface, public DST).
    // Only when no authoritative wan_ip_by_iface mapping exists.
    let mut learned_wan_ip = None;
    if !ctx.wan_ip_authoritative && in_is_wan && rule_name.contains("WAN_LOCAL") {
        if let Some(dst) = input.dst_ip {
            if is_public_ip(dst) && !is_broadcast_or_multicast(dst) && !ctx.wan_ips.contains(&dst) {
                learned_wan_ip = Some(dst);
            }
        }
    }

    let is_wan_ip =
        |ip: IpAddr| ctx.wan_ips.contains(&ip) || learned_wan_ip == Some(ip);

    let direction = (|| {
        // Broadcast/multicast is not real inbound/outbound traffic
        if input.dst_ip.is_some_and(is_broadcast_or_multicast) {
            return Direction::Local;
        }

        // Traffic from the router's own WAN IP staying local (not going out WAN)
        if input.src_ip.is_some_and(is_wan_ip) && !ctx.wan_interfaces.contains(iface_out) {
            return Direction::Local;
        }

        if rule_name.contains("DNAT") || rule_name.contains("PREROUTING") {
            return Direction::Nat;
        }

        // No OUT interface = traffic destined to the router itself
        if iface_out.is_empty() {
            return if in_is_wan { Direction::Inbound } else { Direction::Local };
        }

        let out_is_wan = ctx.wan_interfaces.contains(iface_out);
        if in_is_wan && !out_is_wan {
            return Direction::Inbound;
        }
        if !in_is_wan && out_is_wan {
            return Direction::Outbound;
        }
        if !in_is_wan && !out_is_wan && iface_in != iface_out {
            // VPN tunnel <-> LAN is VPN traffic, not inter-VLAN
            if is_vpn_interface(iface_in) || is_vpn_interface(iface_out) {
                return Direction::Vpn;
            }
            return Direction::InterVlan;
        }

        Direction::Local
    })();

    DirectionOutcome {
        direction: Some(direction),
        learned_wan_ip,
    }
}

/// Derive the firewall action from the rule-name convention:
/// `-A-` = allow, `-B-`/`-D-` = block/drop, `-R-` = reject.
pub fn derive_action(rule_name: Option<&str>) -> Option<RuleAction> {
    let name = rule_name?;
    if name.is_empty() {
        return None;
    }
    if name.contains("DNAT") || name.contains("PREROUTING") {
        return Some(RuleAction::Redirect);
    }
    if name.contains("-A-") {
        return Some(RuleAction::Allow);
    }
    if name.contains("-B-") || name.contains("-D-") || name.contains("-R-") {
        return Some(RuleAction::Block);
    }
    // Custom rules without the convention default to allow
    Some(RuleAction::Allow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ctx() -> ParserContext {
        ParserContext {
            wan_interfaces: HashSet::from(["ppp0".to_string()]),
            ..Default::default()
        }
    }

    fn input<'a>(
        iface_in: Option<&'a str>,
        iface_out: Option<&'a str>,
        rule: Option<&'a str>,
        src: Option<&str>,
        dst: Option<&str>,
    ) -> DirectionInput<'a> {
        DirectionInput {
            interface_in: iface_in,
            interface_out: iface_out,
            rule_name: rule,
            src_ip: src.map(|s| s.parse().unwrap()),
            dst_ip: dst.map(|s| s.parse().unwrap()),
        }
    }

    #[test]
    fn test_wan_in_no_out_is_inbound() {
        let out = derive_direction(
            &input(Some("ppp0"), None, Some("WAN_IN-D-123"), Some("198.51.100.7"), Some("203.0.113.4")),
            &ctx(),
        );
        assert_eq!(out.direction, Some(Direction::Inbound));
    }

    #[test]
    fn test_lan_to_wan_is_outbound() {
        let out = derive_direction(
            &input(Some("br0"), Some("ppp0"), Some("LAN_OUT-A-1"), Some("192.168.1.10"), Some("8.8.8.8")),
            &ctx(),
        );
        assert_eq!(out.direction, Some(Direction::Outbound));
    }

    #[test]
    fn test_broadcast_dst_is_local() {
        let out = derive_direction(
            &input(Some("br0"), Some("ppp0"), None, Some("192.168.1.10"), Some("255.255.255.255")),
            &ctx(),
        );
        assert_eq!(out.direction, Some(Direction::Local));
    }

    #[test]
    fn test_dnat_rule_is_nat() {
        let out = derive_direction(
            &input(Some("ppp0"), Some("br0"), Some("USR_PREROUTING-R-1"), Some("198.51.100.9"), Some("203.0.113.4")),
            &ctx(),
        );
        assert_eq!(out.direction, Some(Direction::Nat));
    }

    #[test]
    fn test_bridge_to_bridge_is_inter_vlan() {
        let out = derive_direction(
            &input(Some("br0"), Some("br20"), Some("LAN_IN-A-2"), Some("192.168.1.10"), Some("192.168.20.5")),
            &ctx(),
        );
        assert_eq!(out.direction, Some(Direction::InterVlan));
    }

    #[test]
    fn test_vpn_interface_beats_inter_vlan() {
        let out = derive_direction(
            &input(Some("wgsrv0"), Some("br0"), Some("VPN_IN-A-1"), Some("10.10.50.2"), Some("192.168.1.10")),
            &ctx(),
        );
        assert_eq!(out.direction, Some(Direction::Vpn));
    }

    #[test]
    fn test_own_wan_ip_staying_local() {
        let mut c = ctx();
        c.wan_ips.insert("203.0.113.4".parse().unwrap());
        let out = derive_direction(
            &input(Some("br0"), Some("br20"), None, Some("203.0.113.4"), Some("192.168.20.5")),
            &c,
        );
        assert_eq!(out.direction, Some(Direction::Local));
    }

    #[test]
    fn test_no_interfaces_no_direction() {
        let out = derive_direction(&input(None, None, Some("X-A-1"), None, None), &ctx());
        assert_eq!(out.direction, None);
    }

    #[test]
    fn test_wan_local_auto_learn() {
        let out = derive_direction(
            &input(Some("ppp0"), None, Some("WAN_LOCAL-D-9"), Some("198.51.100.7"), Some("203.0.113.4")),
            &ctx(),
        );
        assert_eq!(out.learned_wan_ip, Some("203.0.113.4".parse().unwrap()));
        assert_eq!(out.direction, Some(Direction::Inbound));
    }

    #[test]
    fn test_no_auto_learn_when_authoritative() {
        let mut c = ctx();
        c.wan_ip_authoritative = true;
        let out = derive_direction(
            &input(Some("ppp0"), None, Some("WAN_LOCAL-D-9"), Some("198.51.100.7"), Some("203.0.113.4")),
            &c,
        );
        assert_eq!(out.learned_wan_ip, None);
    }

    #[test]
    fn test_no_auto_learn_for_private_dst() {
        let out = derive_direction(
            &input(Some("ppp0"), None, Some("WAN_LOCAL-D-9"), Some("198.51.100.7"), Some("192.168.1.1")),
            &ctx(),
        );
        assert_eq!(out.learned_wan_ip, None);
    }

    #[test]
    fn test_action_convention() {
        assert_eq!(derive_action(Some("LAN_IN-A-1")), Some(RuleAction::Allow));
        assert_eq!(derive_action(Some("WAN_IN-B-3")), Some(RuleAction::Block));
        assert_eq!(derive_action(Some("WAN_IN-D-3")), Some(RuleAction::Block));
        assert_eq!(derive_action(Some("GUEST-R-2")), Some(RuleAction::Block));
        assert_eq!(derive_action(Some("USR_PREROUTING-R-1")), Some(RuleAction::Redirect));
        assert_eq!(derive_action(Some("MY_CUSTOM_RULE")), Some(RuleAction::Allow));
        assert_eq!(derive_action(None), None);
    }

    #[test]
    fn test_openvpn_client_tunnel_is_vpn_not_inter_vlan() {
        let out = derive_direction(
            &input(Some("tunovpnc1"), Some("br0"), Some("VPN_IN-A-2"), Some("10.8.0.2"), Some("192.168.1.10")),
            &ctx(),
        );
        assert_eq!(out.direction, Some(Direction::Vpn));
    }
}
