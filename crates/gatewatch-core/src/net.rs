//! IP-scope helpers shared by the parsers, the enricher, and the API.

use std::net::IpAddr;

/// True for the limited broadcast address or any multicast address.
pub fn is_broadcast_or_multicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_broadcast() || v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// True when the address is publicly routable: not RFC1918, loopback,
/// link-local, multicast, "this"-network, or IPv6 unique-local.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || octets[0] == 0)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fe80::/10 link-local
                || (segments[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique-local
                || (segments[0] & 0xfe00) == 0xfc00)
        }
    }
}

/// String-input variant of [`is_public_ip`]; unparseable input is not public.
pub fn is_public_ip_str(ip: &str) -> bool {
    ip.parse::<IpAddr>().map(is_public_ip).unwrap_or(false)
}

/// Canonical textual form of an IP literal, or the input unchanged when it
/// does not parse. Used before set-membership checks against config lists.
pub fn normalize_ip(ip: &str) -> String {
    ip.parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| ip.to_string())
}

/// The installation's own addresses (WAN + gateway IPs), which must never
/// receive or contribute threat data. Built once per enrichment pass from
/// config and threaded through every write path.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    ips: std::collections::HashSet<IpAddr>,
}

impl ExclusionSet {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            ips: ips.into_iter().collect(),
        }
    }

    /// Parse textual config entries, silently skipping invalid literals.
    pub fn from_strings<S: AsRef<str>>(ips: impl IntoIterator<Item = S>) -> Self {
        Self {
            ips: ips
                .into_iter()
                .filter_map(|s| s.as_ref().parse().ok())
                .collect(),
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip)
    }

    pub fn contains_str(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>().map(|addr| self.contains(addr)).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.ips.iter()
    }
}

/// Remote means worth enriching: publicly routable and not one of ours.
pub fn is_remote_ip(ip: IpAddr, exclusions: &ExclusionSet) -> bool {
    is_public_ip(ip) && !exclusions.contains(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_and_multicast() {
        assert!(is_broadcast_or_multicast("255.255.255.255".parse().unwrap()));
        assert!(is_broadcast_or_multicast("224.0.0.251".parse().unwrap()));
        assert!(is_broadcast_or_multicast("ff02::fb".parse().unwrap()));
        assert!(!is_broadcast_or_multicast("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_public_v4() {
        assert!(is_public_ip("198.51.100.7".parse().unwrap()));
        assert!(is_public_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_public_ip("10.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("172.20.0.1".parse().unwrap()));
        assert!(!is_public_ip("192.168.1.50".parse().unwrap()));
        assert!(!is_public_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("169.254.10.10".parse().unwrap()));
        assert!(!is_public_ip("224.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("0.12.0.1".parse().unwrap()));
    }

    #[test]
    fn test_public_v6() {
        assert!(is_public_ip("2001:db8::1".parse().unwrap()));
        assert!(!is_public_ip("::1".parse().unwrap()));
        assert!(!is_public_ip("fe80::1".parse().unwrap()));
        assert!(!is_public_ip("fd00::1".parse().unwrap()));
        assert!(!is_public_ip("ff02::1".parse().unwrap()));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_ip("192.168.001.001"), "192.168.001.001"); // not an IP literal, unchanged
        assert_eq!(normalize_ip("2001:DB8::1"), "2001:db8::1");
        assert_eq!(normalize_ip("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn test_is_public_str_rejects_garbage() {
        assert!(!is_public_ip_str(""));
        assert!(!is_public_ip_str("999.1.1.1"));
        assert!(is_public_ip_str("203.0.113.4"));
    }

    #[test]
    fn test_exclusion_set() {
        let set = ExclusionSet::from_strings(["203.0.113.4", "192.168.1.1", "garbage"]);
        assert!(set.contains("203.0.113.4".parse().unwrap()));
        assert!(set.contains_str("192.168.1.1"));
        assert!(!set.contains_str("198.51.100.7"));
        assert!(!set.contains_str("garbage"));
    }

    #[test]
    fn test_remote_excludes_own_wan() {
        let set = ExclusionSet::from_strings(["203.0.113.4"]);
        assert!(is_remote_ip("198.51.100.7".parse().unwrap(), &set));
        assert!(!is_remote_ip("203.0.113.4".parse().unwrap(), &set));
        assert!(!is_remote_ip("192.168.1.10".parse().unwrap(), &set));
    }
}
