//! DHCP (dnsmasq-dhcp) log line parsing.

use std::sync::LazyLock;

use regex::Regex;

use gatewatch_core::LogRecord;

static DHCP_ACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DHCPACK\((\S+)\)\s+([0-9a-fA-F:.]+)\s+([0-9a-f:]+)\s*(\S*)").unwrap());
static DHCP_DISC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DHCPDISCOVER\((\S+)\)\s+([0-9a-f:]+)").unwrap());
static DHCP_OFFER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DHCPOFFER\((\S+)\)\s+([0-9a-fA-F:.]+)\s+([0-9a-f:]+)").unwrap());
static DHCP_REQ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DHCPREQUEST\((\S+)\)\s+([0-9a-fA-F:.]+)\s+([0-9a-f:]+)").unwrap());

pub fn parse_dhcp(body: &str, record: &mut LogRecord) {
    if let Some(caps) = DHCP_ACK.captures(body) {
        record.interface_in = Some(caps[1].to_string());
        record.src_ip = caps[2].parse().ok();
        record.mac_address = Some(caps[3].to_string());
        record.hostname = caps.get(4).map(|m| m.as_str()).filter(|s| !s.is_empty()).map(str::to_string);
        record.dhcp_event = Some("DHCPACK".to_string());
        return;
    }

    if let Some(caps) = DHCP_REQ.captures(body) {
        record.interface_in = Some(caps[1].to_string());
        record.src_ip = caps[2].parse().ok();
        record.mac_address = Some(caps[3].to_string());
        record.dhcp_event = Some("DHCPREQUEST".to_string());
        return;
    }

    if let Some(caps) = DHCP_OFFER.captures(body) {
        record.interface_in = Some(caps[1].to_string());
        record.src_ip = caps[2].parse().ok();
        record.mac_address = Some(caps[3].to_string());
        record.dhcp_event = Some("DHCPOFFER".to_string());
        return;
    }

    if let Some(caps) = DHCP_DISC.captures(body) {
        record.interface_in = Some(caps[1].to_string());
        record.mac_address = Some(caps[2].to_string());
        record.dhcp_event = Some("DHCPDISCOVER".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gatewatch_core::LogType;

    fn parse(body: &str) -> LogRecord {
        let mut record = LogRecord::new(LogType::Dhcp, Utc::now(), body.to_string());
        parse_dhcp(body, &mut record);
        record
    }

    #[test]
    fn test_ack_with_hostname() {
        let record = parse("dnsmasq-dhcp[999]: DHCPACK(br0) 192.168.1.50 aa:bb:cc:dd:ee:ff laptop");
        assert_eq!(record.dhcp_event.as_deref(), Some("DHCPACK"));
        assert_eq!(record.interface_in.as_deref(), Some("br0"));
        assert_eq!(record.src_ip, Some("192.168.1.50".parse().unwrap()));
        assert_eq!(record.mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(record.hostname.as_deref(), Some("laptop"));
    }

    #[test]
    fn test_ack_without_hostname() {
        let record = parse("dnsmasq-dhcp[999]: DHCPACK(br0) 192.168.1.51 aa:bb:cc:dd:ee:01");
        assert_eq!(record.dhcp_event.as_deref(), Some("DHCPACK"));
        assert_eq!(record.hostname, None);
    }

    #[test]
    fn test_discover_has_no_ip() {
        let record = parse("dnsmasq-dhcp[999]: DHCPDISCOVER(br0) aa:bb:cc:dd:ee:ff");
        assert_eq!(record.dhcp_event.as_deref(), Some("DHCPDISCOVER"));
        assert_eq!(record.src_ip, None);
        assert_eq!(record.mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_request() {
        let record = parse("dnsmasq-dhcp[999]: DHCPREQUEST(br20) 192.168.20.7 11:22:33:44:55:66");
        assert_eq!(record.dhcp_event.as_deref(), Some("DHCPREQUEST"));
        assert_eq!(record.interface_in.as_deref(), Some("br20"));
    }

    #[test]
    fn test_offer() {
        let record = parse("dnsmasq-dhcp[999]: DHCPOFFER(br0) 192.168.1.52 aa:bb:cc:00:11:22");
        assert_eq!(record.dhcp_event.as_deref(), Some("DHCPOFFER"));
    }
}
