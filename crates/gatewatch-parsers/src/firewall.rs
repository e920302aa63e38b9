//! Firewall (iptables/netfilter) log line parsing.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use gatewatch_core::LogRecord;

use crate::direction::{derive_action, derive_direction, DirectionInput};
use crate::ParserContext;

static FW_RULE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").unwrap());
static FW_DESC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"DESCR="([^"]*)""#).unwrap());
static FW_IN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"IN=(\S*)").unwrap());
static FW_OUT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"OUT=(\S*)").unwrap());
static FW_SRC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"SRC=([0-9a-fA-F:.]+)").unwrap());
static FW_DST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"DST=([0-9a-fA-F:.]+)").unwrap());
static FW_PROTO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"PROTO=([A-Z]+)").unwrap());
static FW_SPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"SPT=(\d+)").unwrap());
static FW_DPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"DPT=(\d+)").unwrap());
static FW_MAC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"MAC=([0-9a-f:]+)").unwrap());

fn capture<'a>(re: &Regex, body: &'a str) -> Option<&'a str> {
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
}

fn parse_ip_field(raw: Option<&str>, field: &str, line: &str) -> Option<IpAddr> {
    let raw = raw?;
    match raw.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            tracing::warn!("Invalid {} '{}' in log: {:.300}", field, raw, line);
            None
        }
    }
}

/// Extract the source MAC from the iptables MAC field.
///
/// The field is dest_mac:src_mac:ethertype (6:6:2 bytes); the source MAC
/// is bytes 7..12.
pub fn extract_mac(mac_raw: &str) -> String {
    let parts: Vec<&str> = mac_raw.split(':').collect();
    if parts.len() >= 12 {
        parts[6..12].join(":")
    } else {
        mac_raw.to_string()
    }
}

/// Parse firewall fields out of the message body into the record. Returns
/// a freshly auto-learned WAN IP, if the fallback detection found one.
pub fn parse_firewall(body: &str, record: &mut LogRecord, ctx: &ParserContext) -> Option<IpAddr> {
    record.rule_name = capture(&FW_RULE, body).map(str::to_string);
    record.rule_desc = FW_DESC
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    record.interface_in = capture(&FW_IN, body).map(str::to_string);
    record.interface_out = capture(&FW_OUT, body).map(str::to_string);
    record.src_ip = parse_ip_field(capture(&FW_SRC, body), "src_ip", body);
    record.dst_ip = parse_ip_field(capture(&FW_DST, body), "dst_ip", body);
    record.protocol = capture(&FW_PROTO, body).map(|p| p.to_ascii_lowercase());
    record.src_port = capture(&FW_SPT, body).and_then(|p| p.parse().ok());
    record.dst_port = capture(&FW_DPT, body).and_then(|p| p.parse().ok());

    record.service_name = gatewatch_catalog::service_name(
        record.dst_port.and_then(|p| u16::try_from(p).ok()),
        record.protocol.as_deref(),
    );

    record.mac_address = capture(&FW_MAC, body).map(extract_mac);
    record.rule_action = derive_action(record.rule_name.as_deref());

    let outcome = derive_direction(
        &DirectionInput {
            interface_in: record.interface_in.as_deref(),
            interface_out: record.interface_out.as_deref(),
            rule_name: record.rule_name.as_deref(),
            src_ip: record.src_ip,
            dst_ip: record.dst_ip,
        },
        ctx,
    );
    record.direction = outcome.direction;
    outcome.learned_wan_ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gatewatch_core::{Direction, LogType, RuleAction};
    use std::collections::HashSet;

    fn parse(body: &str) -> LogRecord {
        let ctx = ParserContext {
            wan_interfaces: HashSet::from(["ppp0".to_string()]),
            ..Default::default()
        };
        let mut record = LogRecord::new(LogType::Firewall, Utc::now(), body.to_string());
        parse_firewall(body, &mut record, &ctx);
        record
    }

    #[test]
    fn test_inbound_drop_line() {
        let record = parse(
            "[WAN_IN-D-123] DESCR=\"Drop\" IN=ppp0 OUT= \
             MAC=aa:bb:cc:dd:ee:ff:11:22:33:44:55:66:08:00 \
             SRC=198.51.100.7 DST=203.0.113.4 PROTO=TCP SPT=54321 DPT=22",
        );
        assert_eq!(record.rule_name.as_deref(), Some("WAN_IN-D-123"));
        assert_eq!(record.rule_desc.as_deref(), Some("Drop"));
        assert_eq!(record.interface_in.as_deref(), Some("ppp0"));
        assert_eq!(record.interface_out, None);
        assert_eq!(record.src_ip, Some("198.51.100.7".parse().unwrap()));
        assert_eq!(record.dst_ip, Some("203.0.113.4".parse().unwrap()));
        assert_eq!(record.protocol.as_deref(), Some("tcp"));
        assert_eq!(record.src_port, Some(54321));
        assert_eq!(record.dst_port, Some(22));
        assert_eq!(record.service_name.as_deref(), Some("ssh"));
        assert_eq!(record.rule_action, Some(RuleAction::Block));
        assert_eq!(record.direction, Some(Direction::Inbound));
        // source MAC = bytes 7..12 of the dest:src:ethertype string
        assert_eq!(record.mac_address.as_deref(), Some("11:22:33:44:55:66"));
    }

    #[test]
    fn test_port_forward_redirect() {
        let record = parse(
            "[USR_PREROUTING-R-1] DESCR=\"Port fwd\" IN=ppp0 OUT=br0 \
             SRC=198.51.100.9 DST=203.0.113.4 PROTO=TCP SPT=49152 DPT=443",
        );
        assert_eq!(record.direction, Some(Direction::Nat));
        assert_eq!(record.rule_action, Some(RuleAction::Redirect));
        assert_eq!(record.service_name.as_deref(), Some("https"));
    }

    #[test]
    fn test_empty_descr_is_kept() {
        let record = parse("[X-A-1] DESCR=\"\" IN=br0 OUT=ppp0 SRC=192.168.1.5 DST=1.1.1.1 PROTO=UDP SPT=5353 DPT=53");
        assert_eq!(record.rule_desc.as_deref(), Some(""));
        assert_eq!(record.service_name.as_deref(), Some("DNS"));
    }

    #[test]
    fn test_invalid_ip_nulled_record_kept() {
        let record = parse("[X-B-1] IN=ppp0 OUT= SRC=abcd.efg DST=203.0.113.4 PROTO=TCP DPT=80");
        assert_eq!(record.src_ip, None);
        assert_eq!(record.dst_ip, Some("203.0.113.4".parse().unwrap()));
        assert_eq!(record.rule_action, Some(RuleAction::Block));
    }

    #[test]
    fn test_short_mac_passes_through() {
        assert_eq!(extract_mac("aa:bb:cc"), "aa:bb:cc");
        assert_eq!(
            extract_mac("00:11:22:33:44:55:66:77:88:99:aa:bb:08:00"),
            "66:77:88:99:aa:bb"
        );
    }
}
