//! Gatewatch syslog parsers
//!
//! Pure functions turning raw gateway syslog lines into structured
//! [`LogRecord`]s: header matching, subtype detection, per-subtype field
//! extraction, and direction/action derivation. No I/O happens here; the
//! WAN topology the derivation needs comes in through [`ParserContext`].

pub mod dhcp;
pub mod direction;
pub mod dns;
pub mod firewall;
pub mod timestamp;
pub mod wifi;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use gatewatch_core::{LogRecord, LogType};

pub use direction::{derive_action, derive_direction, DirectionInput, DirectionOutcome};
pub use timestamp::parse_syslog_timestamp;

/// Matches: "Feb  8 16:43:49 UDR-UK ..."
static SYSLOG_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<month>\w+)\s+(?P<day>\d+)\s+(?P<time>\d+:\d+:\d+)\s+(?P<host>\S+)\s+(?P<body>.+)$")
        .unwrap()
});

/// RFC 3164 priority prefix, e.g. `<13>`.
static PRIORITY_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^<\d+>").unwrap());

/// WAN topology snapshot the parsers derive direction against. The
/// receiver rebuilds this from the config store on startup and on reload.
#[derive(Debug, Clone)]
pub struct ParserContext {
    /// Interface names designated as WAN uplinks.
    pub wan_interfaces: HashSet<String>,
    /// iface → human label, for the UI.
    pub interface_labels: HashMap<String, String>,
    /// All known WAN addresses of this installation.
    pub wan_ips: HashSet<IpAddr>,
    /// True when `wan_ip_by_iface` exists in config; disables auto-learn.
    pub wan_ip_authoritative: bool,
}

impl Default for ParserContext {
    fn default() -> Self {
        Self {
            // Fallback before setup completes
            wan_interfaces: HashSet::from(["ppp0".to_string()]),
            interface_labels: HashMap::new(),
            wan_ips: HashSet::new(),
            wan_ip_authoritative: false,
        }
    }
}

/// A parsed line plus any WAN IP the direction fallback just learned.
#[derive(Debug)]
pub struct ParsedLog {
    pub record: LogRecord,
    pub learned_wan_ip: Option<IpAddr>,
}

/// Detect the log subtype from the syslog message body. First match wins.
pub fn detect_log_type(body: &str) -> LogType {
    // Firewall: iptables-style fields
    if body.contains("SRC=") && body.contains("DST=") && body.contains("PROTO=") {
        return LogType::Firewall;
    }
    if body.starts_with('[') && body.contains("DESCR=") {
        return LogType::Firewall;
    }

    // DHCP: dnsmasq-dhcp messages
    if body.contains("dnsmasq-dhcp")
        || body.contains("DHCPACK")
        || body.contains("DHCPDISCOVER")
        || body.contains("DHCPREQUEST")
        || body.contains("DHCPOFFER")
    {
        return LogType::Dhcp;
    }

    // DNS: dnsmasq query/reply/forwarded/cached
    if body.contains("dnsmasq")
        && (body.contains("query[")
            || body.contains("reply ")
            || body.contains("forwarded ")
            || body.contains("cached "))
    {
        return LogType::Dns;
    }

    // WiFi: stamgr, hostapd, or stahtd (STA tracker)
    if body.contains("stamgr") || body.contains("hostapd") || body.contains("stahtd") {
        return LogType::Wifi;
    }
    if body.contains("STA ") && (body.contains("associated") || body.contains("authenticated")) {
        return LogType::Wifi;
    }

    // earlyoom, systemd, udapi, other gateway internals
    LogType::System
}

/// Parse a raw syslog line into a structured record.
///
/// Returns `None` when the header cannot be matched, even after stripping
/// a leading `<priority>` token. The original line is preserved verbatim
/// in `raw_log` either way.
pub fn parse_log(raw_log: &str, ctx: &ParserContext) -> Option<ParsedLog> {
    let original = raw_log;

    let caps = match SYSLOG_HEADER.captures(raw_log) {
        Some(caps) => caps,
        None => {
            // Strip the RFC 3164 priority prefix (e.g. <13>) and retry
            let stripped = PRIORITY_PREFIX
                .find(raw_log)
                .map(|m| &raw_log[m.end()..])
                .unwrap_or(raw_log);
            SYSLOG_HEADER.captures(stripped)?
        }
    };

    let timestamp =
        timestamp::parse_syslog_timestamp(&caps["month"], &caps["day"], &caps["time"])?;
    let body = caps.name("body").map(|m| m.as_str()).unwrap_or("");

    let log_type = detect_log_type(body);
    let mut record = LogRecord::new(log_type, timestamp, original.to_string());
    let mut learned_wan_ip = None;

    match log_type {
        LogType::Firewall => {
            learned_wan_ip = firewall::parse_firewall(body, &mut record, ctx);
        }
        LogType::Dns => dns::parse_dns(body, &mut record),
        LogType::Dhcp => dhcp::parse_dhcp(body, &mut record),
        LogType::Wifi => wifi::parse_wifi(body, &mut record),
        LogType::System | LogType::Unknown => {}
    }

    Some(ParsedLog {
        record,
        learned_wan_ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewatch_core::{Direction, RuleAction};

    fn ctx() -> ParserContext {
        ParserContext::default()
    }

    #[test]
    fn test_detect_precedence() {
        assert_eq!(
            detect_log_type("[X] IN=br0 OUT= SRC=1.2.3.4 DST=5.6.7.8 PROTO=TCP"),
            LogType::Firewall
        );
        assert_eq!(detect_log_type("[WAN_IN-D-1] DESCR=\"x\""), LogType::Firewall);
        assert_eq!(
            detect_log_type("dnsmasq-dhcp[1]: DHCPACK(br0) 192.168.1.2 aa:bb:cc:dd:ee:ff"),
            LogType::Dhcp
        );
        assert_eq!(
            detect_log_type("dnsmasq[1]: query[A] example.com from 192.168.1.2"),
            LogType::Dns
        );
        assert_eq!(
            detect_log_type("hostapd: STA aa:bb:cc:dd:ee:ff associated"),
            LogType::Wifi
        );
        assert_eq!(detect_log_type("systemd[1]: Started unit foo"), LogType::System);
    }

    #[test]
    fn test_full_inbound_drop_scenario() {
        let line = "Feb  8 16:43:49 router-host [WAN_IN-D-123] DESCR=\"Drop\" IN=ppp0 OUT= \
                    MAC=aa:bb:cc:dd:ee:ff:11:22:33:44:55:66:08:00 \
                    SRC=198.51.100.7 DST=203.0.113.4 PROTO=TCP SPT=54321 DPT=22";
        let parsed = parse_log(line, &ctx()).unwrap();
        let record = parsed.record;
        assert_eq!(record.log_type, LogType::Firewall);
        assert_eq!(record.direction, Some(Direction::Inbound));
        assert_eq!(record.rule_action, Some(RuleAction::Block));
        assert_eq!(record.service_name.as_deref(), Some("ssh"));
        assert_eq!(record.src_ip, Some("198.51.100.7".parse().unwrap()));
        assert_eq!(record.raw_log, line);
    }

    #[test]
    fn test_priority_prefix_stripped() {
        let line = "<13>Feb  8 16:43:49 router-host systemd[1]: Started unit foo";
        let parsed = parse_log(line, &ctx()).unwrap();
        assert_eq!(parsed.record.log_type, LogType::System);
        // raw_log keeps the original line, prefix included
        assert_eq!(parsed.record.raw_log, line);
    }

    #[test]
    fn test_unparseable_header_is_dropped() {
        assert!(parse_log("not a syslog line", &ctx()).is_none());
        assert!(parse_log("", &ctx()).is_none());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let line = "Feb  8 16:43:49 router [X-A-1] IN=br0 OUT=ppp0 SRC=192.168.1.5 DST=8.8.8.8 PROTO=UDP SPT=40000 DPT=53";
        let a = parse_log(line, &ctx()).unwrap().record;
        let b = parse_log(line, &ctx()).unwrap().record;
        assert_eq!(a.src_ip, b.src_ip);
        assert_eq!(a.direction, b.direction);
        assert_eq!(a.service_name, b.service_name);
        assert_eq!(a.raw_log, b.raw_log);
    }
}
