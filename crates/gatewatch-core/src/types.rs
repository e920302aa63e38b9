//! Core type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Log subtype, detected from the syslog message body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Firewall,
    Dns,
    Dhcp,
    Wifi,
    System,
    Unknown,
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogType::Firewall => write!(f, "firewall"),
            LogType::Dns => write!(f, "dns"),
            LogType::Dhcp => write!(f, "dhcp"),
            LogType::Wifi => write!(f, "wifi"),
            LogType::System => write!(f, "system"),
            LogType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Packet traversal relative to the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    InterVlan,
    Nat,
    Vpn,
    Local,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
            Direction::InterVlan => write!(f, "inter_vlan"),
            Direction::Nat => write!(f, "nat"),
            Direction::Vpn => write!(f, "vpn"),
            Direction::Local => write!(f, "local"),
        }
    }
}

/// Firewall verdict derived from the rule-name convention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Block,
    Redirect,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Block => write!(f, "block"),
            RuleAction::Redirect => write!(f, "redirect"),
        }
    }
}

/// One parsed syslog line, ready for enrichment and insertion.
///
/// Every field except `timestamp`, `log_type`, and `raw_log` is optional;
/// which fields are populated depends on the subtype.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
    pub direction: Option<Direction>,

    pub src_ip: Option<IpAddr>,
    pub src_port: Option<i32>,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: Option<i32>,
    pub protocol: Option<String>,
    pub service_name: Option<String>,

    pub rule_name: Option<String>,
    pub rule_desc: Option<String>,
    pub rule_action: Option<RuleAction>,
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
}

impl LogRecord {
    /// Blank record of the given subtype; parsers fill in what they find.
    pub fn new(log_type: LogType, timestamp: DateTime<Utc>, raw_log: String) -> Self {
        Self {
            timestamp,
            log_type,
            direction: None,
            src_ip: None,
            src_port: None,
            dst_ip: None,
            dst_port: None,
            protocol: None,
            service_name: None,
            rule_name: None,
            rule_desc: None,
            rule_action: None,
            interface_in: None,
            interface_out: None,
            mac_address: None,
            hostname: None,
            dhcp_event: None,
            dns_query: None,
            dns_type: None,
            dns_answer: None,
            wifi_event: None,
            geo_country: None,
            geo_city: None,
            geo_lat: None,
            geo_lon: None,
            asn_number: None,
            asn_name: None,
            rdns: None,
            threat_score: None,
            threat_categories: None,
            abuse_usage_type: None,
            abuse_hostnames: None,
            abuse_total_reports: None,
            abuse_last_reported: None,
            abuse_is_whitelisted: None,
            abuse_is_tor: None,
            raw_log,
        }
    }
}

/// One threat-intelligence verdict for an IP, as cached in `ip_threats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreatEntry {
    pub threat_score: i32,
    pub threat_categories: Vec<String>,
    pub abuse_usage_type: Option<String>,
    pub abuse_hostnames: Option<String>,
    pub abuse_total_reports: Option<i32>,
    pub abuse_last_reported: Option<DateTime<Utc>>,
    pub abuse_is_whitelisted: Option<bool>,
    pub abuse_is_tor: Option<bool>,
}

impl ThreatEntry {
    /// Entry shape produced by a blacklist bulk import: score only, one
    /// synthetic category.
    pub fn blacklisted(score: i32) -> Self {
        Self {
            threat_score: score,
            threat_categories: vec!["blacklist".to_string()],
            ..Default::default()
        }
    }

    /// Copy the entry's fields onto a log record.
    pub fn apply_to(&self, record: &mut LogRecord) {
        record.threat_score = Some(self.threat_score);
        record.threat_categories = Some(self.threat_categories.clone());
        record.abuse_usage_type = self.abuse_usage_type.clone();
        record.abuse_hostnames = self.abuse_hostnames.clone();
        record.abuse_total_reports = self.abuse_total_reports;
        record.abuse_last_reported = self.abuse_last_reported;
        record.abuse_is_whitelisted = self.abuse_is_whitelisted;
        record.abuse_is_tor = self.abuse_is_tor;
    }
}

/// Last-known threat-service rate-limit state, as mirrored in the shared
/// stats file and the `abuseipdb_rate_limit` config key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSnapshot {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    /// Unix timestamp (seconds) when the provider's quota renews.
    pub reset_at: Option<i64>,
    /// Unix timestamp until which all calls are short-circuited, if paused.
    pub paused_until: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_display_tokens() {
        assert_eq!(LogType::Firewall.to_string(), "firewall");
        assert_eq!(Direction::InterVlan.to_string(), "inter_vlan");
        assert_eq!(RuleAction::Redirect.to_string(), "redirect");
    }

    #[test]
    fn test_blacklist_entry_shape() {
        let entry = ThreatEntry::blacklisted(100);
        assert_eq!(entry.threat_score, 100);
        assert_eq!(entry.threat_categories, vec!["blacklist"]);
        assert!(entry.abuse_usage_type.is_none());
    }

    #[test]
    fn test_apply_to_record() {
        let entry = ThreatEntry {
            threat_score: 80,
            threat_categories: vec!["14".into(), "18".into()],
            abuse_usage_type: Some("Data Center/Web Hosting/Transit".into()),
            ..Default::default()
        };
        let mut record = LogRecord::new(LogType::Firewall, Utc::now(), String::new());
        entry.apply_to(&mut record);
        assert_eq!(record.threat_score, Some(80));
        assert_eq!(record.threat_categories.as_deref(), Some(&["14".to_string(), "18".to_string()][..]));
    }
}
