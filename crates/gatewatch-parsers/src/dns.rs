//! DNS (dnsmasq) log line parsing.

use std::sync::LazyLock;

use regex::Regex;

use gatewatch_core::LogRecord;

static DNS_QUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"query\[([A-Z]+)\]\s+(\S+)\s+from\s+([0-9a-fA-F:.]+)").unwrap());
static DNS_REPLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"reply\s+(\S+)\s+is\s+(.+)").unwrap());
static DNS_FORWARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"forwarded\s+(\S+)\s+to\s+([0-9a-fA-F:.]+)").unwrap());
static DNS_CACHED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cached\s+(\S+)\s+is\s+(.+)").unwrap());

pub fn parse_dns(body: &str, record: &mut LogRecord) {
    if let Some(caps) = DNS_QUERY.captures(body) {
        record.dns_type = Some(caps[1].to_string());
        record.dns_query = Some(caps[2].to_string());
        record.src_ip = caps[3].parse().ok();
        return;
    }

    if let Some(caps) = DNS_REPLY.captures(body) {
        record.dns_query = Some(caps[1].to_string());
        record.dns_answer = Some(caps[2].to_string());
        return;
    }

    if let Some(caps) = DNS_FORWARD.captures(body) {
        record.dns_query = Some(caps[1].to_string());
        record.dst_ip = caps[2].parse().ok();
        return;
    }

    if let Some(caps) = DNS_CACHED.captures(body) {
        record.dns_query = Some(caps[1].to_string());
        record.dns_answer = Some(caps[2].to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gatewatch_core::LogType;

    fn parse(body: &str) -> LogRecord {
        let mut record = LogRecord::new(LogType::Dns, Utc::now(), body.to_string());
        parse_dns(body, &mut record);
        record
    }

    #[test]
    fn test_query_line() {
        let record = parse("dnsmasq[1234]: query[A] example.com from 192.168.1.50");
        assert_eq!(record.dns_type.as_deref(), Some("A"));
        assert_eq!(record.dns_query.as_deref(), Some("example.com"));
        assert_eq!(record.src_ip, Some("192.168.1.50".parse().unwrap()));
    }

    #[test]
    fn test_reply_line() {
        let record = parse("dnsmasq[1234]: reply example.com is 93.184.216.34");
        assert_eq!(record.dns_query.as_deref(), Some("example.com"));
        assert_eq!(record.dns_answer.as_deref(), Some("93.184.216.34"));
    }

    #[test]
    fn test_forwarded_line() {
        let record = parse("dnsmasq[1234]: forwarded example.com to 1.1.1.1");
        assert_eq!(record.dns_query.as_deref(), Some("example.com"));
        assert_eq!(record.dst_ip, Some("1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_cached_line() {
        let record = parse("dnsmasq[1234]: cached dns.google is 8.8.8.8");
        assert_eq!(record.dns_query.as_deref(), Some("dns.google"));
        assert_eq!(record.dns_answer.as_deref(), Some("8.8.8.8"));
    }

    #[test]
    fn test_unmatched_body_keeps_raw_only() {
        let record = parse("dnsmasq[1234]: using nameserver 1.1.1.1#53");
        assert_eq!(record.dns_query, None);
        assert_eq!(record.dns_answer, None);
    }
}
