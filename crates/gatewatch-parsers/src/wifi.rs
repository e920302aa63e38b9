//! WiFi (stamgr / hostapd / stahtd) log line parsing.

use std::sync::LazyLock;

use regex::Regex;

use gatewatch_core::LogRecord;

static WIFI_EVENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+):\s+STA\s+([0-9a-f:]+)").unwrap());
static WIFI_ASSOC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"STA\s+([0-9a-f:]+)\s+.*?(associated|disassociated|deauthenticated|authenticated)")
        .unwrap()
});

pub fn parse_wifi(body: &str, record: &mut LogRecord) {
    // stahtd emits STA tracker events as JSON blobs
    if body.contains("stahtd") {
        if let Some(json_start) = body.find('{') {
            match serde_json::from_str::<serde_json::Value>(&body[json_start..]) {
                Ok(data) => {
                    record.mac_address = data
                        .get("mac")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    record.wifi_event = data
                        .get("event_type")
                        .or_else(|| data.get("message_type"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .or_else(|| Some("stahtd".to_string()));
                }
                Err(_) => record.wifi_event = Some("stahtd".to_string()),
            }
            return;
        }
    }

    if let Some(caps) = WIFI_ASSOC.captures(body) {
        record.mac_address = Some(caps[1].to_string());
        record.wifi_event = Some(caps[2].to_string());
        return;
    }

    if let Some(caps) = WIFI_EVENT.captures(body) {
        record.wifi_event = Some(caps[1].to_string());
        record.mac_address = Some(caps[2].to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gatewatch_core::LogType;

    fn parse(body: &str) -> LogRecord {
        let mut record = LogRecord::new(LogType::Wifi, Utc::now(), body.to_string());
        parse_wifi(body, &mut record);
        record
    }

    #[test]
    fn test_hostapd_association() {
        let record = parse("hostapd: ath0: STA aa:bb:cc:dd:ee:ff IEEE 802.11: associated");
        assert_eq!(record.mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(record.wifi_event.as_deref(), Some("associated"));
    }

    #[test]
    fn test_stahtd_json_event() {
        let record = parse(
            r#"stahtd[321]: [STA-TRACKER].stahtd_dump_event(): {"mac":"aa:bb:cc:dd:ee:ff","event_type":"fixup","vap":"ath2"}"#,
        );
        assert_eq!(record.mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(record.wifi_event.as_deref(), Some("fixup"));
    }

    #[test]
    fn test_stahtd_malformed_json_falls_back() {
        let record = parse("stahtd[321]: event {not json");
        assert_eq!(record.wifi_event.as_deref(), Some("stahtd"));
        assert_eq!(record.mac_address, None);
    }

    #[test]
    fn test_generic_sta_event() {
        let record = parse("stamgr: auth_done: STA 11:22:33:44:55:66 state change");
        assert_eq!(record.wifi_event.as_deref(), Some("auth_done"));
        assert_eq!(record.mac_address.as_deref(), Some("11:22:33:44:55:66"));
    }
}
