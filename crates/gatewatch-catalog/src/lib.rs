//! IANA service-name catalog
//!
//! Maps `(port, transport protocol)` to IANA-registered service names and
//! descriptions. The table is compiled in; it covers the well-known range
//! plus the registered ports that actually show up in gateway traffic.
//! Lookups normalise the protocol to lowercase (firewall logs carry it
//! uppercase) and apply display-friendly overrides.

/// `(port, protocol, short name, description)`; description is empty when
/// IANA lists none beyond the name itself.
static SERVICES: &[(u16, &str, &str, &str)] = &[
    (7, "tcp", "echo", "Echo"),
    (7, "udp", "echo", "Echo"),
    (20, "tcp", "ftp-data", "File Transfer [Default Data]"),
    (21, "tcp", "ftp", "File Transfer Protocol [Control]"),
    (22, "tcp", "ssh", "The Secure Shell (SSH) Protocol"),
    (22, "udp", "ssh", "The Secure Shell (SSH) Protocol"),
    (23, "tcp", "telnet", "Telnet"),
    (25, "tcp", "smtp", "Simple Mail Transfer"),
    (37, "tcp", "time", "Time"),
    (37, "udp", "time", "Time"),
    (43, "tcp", "nicname", "Who Is"),
    (53, "tcp", "domain", "Domain Name Server"),
    (53, "udp", "domain", "Domain Name Server"),
    (67, "udp", "bootps", "Bootstrap Protocol Server"),
    (68, "udp", "bootpc", "Bootstrap Protocol Client"),
    (69, "udp", "tftp", "Trivial File Transfer"),
    (79, "tcp", "finger", "Finger"),
    (80, "tcp", "http", "World Wide Web HTTP"),
    (80, "udp", "http", "World Wide Web HTTP"),
    (88, "tcp", "kerberos", "Kerberos"),
    (88, "udp", "kerberos", "Kerberos"),
    (110, "tcp", "pop3", "Post Office Protocol - Version 3"),
    (111, "tcp", "sunrpc", "SUN Remote Procedure Call"),
    (111, "udp", "sunrpc", "SUN Remote Procedure Call"),
    (113, "tcp", "ident", ""),
    (119, "tcp", "nntp", "Network News Transfer Protocol"),
    (123, "udp", "ntp", "Network Time Protocol"),
    (135, "tcp", "epmap", "DCE endpoint resolution"),
    (135, "udp", "epmap", "DCE endpoint resolution"),
    (137, "udp", "netbios-ns", "NETBIOS Name Service"),
    (138, "udp", "netbios-dgm", "NETBIOS Datagram Service"),
    (139, "tcp", "netbios-ssn", "NETBIOS Session Service"),
    (143, "tcp", "imap", "Internet Message Access Protocol"),
    (161, "udp", "snmp", "SNMP"),
    (162, "udp", "snmptrap", "SNMPTRAP"),
    (179, "tcp", "bgp", "Border Gateway Protocol"),
    (194, "tcp", "irc", "Internet Relay Chat Protocol"),
    (389, "tcp", "ldap", "Lightweight Directory Access Protocol"),
    (389, "udp", "ldap", "Lightweight Directory Access Protocol"),
    (427, "tcp", "svrloc", "Server Location"),
    (427, "udp", "svrloc", "Server Location"),
    (443, "tcp", "https", "http protocol over TLS/SSL"),
    (443, "udp", "https", "http protocol over TLS/SSL (QUIC)"),
    (445, "tcp", "microsoft-ds", "Microsoft-DS"),
    (464, "tcp", "kpasswd", "kpasswd"),
    (465, "tcp", "submissions", "Message Submission over TLS protocol"),
    (500, "udp", "isakmp", "isakmp"),
    (514, "udp", "syslog", "Syslog"),
    (515, "tcp", "printer", "spooler"),
    (520, "udp", "router", "local routing process"),
    (546, "udp", "dhcpv6-client", "DHCPv6 Client"),
    (547, "udp", "dhcpv6-server", "DHCPv6 Server"),
    (548, "tcp", "afpovertcp", "AFP over TCP"),
    (554, "tcp", "rtsp", "Real Time Streaming Protocol (RTSP)"),
    (554, "udp", "rtsp", "Real Time Streaming Protocol (RTSP)"),
    (587, "tcp", "submission", "Message Submission"),
    (631, "tcp", "ipp", "IPP (Internet Printing Protocol)"),
    (631, "udp", "ipp", "IPP (Internet Printing Protocol)"),
    (636, "tcp", "ldaps", "ldap protocol over TLS/SSL"),
    (853, "tcp", "domain-s", "DNS query-response protocol run over TLS"),
    (853, "udp", "domain-s", "DNS query-response protocol run over DTLS or QUIC"),
    (873, "tcp", "rsync", "rsync"),
    (902, "tcp", "ideafarm-door", "self documenting Telnet Door"),
    (989, "tcp", "ftps-data", "ftp protocol, data, over TLS/SSL"),
    (990, "tcp", "ftps", "ftp protocol, control, over TLS/SSL"),
    (993, "tcp", "imaps", "IMAP over TLS protocol"),
    (995, "tcp", "pop3s", "POP3 over TLS protocol"),
    (1024, "tcp", "blackjack", "network blackjack"),
    (1080, "tcp", "socks", "Socks"),
    (1194, "udp", "openvpn", "OpenVPN"),
    (1194, "tcp", "openvpn", "OpenVPN"),
    (1433, "tcp", "ms-sql-s", "Microsoft-SQL-Server"),
    (1434, "udp", "ms-sql-m", "Microsoft-SQL-Monitor"),
    (1521, "tcp", "ncube-lm", "nCube License Manager"),
    (1701, "udp", "l2tp", "l2tp"),
    (1723, "tcp", "pptp", "pptp"),
    (1812, "udp", "radius", "RADIUS"),
    (1813, "udp", "radius-acct", "RADIUS Accounting"),
    (1883, "tcp", "mqtt", "Message Queuing Telemetry Transport Protocol"),
    (1900, "udp", "ssdp", "SSDP"),
    (2049, "tcp", "nfs", "Network File System - Sun Microsystems"),
    (2049, "udp", "nfs", "Network File System - Sun Microsystems"),
    (2082, "tcp", "infowave", "Infowave Mobility Server"),
    (2083, "tcp", "radsec", "Secure Radius Service"),
    (2086, "tcp", "gnunet", "GNUnet"),
    (2087, "tcp", "eli", "ELI - Event Logging Integration"),
    (2123, "udp", "gtp-control", "GTP-Control Plane (3GPP)"),
    (2152, "udp", "gtp-user", "GTP-User Plane (3GPP)"),
    (2222, "tcp", "EtherNetIP-1", "EtherNet/IP I/O"),
    (2375, "tcp", "docker", "Docker REST API (plain text)"),
    (2376, "tcp", "docker-s", "Docker REST API (ssl)"),
    (3000, "tcp", "hbci", "HBCI"),
    (3074, "tcp", "xbox", "Xbox game port"),
    (3074, "udp", "xbox", "Xbox game port"),
    (3128, "tcp", "ndl-aas", "Active API Server Port"),
    (3268, "tcp", "msft-gc", "Microsoft Global Catalog"),
    (3306, "tcp", "mysql", "MySQL"),
    (3389, "tcp", "ms-wbt-server", "MS WBT Server"),
    (3389, "udp", "ms-wbt-server", "MS WBT Server"),
    (3478, "udp", "stun", "Session Traversal Utilities for NAT (STUN) port"),
    (3478, "tcp", "stun", "Session Traversal Utilities for NAT (STUN) port"),
    (3544, "udp", "teredo", "teredo port"),
    (3690, "tcp", "svn", "Subversion"),
    (4443, "tcp", "pharos", "PharosCentral"),
    (4500, "udp", "ipsec-nat-t", "IPsec NAT-Traversal"),
    (4789, "udp", "vxlan", "Virtual eXtensible Local Area Network (VXLAN)"),
    (5000, "tcp", "commplex-main", ""),
    (5001, "tcp", "commplex-link", ""),
    (5004, "udp", "rtp-data", "RTP media data"),
    (5005, "udp", "rtp", "RTP control protocol"),
    (5060, "tcp", "sip", "SIP"),
    (5060, "udp", "sip", "SIP"),
    (5061, "tcp", "sips", "SIP-TLS"),
    (5222, "tcp", "xmpp-client", "XMPP Client Connection"),
    (5223, "tcp", "hpvirtgrp", "HP Virtual Machine Group Management"),
    (5228, "tcp", "hpvroom", "HP Virtual Room Service"),
    (5269, "tcp", "xmpp-server", "XMPP Server Connection"),
    (5349, "tcp", "stuns", "Reservation Protocol (RSVP) over TLS"),
    (5353, "udp", "mdns", "Multicast DNS"),
    (5355, "udp", "llmnr", "LLMNR"),
    (5432, "tcp", "postgresql", "PostgreSQL Database"),
    (5540, "udp", "matter", "Matter Operational Discovery and Communi"),
    (5671, "tcp", "amqps", "amqp protocol over TLS/SSL"),
    (5672, "tcp", "amqp", "AMQP"),
    (5683, "udp", "coap", "Constrained Application Protocol (CoAP)"),
    (5900, "tcp", "rfb", "Remote Framebuffer"),
    (6379, "tcp", "redis", "An advanced key-value cache and store"),
    (6443, "tcp", "sun-sr-https", "Service Registry Default HTTPS Domain"),
    (6881, "tcp", "bittorrent", "BitTorrent"),
    (6881, "udp", "bittorrent", "BitTorrent"),
    (7070, "tcp", "arcp", "ARCP"),
    (7443, "tcp", "oracleas-https", "Oracle Application Server HTTPS"),
    (8000, "tcp", "irdmi", "iRDMI"),
    (8080, "tcp", "http-alt", "HTTP Alternate (see port 80)"),
    (8080, "udp", "http-alt", "HTTP Alternate (see port 80)"),
    (8123, "tcp", "polipo", "Polipo open source web proxy cache"),
    (8443, "tcp", "pcsync-https", "PCsync HTTPS"),
    (8843, "tcp", "unifi-https", "UniFi hotspot portal HTTPS"),
    (8880, "tcp", "cddbp-alt", "CDDBP"),
    (8883, "tcp", "secure-mqtt", "Secure MQTT"),
    (9000, "tcp", "cslistener", "CSlistener"),
    (9090, "tcp", "websm", "WebSM"),
    (9100, "tcp", "pdl-datastream", "Printer PDL Data Stream"),
    (9443, "tcp", "tungsten-https", "WSO2 Tungsten HTTPS"),
    (10001, "udp", "scp-config", "SCP Configuration"),
    (25565, "tcp", "minecraft", "Minecraft server"),
    (27015, "udp", "steam", "Steam game server"),
    (32400, "tcp", "plex", "Plex Media Server"),
    (51820, "udp", "wireguard", "WireGuard"),
];

/// Short names that read better under a different label in the UI.
static DISPLAY_OVERRIDES: &[(&str, &str)] = &[("domain", "DNS")];

fn normalize_protocol(protocol: Option<&str>) -> String {
    protocol.unwrap_or("tcp").to_ascii_lowercase()
}

fn find(port: u16, protocol: &str) -> Option<&'static (u16, &'static str, &'static str, &'static str)> {
    SERVICES.iter().find(|(p, proto, _, _)| *p == port && *proto == protocol)
}

/// Service name for `(port, protocol)`, with display overrides applied.
/// Protocol is case-insensitive and defaults to `tcp`; a missing port
/// (ICMP and friends) yields `None`.
pub fn service_name(port: Option<u16>, protocol: Option<&str>) -> Option<String> {
    let port = port?;
    let proto = normalize_protocol(protocol);
    let name = find(port, &proto).map(|(_, _, name, _)| *name)?;
    let display = DISPLAY_OVERRIDES
        .iter()
        .find(|(from, _)| *from == name)
        .map(|(_, to)| *to)
        .unwrap_or(name);
    Some(display.to_string())
}

/// Longer-form IANA description, only when it differs from the short name.
pub fn service_description(port: Option<u16>, protocol: Option<&str>) -> Option<String> {
    let port = port?;
    let proto = normalize_protocol(protocol);
    find(port, &proto)
        .filter(|(_, _, name, desc)| !desc.is_empty() && desc != name)
        .map(|(_, _, _, desc)| desc.to_string())
}

/// Full `(port, protocol, name)` mapping, for the historical-row backfill
/// that joins the catalog against the logs table in bulk.
pub fn mappings() -> impl Iterator<Item = (u16, &'static str, String)> {
    SERVICES.iter().map(|(port, proto, name, _)| {
        let display = DISPLAY_OVERRIDES
            .iter()
            .find(|(from, _)| from == name)
            .map(|(_, to)| *to)
            .unwrap_or(name);
        (*port, *proto, display.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_lookups() {
        assert_eq!(service_name(Some(80), Some("TCP")), Some("http".to_string()));
        assert_eq!(service_name(Some(443), Some("tcp")), Some("https".to_string()));
        assert_eq!(service_name(Some(22), Some("tcp")), Some("ssh".to_string()));
    }

    #[test]
    fn test_display_override() {
        // IANA name is "domain"; the UI wants "DNS"
        assert_eq!(service_name(Some(53), Some("udp")), Some("DNS".to_string()));
        assert_eq!(service_name(Some(53), Some("tcp")), Some("DNS".to_string()));
    }

    #[test]
    fn test_protocol_defaults_and_misses() {
        assert_eq!(service_name(Some(80), None), Some("http".to_string()));
        assert_eq!(service_name(None, Some("icmp")), None);
        assert_eq!(service_name(Some(60000), Some("tcp")), None);
        // port registered for udp only
        assert_eq!(service_name(Some(123), Some("tcp")), None);
    }

    #[test]
    fn test_description_differs_from_name() {
        assert_eq!(
            service_description(Some(80), Some("tcp")),
            Some("World Wide Web HTTP".to_string())
        );
        // no description listed
        assert_eq!(service_description(Some(113), Some("tcp")), None);
    }

    #[test]
    fn test_mappings_carry_overrides() {
        let dns = mappings().find(|(port, proto, _)| *port == 53 && *proto == "udp");
        assert_eq!(dns.map(|(_, _, name)| name), Some("DNS".to_string()));
    }
}
