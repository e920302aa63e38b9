//! Gatewatch receiver
//!
//! The ingestion process: UDP syslog listener with batched persistence,
//! the cron-like scheduler, and the periodic backfill worker.

pub mod backfill;
pub mod receiver;
pub mod scheduler;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::info;

use gatewatch_core::Result;
use gatewatch_parsers::ParserContext;
use gatewatch_store::Store;

/// Shared, reloadable parser context. Replaced wholesale on SIGUSR2.
pub type SharedContext = Arc<RwLock<ParserContext>>;

/// Rebuild the parser context from the config store. Called on startup
/// and whenever the API process signals a config change.
pub async fn load_parser_context(store: &Store) -> Result<ParserContext> {
    let wan_list: Vec<String> = store.get_config_or("wan_interfaces", vec!["ppp0".to_string()]).await;
    let interface_labels = store
        .get_config_or("interface_labels", std::collections::HashMap::new())
        .await;

    let mut wan_ips: HashSet<std::net::IpAddr> = store
        .wan_ips_from_config()
        .await?
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect();

    // Track whether the authoritative controller-fed mapping exists;
    // it disables the parser's WAN-IP auto-learn fallback.
    let wan_ip_authoritative = store
        .get_config_value("wan_ip_by_iface")
        .await?
        .map(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(false))
        .unwrap_or(false);

    if let Ok(Some(saved)) = store.get_config::<String>("wan_ip").await {
        if let Ok(ip) = saved.parse() {
            wan_ips.insert(ip);
        }
    }

    let context = ParserContext {
        wan_interfaces: wan_list.into_iter().collect(),
        interface_labels,
        wan_ips,
        wan_ip_authoritative,
    };
    info!(
        "Config loaded: WAN={:?}, WAN_IPS={:?}, labels={}",
        context.wan_interfaces,
        context.wan_ips,
        context.interface_labels.len()
    );
    Ok(context)
}
