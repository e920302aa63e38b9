//! Background client/device polling and name-map maintenance.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use gatewatch_store::{ClientRecord, DeviceRecord};

use crate::UnifiClient;

fn epoch_to_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_i64)
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn client_from_sta(c: &Value) -> Option<ClientRecord> {
    let mac = str_field(c, "mac")?.to_lowercase();
    Some(ClientRecord {
        mac,
        ip: str_field(c, "ip").or_else(|| str_field(c, "last_ip")),
        device_name: str_field(c, "name"),
        hostname: str_field(c, "hostname"),
        oui: str_field(c, "oui"),
        network: str_field(c, "network"),
        essid: str_field(c, "essid"),
        vlan: c.get("vlan").and_then(Value::as_i64).map(|v| v as i32),
        is_fixed_ip: c.get("use_fixedip").and_then(Value::as_bool),
        is_wired: c.get("is_wired").and_then(Value::as_bool),
        last_seen: epoch_to_datetime(c.get("last_seen")),
    })
}

fn client_from_alluser(c: &Value) -> Option<ClientRecord> {
    let mac = str_field(c, "mac")?.to_lowercase();
    Some(ClientRecord {
        mac,
        // alluser has no live 'ip' field
        ip: str_field(c, "last_ip"),
        device_name: str_field(c, "name"),
        hostname: str_field(c, "hostname"),
        oui: str_field(c, "oui"),
        network: str_field(c, "last_connection_network_name"),
        essid: None,
        vlan: None,
        is_fixed_ip: c.get("use_fixedip").and_then(Value::as_bool),
        is_wired: c.get("is_wired").and_then(Value::as_bool),
        last_seen: epoch_to_datetime(c.get("last_seen")),
    })
}

fn device_from_value(d: &Value) -> Option<DeviceRecord> {
    let mac = str_field(d, "mac")?.to_lowercase();
    Some(DeviceRecord {
        mac,
        ip: str_field(d, "ip"),
        device_name: str_field(d, "name"),
        model: str_field(d, "model"),
        shortname: str_field(d, "shortname"),
        device_type: str_field(d, "type"),
        firmware: str_field(d, "version"),
        serial: str_field(d, "serial"),
        state: d.get("state").and_then(Value::as_i64).map(|v| v as i32),
        uptime: d.get("uptime").and_then(Value::as_i64),
    })
}

/// True when this stat/device entry is a gateway: it carries wan1/wan2
/// uplink objects.
fn is_gateway(d: &Value) -> bool {
    d.as_object()
        .map(|obj| {
            obj.keys().any(|k| {
                k.strip_prefix("wan")
                    .map(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

impl UnifiClient {
    /// Start (or restart) the polling daemon. Bumping the generation
    /// counter retires any previous loop.
    pub async fn start_polling(self: Arc<Self>) {
        let generation = self.poll_generation.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.enabled().await {
            return;
        }

        let interval = self.poll_interval().await;

        // Seed the maps from the cache tables so names resolve before the
        // first poll completes.
        match self.store.load_name_maps().await {
            Ok((mut ip_map, mac_map)) => {
                let wan_ip_names: HashMap<String, String> =
                    self.store.get_config_or("wan_ip_names", HashMap::new()).await;
                ip_map.extend(wan_ip_names);
                let count = ip_map.len();
                *self.names.lock().unwrap_or_else(|e| e.into_inner()) = (ip_map, mac_map);
                if count > 0 {
                    info!("Loaded {count} cached device names from the store");
                }
            }
            Err(e) => warn!("Failed to load cached device names: {e}"),
        }

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                if client.poll_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                client.poll().await;
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        });
        info!("Controller polling started (interval={interval}s)");
    }

    pub fn stop_polling(&self) {
        self.poll_generation.fetch_add(1, Ordering::SeqCst);
        info!("Controller polling stopped");
    }

    /// One poll cycle: fetch clients + devices, rebuild the name maps,
    /// refresh WAN/gateway config, persist the caches.
    pub async fn poll(&self) -> bool {
        if !self.enabled().await {
            return false;
        }
        let features = self.features().await;

        let result: Result<(Vec<ClientRecord>, Vec<DeviceRecord>), crate::UnifiError> = async {
            let clients = if features.client_names {
                self.poll_clients().await
            } else {
                Vec::new()
            };
            let devices = if features.device_discovery {
                self.poll_devices().await?
            } else {
                Vec::new()
            };
            Ok((clients, devices))
        }
        .await;

        let (clients, devices) = match result {
            Ok(pair) => pair,
            Err(e) => {
                let mut status = self.poll_status.lock().unwrap_or_else(|e| e.into_inner());
                status.last_error = Some(e.to_string());
                warn!("Controller poll failed: {e}");
                return false;
            }
        };

        // Oldest first, so the most recently seen client wins a shared IP
        let mut clients_sorted = clients.clone();
        clients_sorted.sort_by_key(|c| c.last_seen.unwrap_or(DateTime::<Utc>::MIN_UTC));

        let mut ip_map: HashMap<String, String> = HashMap::new();
        let mut mac_map: HashMap<String, String> = HashMap::new();
        for c in &clients_sorted {
            if let Some(name) = c.display_name() {
                mac_map.insert(c.mac.clone(), name.to_string());
                if let Some(ip) = &c.ip {
                    ip_map.insert(ip.clone(), name.to_string());
                }
            }
        }
        for d in &devices {
            if let Some(name) = d.display_name() {
                mac_map.insert(d.mac.clone(), name.to_string());
                if let Some(ip) = &d.ip {
                    ip_map.insert(ip.clone(), name.to_string());
                }
            }
        }

        if features.network_config {
            if let Err(e) = self.sync_network_metadata(&devices, &mut ip_map).await {
                warn!("Failed to extract network config: {e}");
            }
        }

        // Atomic swap under the lock
        {
            let mut maps = self.names.lock().unwrap_or_else(|e| e.into_inner());
            *maps = (ip_map, mac_map);
        }

        if !clients.is_empty() {
            if let Err(e) = self.store.upsert_clients(&clients).await {
                warn!("Failed to persist clients: {e}");
            }
        }
        if !devices.is_empty() {
            if let Err(e) = self.store.upsert_devices(&devices).await {
                warn!("Failed to persist devices: {e}");
            }
        }

        {
            let mut status = self.poll_status.lock().unwrap_or_else(|e| e.into_inner());
            status.last_poll = Some(Utc::now());
            status.last_error = None;
            status.client_count = clients.len();
            status.device_count = devices.len();
        }
        info!("Controller poll: {} clients, {} devices synced", clients.len(), devices.len());
        true
    }

    /// Active clients (rich view) merged over all-time clients
    /// (historical view); active wins on conflict.
    async fn poll_clients(&self) -> Vec<ClientRecord> {
        let mut merged: HashMap<String, ClientRecord> = HashMap::new();

        match self.get_classic("stat/alluser").await {
            Ok(data) => {
                for c in data.pointer("/data").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(record) = client_from_alluser(c) {
                        merged.insert(record.mac.clone(), record);
                    }
                }
            }
            Err(e) => warn!("Failed to fetch stat/alluser: {e}"),
        }

        match self.get_classic("stat/sta").await {
            Ok(data) => {
                for c in data.pointer("/data").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(record) = client_from_sta(c) {
                        merged.insert(record.mac.clone(), record);
                    }
                }
            }
            Err(e) => warn!("Failed to fetch stat/sta: {e}"),
        }

        merged.into_values().collect()
    }

    async fn poll_devices(&self) -> Result<Vec<DeviceRecord>, crate::UnifiError> {
        match self.get_classic("stat/device").await {
            Ok(data) => Ok(data
                .pointer("/data")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(device_from_value)
                .collect()),
            Err(e) => {
                warn!("Failed to fetch stat/device: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Write WAN and gateway metadata back into config. Keeps WAN IPs
    /// current through PPPoE reconnections, DHCP renewals, and failover.
    async fn sync_network_metadata(
        &self,
        devices: &[DeviceRecord],
        ip_map: &mut HashMap<String, String>,
    ) -> Result<(), crate::UnifiError> {
        let net_config = self.network_config().await?;

        // The gateway's own name labels every WAN IP
        let gateway_name = {
            let raw_devices = self.get_classic("stat/device").await.ok();
            raw_devices
                .as_ref()
                .and_then(|data| data.pointer("/data"))
                .and_then(Value::as_array)
                .and_then(|entries| entries.iter().find(|d| is_gateway(d)))
                .and_then(|d| str_field(d, "name").or_else(|| str_field(d, "model")))
                .or_else(|| {
                    devices
                        .iter()
                        .find(|d| d.device_type.as_deref() == Some("ugw"))
                        .and_then(|d| d.display_name().map(str::to_string))
                })
        };

        if let Some(gateway_name) = &gateway_name {
            let mut wan_ip_names: HashMap<String, String> = HashMap::new();
            for wan in &net_config.wan_interfaces {
                if let Some(wan_ip) = &wan.wan_ip {
                    ip_map.insert(wan_ip.clone(), gateway_name.clone());
                    wan_ip_names.insert(wan_ip.clone(), gateway_name.clone());
                }
            }
            if !wan_ip_names.is_empty() {
                let _ = self.store.set_config("wan_ip_names", &wan_ip_names).await;
            }
        }

        let wan_ip_by_iface: HashMap<String, String> = net_config
            .wan_interfaces
            .iter()
            .filter_map(|w| {
                w.wan_ip
                    .as_ref()
                    .map(|ip| (w.physical_interface.clone(), ip.clone()))
            })
            .collect();
        if !wan_ip_by_iface.is_empty() {
            let _ = self.store.set_config("wan_ip_by_iface", &wan_ip_by_iface).await;

            // Ordered wan_ips derived through the configured interface order
            let cfg_wan_ifaces: Vec<String> =
                self.store.get_config_or("wan_interfaces", Vec::new()).await;
            let wan_ips: Vec<String> = cfg_wan_ifaces
                .iter()
                .filter_map(|iface| wan_ip_by_iface.get(iface).cloned())
                .collect();
            if !wan_ips.is_empty() {
                let _ = self.store.set_config("wan_ips", &wan_ips).await;
                let _ = self.store.set_config("wan_ip", &wan_ips[0]).await;
            }
        }

        // Gateway IP → VLAN mapping from the segment subnets
        let mut gateway_vlans: HashMap<String, Value> = HashMap::new();
        for net in &net_config.networks {
            if let Some((gw_ip, _)) = net.ip_subnet.split_once('/') {
                gateway_vlans.insert(
                    gw_ip.to_string(),
                    serde_json::json!({ "vlan": net.vlan, "name": net.name }),
                );
            }
        }
        if !gateway_vlans.is_empty() {
            let gateway_ips: Vec<String> = gateway_vlans.keys().cloned().collect();
            let _ = self.store.set_config("gateway_ip_vlans", &gateway_vlans).await;
            let _ = self.store.set_config("gateway_ips", &gateway_ips).await;
        }

        debug!(
            "Network metadata synced: {} WAN interfaces, {} segments",
            net_config.wan_interfaces.len(),
            net_config.networks.len()
        );
        Ok(())
    }
}
