//! Client / device cache tables (`unifi_clients`, `unifi_devices`).
//!
//! MAC-keyed name-resolution caches fed by the controller poller. Bulk
//! upserts follow "last writer with non-null wins": an incoming null never
//! clobbers a known value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use gatewatch_core::{Error, Result};

use crate::Store;

/// One end-user client as reported by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRecord {
    pub mac: String,
    pub ip: Option<String>,
    pub device_name: Option<String>,
    pub hostname: Option<String>,
    pub oui: Option<String>,
    pub network: Option<String>,
    pub essid: Option<String>,
    pub vlan: Option<i32>,
    pub is_fixed_ip: Option<bool>,
    pub is_wired: Option<bool>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ClientRecord {
    /// Display name preference: explicit name, then hostname, then OUI.
    pub fn display_name(&self) -> Option<&str> {
        self.device_name
            .as_deref()
            .or(self.hostname.as_deref())
            .or(self.oui.as_deref())
    }
}

/// One infrastructure device (AP, switch, gateway).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub mac: String,
    pub ip: Option<String>,
    pub device_name: Option<String>,
    pub model: Option<String>,
    pub shortname: Option<String>,
    pub device_type: Option<String>,
    pub firmware: Option<String>,
    pub serial: Option<String>,
    pub state: Option<i32>,
    pub uptime: Option<i64>,
}

impl DeviceRecord {
    pub fn display_name(&self) -> Option<&str> {
        self.device_name.as_deref().or(self.model.as_deref())
    }
}

fn parse_inet(ip: &Option<String>) -> Option<IpNetwork> {
    ip.as_deref().and_then(|s| s.parse().ok())
}

impl Store {
    pub async fn upsert_clients(&self, clients: &[ClientRecord]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Store(format!("Failed to open transaction: {e}")))?;
        for c in clients {
            sqlx::query(
                "INSERT INTO unifi_clients
                     (mac, ip, device_name, hostname, oui, network, essid, vlan,
                      is_fixed_ip, is_wired, last_seen, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
                 ON CONFLICT (mac) DO UPDATE SET
                     ip = COALESCE(EXCLUDED.ip, unifi_clients.ip),
                     device_name = COALESCE(EXCLUDED.device_name, unifi_clients.device_name),
                     hostname = COALESCE(EXCLUDED.hostname, unifi_clients.hostname),
                     oui = COALESCE(EXCLUDED.oui, unifi_clients.oui),
                     network = COALESCE(EXCLUDED.network, unifi_clients.network),
                     essid = COALESCE(EXCLUDED.essid, unifi_clients.essid),
                     vlan = COALESCE(EXCLUDED.vlan, unifi_clients.vlan),
                     is_fixed_ip = COALESCE(EXCLUDED.is_fixed_ip, unifi_clients.is_fixed_ip),
                     is_wired = COALESCE(EXCLUDED.is_wired, unifi_clients.is_wired),
                     last_seen = COALESCE(EXCLUDED.last_seen, unifi_clients.last_seen),
                     updated_at = NOW()",
            )
            .bind(c.mac.to_lowercase())
            .bind(parse_inet(&c.ip))
            .bind(&c.device_name)
            .bind(&c.hostname)
            .bind(&c.oui)
            .bind(&c.network)
            .bind(&c.essid)
            .bind(c.vlan)
            .bind(c.is_fixed_ip)
            .bind(c.is_wired)
            .bind(c.last_seen)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Store(format!("Client upsert failed for {}: {e}", c.mac)))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::Store(format!("Failed to commit client upserts: {e}")))
    }

    pub async fn upsert_devices(&self, devices: &[DeviceRecord]) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Store(format!("Failed to open transaction: {e}")))?;
        for d in devices {
            sqlx::query(
                "INSERT INTO unifi_devices
                     (mac, ip, device_name, model, shortname, device_type,
                      firmware, serial, state, uptime, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
                 ON CONFLICT (mac) DO UPDATE SET
                     ip = COALESCE(EXCLUDED.ip, unifi_devices.ip),
                     device_name = COALESCE(EXCLUDED.device_name, unifi_devices.device_name),
                     model = COALESCE(EXCLUDED.model, unifi_devices.model),
                     shortname = COALESCE(EXCLUDED.shortname, unifi_devices.shortname),
                     device_type = COALESCE(EXCLUDED.device_type, unifi_devices.device_type),
                     firmware = COALESCE(EXCLUDED.firmware, unifi_devices.firmware),
                     serial = COALESCE(EXCLUDED.serial, unifi_devices.serial),
                     state = COALESCE(EXCLUDED.state, unifi_devices.state),
                     uptime = COALESCE(EXCLUDED.uptime, unifi_devices.uptime),
                     updated_at = NOW()",
            )
            .bind(d.mac.to_lowercase())
            .bind(parse_inet(&d.ip))
            .bind(&d.device_name)
            .bind(&d.model)
            .bind(&d.shortname)
            .bind(&d.device_type)
            .bind(&d.firmware)
            .bind(&d.serial)
            .bind(d.state)
            .bind(d.uptime)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Store(format!("Device upsert failed for {}: {e}", d.mac)))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::Store(format!("Failed to commit device upserts: {e}")))
    }

    /// Rebuild the in-memory name maps from the cache tables, used to seed
    /// the controller client on cold start before its first poll.
    pub async fn load_name_maps(
        &self,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>)> {
        #[derive(FromRow)]
        struct NameRow {
            mac: String,
            ip: Option<String>,
            name: Option<String>,
        }

        let mut ip_map = HashMap::new();
        let mut mac_map = HashMap::new();

        let clients: Vec<NameRow> = sqlx::query_as(
            "SELECT mac, host(ip) AS ip,
                    COALESCE(device_name, hostname, oui) AS name
             FROM unifi_clients
             ORDER BY last_seen ASC NULLS FIRST",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to load client name map: {e}")))?;

        for row in clients {
            if let Some(name) = row.name.filter(|n| !n.is_empty()) {
                mac_map.insert(row.mac.to_lowercase(), name.clone());
                if let Some(ip) = row.ip {
                    ip_map.insert(ip, name);
                }
            }
        }

        let devices: Vec<NameRow> = sqlx::query_as(
            "SELECT mac, host(ip) AS ip,
                    COALESCE(device_name, model) AS name
             FROM unifi_devices",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to load device name map: {e}")))?;

        for row in devices {
            if let Some(name) = row.name.filter(|n| !n.is_empty()) {
                mac_map.insert(row.mac.to_lowercase(), name.clone());
                if let Some(ip) = row.ip {
                    ip_map.insert(ip, name);
                }
            }
        }

        Ok((ip_map, mac_map))
    }
}
