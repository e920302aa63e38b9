//! `system_config` key/value access.
//!
//! All mutable settings live here as JSONB values: WAN topology, labels,
//! controller credentials, rate-limit state, retention overrides, and the
//! one-shot migration gates.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use gatewatch_core::net::{normalize_ip, ExclusionSet};
use gatewatch_core::{Error, Result};

use crate::{crypto, Store};

impl Store {
    /// Raw JSON value for a config key, `None` when absent or SQL NULL.
    pub async fn get_config_value(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT value FROM system_config WHERE key = $1")
                .bind(key)
                .fetch_optional(self.pool())
                .await
                .map_err(|e| Error::Store(format!("Failed to load config '{key}': {e}")))?;

        Ok(row.map(|(v,)| v).filter(|v| !v.is_null()))
    }

    /// Typed config lookup. Values that fail to deserialize count as absent.
    pub async fn get_config<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self
            .get_config_value(key)
            .await?
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Typed config lookup with a default.
    pub async fn get_config_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get_config(key).await {
            Ok(Some(value)) => value,
            _ => default,
        }
    }

    pub async fn set_config<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        sqlx::query(
            "INSERT INTO system_config (key, value, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Failed to save config '{key}': {e}")))?;
        Ok(())
    }

    /// All WAN IPs known to config: the `wan_ips` list when present,
    /// otherwise the single legacy `wan_ip`. Values are normalised.
    pub async fn wan_ips_from_config(&self) -> Result<Vec<String>> {
        if let Some(ips) = self.get_config::<Vec<String>>("wan_ips").await? {
            if !ips.is_empty() {
                return Ok(ips.iter().map(|ip| normalize_ip(ip)).collect());
            }
        }
        if let Some(ip) = self.get_config::<String>("wan_ip").await? {
            if !ip.is_empty() {
                return Ok(vec![normalize_ip(&ip)]);
            }
        }
        Ok(Vec::new())
    }

    pub async fn gateway_ips_from_config(&self) -> Result<Vec<String>> {
        Ok(self
            .get_config::<Vec<String>>("gateway_ips")
            .await?
            .unwrap_or_default()
            .iter()
            .map(|ip| normalize_ip(ip))
            .collect())
    }

    /// WAN ∪ gateway IPs as an [`ExclusionSet`]; the value object every
    /// threat-data write path checks against.
    pub async fn exclusion_set(&self) -> Result<ExclusionSet> {
        let mut ips = self.wan_ips_from_config().await?;
        ips.extend(self.gateway_ips_from_config().await?);
        Ok(ExclusionSet::from_strings(ips))
    }

    /// Store a credential encrypted; empty input clears the key.
    pub async fn set_encrypted_config(&self, key: &str, plaintext: &str) -> Result<()> {
        if plaintext.is_empty() {
            return self.set_config(key, &"").await;
        }
        let sealed = crypto::encrypt_credential(plaintext, self.db_password())?;
        self.set_config(key, &sealed).await
    }

    /// Read a credential, decrypting it. Absent keys and decryption
    /// failures both yield the empty string.
    pub async fn get_encrypted_config(&self, key: &str) -> String {
        match self.get_config::<String>(key).await {
            Ok(Some(sealed)) if !sealed.is_empty() => {
                let plain = crypto::decrypt_credential(&sealed, self.db_password());
                if plain.is_empty() {
                    tracing::warn!(
                        "Failed to decrypt {key} — POSTGRES_PASSWORD may have changed"
                    );
                }
                plain
            }
            _ => String::new(),
        }
    }
}
