//! Firewall policy surface (integration API, modern controllers only).

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::{UnifiClient, UnifiError, UnifiResult};

/// Spacing between bulk PATCH requests; the controller throttles bursts.
const BULK_PATCH_DELAY: Duration = Duration::from_millis(100);

/// Cap on per-policy error details carried back to the UI.
const BULK_ERROR_CAP: usize = 20;

#[derive(Debug, Serialize)]
pub struct BulkPatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct FirewallData {
    pub policies: Vec<Value>,
    pub zones: Vec<Value>,
    #[serde(rename = "totalCount")]
    pub total_count: usize,
    #[serde(rename = "loggingEnabled")]
    pub logging_enabled: usize,
    #[serde(rename = "loggingDisabled")]
    pub logging_disabled: usize,
}

impl UnifiClient {
    pub async fn firewall_zones(&self) -> UnifiResult<Vec<Value>> {
        let data = self.get_integration_site("/firewall/zones").await?;
        Ok(data
            .pointer("/data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Fetch ALL policies, following offset/limit pagination until
    /// `totalCount` is reached.
    pub async fn firewall_policies(&self) -> UnifiResult<Vec<Value>> {
        let mut all = Vec::new();
        let mut offset = 0usize;
        let limit = 50usize;
        loop {
            let page = self
                .get_integration_site(&format!("/firewall/policies?offset={offset}&limit={limit}"))
                .await?;
            let entries = page
                .pointer("/data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let fetched = entries.len();
            all.extend(entries);
            let total_count = page
                .get("totalCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            if fetched == 0 || offset + fetched >= total_count {
                break;
            }
            offset += fetched;
        }
        Ok(all)
    }

    /// Policies + zones in one call for the frontend, with logging tallies.
    pub async fn firewall_data(&self) -> UnifiResult<FirewallData> {
        let policies = self.firewall_policies().await?;
        let zones = self.firewall_zones().await?;

        let logging_enabled = policies
            .iter()
            .filter(|p| p.get("loggingEnabled").and_then(Value::as_bool) == Some(true))
            .count();

        Ok(FirewallData {
            total_count: policies.len(),
            logging_enabled,
            logging_disabled: policies.len() - logging_enabled,
            policies,
            zones,
        })
    }

    /// Flip `loggingEnabled` on a single policy.
    pub async fn patch_firewall_policy(
        &self,
        policy_id: &str,
        logging_enabled: bool,
    ) -> UnifiResult<Value> {
        self.patch_integration_site(
            &format!("/firewall/policies/{policy_id}"),
            &json!({ "loggingEnabled": logging_enabled }),
        )
        .await
    }

    /// Batch-update `loggingEnabled`. Items without the flag are skipped;
    /// failures are collected (capped) rather than aborting the batch.
    pub async fn bulk_patch_logging(&self, updates: &[Value]) -> BulkPatchSummary {
        let mut summary = BulkPatchSummary {
            total: updates.len(),
            success: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
        };

        for item in updates {
            let policy_id = item.get("id").and_then(Value::as_str).unwrap_or("");
            let Some(logging) = item.get("loggingEnabled").and_then(Value::as_bool) else {
                summary.skipped += 1;
                continue;
            };

            match self.patch_firewall_policy(policy_id, logging).await {
                Ok(_) => summary.success += 1,
                Err(e) => {
                    summary.failed += 1;
                    if summary.errors.len() < BULK_ERROR_CAP {
                        let detail = match &e {
                            UnifiError::Status { status, body } => {
                                format!("HTTP {status}: {:.200}", body)
                            }
                            other => other.to_string(),
                        };
                        summary.errors.push(json!({ "id": policy_id, "error": detail }));
                    }
                }
            }

            tokio::time::sleep(BULK_PATCH_DELAY).await;
        }

        summary
    }
}
