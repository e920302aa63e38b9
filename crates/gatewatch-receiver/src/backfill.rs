//! Periodic backfill of missing enrichment.
//!
//! A daemon task that patches historical rows the live path could not
//! finish: scores missed during 429 pauses, detail fields from before
//! verbose lookups, directions after a WAN change, and rows contaminated
//! by self-IP enrichment. Every step is idempotent; a cycle that finds
//! nothing logs nothing at info level.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use gatewatch_enrich::Enricher;
use gatewatch_parsers::{derive_direction, DirectionInput};
use gatewatch_store::logs::EnrichmentRewrite;
use gatewatch_store::Store;

use crate::SharedContext;

const SETTLE_DELAY: Duration = Duration::from_secs(60);
const CYCLE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const CURSOR_BATCH: i64 = 500;
/// Max stale cache entries re-enriched per cycle.
const STALE_REENRICH_BATCH: i64 = 25;
/// Spacing between consecutive API lookups.
const LOOKUP_SPACING: Duration = Duration::from_secs(1);

pub struct BackfillTask {
    store: Store,
    enricher: Arc<Enricher>,
    context: SharedContext,
}

impl BackfillTask {
    pub fn new(store: Store, enricher: Arc<Enricher>, context: SharedContext) -> Self {
        Self {
            store,
            enricher,
            context,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Backfill task started — runs every {}s",
            CYCLE_INTERVAL.as_secs()
        );
        tokio::select! {
            _ = tokio::time::sleep(SETTLE_DELAY) => {}
            _ = shutdown.changed() => return,
        }

        loop {
            if let Err(e) = self.run_once().await {
                error!("Backfill cycle failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(CYCLE_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    pub async fn run_once(&self) -> gatewatch_core::Result<()> {
        // Exclusions may have changed since the last cycle (new WAN IP,
        // wizard rerun); every step below relies on them.
        self.enricher.refresh_exclusions().await?;

        let directions = self.backfill_directions().await?;
        let wan_fixed = self.fix_wan_enrichment().await?;
        let repaired = self.fix_abuse_contamination().await?;
        let services = self.store.patch_service_names().await?;

        let wan_ips = self.store.wan_ips_from_config().await?;
        let patched_null = self.store.patch_null_scores(&wan_ips).await?;
        let patched_detail = self.store.patch_abuse_details(&wan_ips).await?;

        let reenriched = self.reenrich_stale().await?;

        // Orphans: remote IPs on blocked rows that the cache has never seen
        let orphans: Vec<String> = self
            .store
            .find_orphan_ips()
            .await?
            .into_iter()
            .filter(|ip| ip.parse().map(|addr| self.enricher.is_remote(addr)).unwrap_or(false))
            .collect();

        let budget = self.enricher.threat.remaining_budget();
        if !orphans.is_empty() && budget == 0 {
            info!(
                "Backfill: {services} services patched, {patched_null} null-score patched, \
                 {patched_detail} detail patched, {reenriched} re-enriched, \
                 {} orphans pending but no API budget",
                orphans.len()
            );
            return Ok(());
        }

        let to_lookup: Vec<&String> = orphans.iter().take(budget.max(0) as usize).collect();
        let skipped = orphans.len() - to_lookup.len();

        let mut looked_up = 0usize;
        let mut lookup_failed = 0usize;
        for ip in &to_lookup {
            match self.enricher.threat.lookup(ip).await {
                Some(_) => looked_up += 1,
                None => lookup_failed += 1,
            }
            tokio::time::sleep(LOOKUP_SPACING).await;
        }

        // Newly fetched scores reach the log rows through one more pass
        let mut patched_final = 0u64;
        if looked_up > 0 || reenriched > 0 {
            patched_final = self.store.patch_null_scores(&wan_ips).await?
                + self.store.patch_abuse_details(&wan_ips).await?;
        }

        let total = directions
            + wan_fixed
            + repaired
            + services
            + patched_null
            + patched_detail
            + patched_final;
        if total > 0 || looked_up > 0 || lookup_failed > 0 || skipped > 0 || reenriched > 0 {
            info!(
                "Backfill complete: {directions} directions, {wan_fixed} wan-enrichment fixed, \
                 {repaired} contaminated repaired, {services} services patched, \
                 {patched_null} null-score patched, {patched_detail} detail patched, \
                 {reenriched} re-enriched, {looked_up} orphans looked up, {lookup_failed} failed, \
                 {skipped} skipped (no budget), {patched_final} rows patched from new data"
            );
        } else {
            debug!("Backfill: nothing to do");
        }
        Ok(())
    }

    /// Step 1: re-derive direction for firewall rows after a WAN change.
    async fn backfill_directions(&self) -> gatewatch_core::Result<u64> {
        if !self.store.get_config_or("direction_backfill_pending", false).await {
            return Ok(0);
        }
        debug!("Starting direction backfill...");

        let mut total = 0u64;
        let mut last_id = 0i64;
        loop {
            let rows = self.store.firewall_rows_after(last_id, CURSOR_BATCH).await?;
            if rows.is_empty() {
                break;
            }

            let updates: Vec<(i64, Option<String>)> = {
                let context = self.context.read().unwrap_or_else(|e| e.into_inner());
                rows.iter()
                    .map(|row| {
                        last_id = row.id;
                        let outcome = derive_direction(
                            &DirectionInput {
                                interface_in: row.interface_in.as_deref(),
                                interface_out: row.interface_out.as_deref(),
                                rule_name: row.rule_name.as_deref(),
                                src_ip: row.src_ip.as_deref().and_then(|ip| ip.parse().ok()),
                                dst_ip: row.dst_ip.as_deref().and_then(|ip| ip.parse().ok()),
                            },
                            &context,
                        );
                        (row.id, outcome.direction.map(|d| d.to_string()))
                    })
                    .collect()
            };

            total += self.store.update_directions(&updates).await?;
            debug!("Direction backfill progress: {total} logs updated");
        }

        self.store.set_config("direction_backfill_pending", &false).await?;
        info!("Direction backfill complete: {total} total logs updated");
        Ok(total)
    }

    /// Step 2 (one-shot): rows enriched against our own WAN IP get
    /// re-enriched against the remote destination instead.
    async fn fix_wan_enrichment(&self) -> gatewatch_core::Result<u64> {
        if !self.store.get_config_or("enrichment_wan_fix_pending", false).await {
            return Ok(0);
        }
        let wan_ips = self.store.wan_ips_from_config().await?;
        if wan_ips.is_empty() {
            // No WAN IPs known yet; retry next cycle
            return Ok(0);
        }
        info!("Starting WAN IP enrichment fix (WAN IPs: {wan_ips:?})...");

        let mut total = 0u64;
        let mut last_id = 0i64;
        loop {
            let rows = self
                .store
                .wan_enriched_rows_after(&wan_ips, last_id, CURSOR_BATCH)
                .await?;
            if rows.is_empty() {
                break;
            }

            let mut updates = Vec::with_capacity(rows.len());
            for row in &rows {
                last_id = row.id;
                let dst: Option<std::net::IpAddr> =
                    row.dst_ip.as_deref().and_then(|ip| ip.parse().ok());

                match dst.filter(|ip| self.enricher.is_remote(*ip)) {
                    Some(dst) => {
                        let geo = self.enricher.geoip.lookup(dst);
                        let rdns = self.enricher.rdns.lookup(dst).await;
                        updates.push(EnrichmentRewrite {
                            id: row.id,
                            geo_country: geo.geo_country,
                            geo_city: geo.geo_city,
                            geo_lat: geo.geo_lat,
                            geo_lon: geo.geo_lon,
                            asn_number: geo.asn_number,
                            asn_name: geo.asn_name,
                            rdns,
                        });
                    }
                    // dst is private or missing: just null the wrong data
                    None => updates.push(EnrichmentRewrite { id: row.id, ..Default::default() }),
                }
            }

            total += updates.len() as u64;
            self.store.rewrite_enrichment(&updates).await?;
            debug!("WAN enrichment fix progress: {total} logs fixed");
        }

        self.store.set_config("enrichment_wan_fix_pending", &false).await?;
        info!("Enrichment WAN fix complete: {total} logs re-enriched");
        Ok(total)
    }

    /// Step 3 (one-shot): purge WAN/gateway entries from the threat cache
    /// and repair inbound rows that inherited the WAN IP's abuse data.
    async fn fix_abuse_contamination(&self) -> gatewatch_core::Result<u64> {
        if self.store.get_config_or("abuse_hostname_fix_done", false).await {
            return Ok(0);
        }
        let wan_ips = self.store.wan_ips_from_config().await?;
        if wan_ips.is_empty() {
            return Ok(0);
        }
        let gateway_ips = self.store.gateway_ips_from_config().await?;
        let mut excluded = wan_ips.clone();
        excluded.extend(gateway_ips.iter().cloned());

        info!("Starting abuse hostname fix (WAN IPs: {wan_ips:?}, gateway IPs: {gateway_ips:?})...");

        let removed = self.store.delete_threats(&excluded).await?;
        if removed > 0 {
            info!("Removed {removed} WAN/gateway entries from the threat cache");
        }

        let mut total = 0u64;
        let mut last_id = 0i64;
        loop {
            let rows = self
                .store
                .contaminated_abuse_rows_after(&wan_ips, &excluded, last_id, CURSOR_BATCH)
                .await?;
            if rows.is_empty() {
                break;
            }

            let src_ips: Vec<String> = rows
                .iter()
                .filter_map(|r| r.src_ip.clone())
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();
            let threats = self.store.get_threats(&src_ips).await?;

            let updates: Vec<_> = rows
                .iter()
                .map(|row| {
                    last_id = row.id;
                    let entry = row.src_ip.as_ref().and_then(|ip| threats.get(ip)).cloned();
                    (row.id, entry)
                })
                .collect();

            total += updates.len() as u64;
            self.store.apply_threat_entries(&updates).await?;
            debug!("Abuse hostname fix progress: {total} logs processed");
        }

        self.store.set_config("abuse_hostname_fix_done", &true).await?;
        info!("Abuse hostname fix complete: {total} logs repaired");
        Ok(total)
    }

    /// Step 7: expire scored-but-detail-less cache entries seen on recent
    /// blocked logs and look them up again under budget.
    async fn reenrich_stale(&self) -> gatewatch_core::Result<u64> {
        let budget = self.enricher.threat.remaining_budget();
        if budget == 0 {
            return Ok(0);
        }

        let batch = STALE_REENRICH_BATCH.min(budget);
        let stale = self.store.stale_threat_candidates(batch).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        // Expire in both tiers so lookup() goes straight to the API
        self.store.expire_threats(&stale).await?;
        for ip in &stale {
            self.enricher.threat.invalidate(ip);
        }

        let mut reenriched = 0u64;
        for ip in &stale {
            if let Some(entry) = self.enricher.threat.lookup(ip).await {
                if entry.abuse_usage_type.is_some() {
                    reenriched += 1;
                }
            }
            tokio::time::sleep(LOOKUP_SPACING).await;
        }
        Ok(reenriched)
    }
}
