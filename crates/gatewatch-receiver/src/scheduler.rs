//! Scheduled housekeeping: periodic stats, WAN/gateway rediscovery, daily
//! retention, daily blacklist pull.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Timelike};
use tokio::sync::watch;
use tracing::{debug, error, info};

use gatewatch_enrich::{BlacklistFetcher, Enricher};
use gatewatch_store::Store;

const STATS_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DISPATCH_TICK: Duration = Duration::from_secs(10);
const RETENTION_HOUR: u32 = 3;
const BLACKLIST_HOUR: u32 = 4;
const STARTUP_BLACKLIST_DELAY: Duration = Duration::from_secs(30);

pub struct Scheduler {
    store: Store,
    enricher: Arc<Enricher>,
    blacklist: Arc<BlacklistFetcher>,
}

impl Scheduler {
    pub fn new(store: Store, enricher: Arc<Enricher>, blacklist: Arc<BlacklistFetcher>) -> Self {
        Self {
            store,
            enricher,
            blacklist,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started — stats every {}m, retention daily at {RETENTION_HOUR:02}:00, blacklist daily at {BLACKLIST_HOUR:02}:00",
            STATS_INTERVAL.as_secs() / 60
        );

        // Initial blacklist pull after a short settle period
        tokio::select! {
            _ = tokio::time::sleep(STARTUP_BLACKLIST_DELAY) => {
                self.pull_blacklist().await;
            }
            _ = shutdown.changed() => return,
        }

        let mut last_stats = tokio::time::Instant::now();
        let mut last_retention: Option<NaiveDate> = None;
        let mut last_blacklist: Option<NaiveDate> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(DISPATCH_TICK) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                last_stats = tokio::time::Instant::now();
                self.log_stats().await;
                self.refresh_wan().await;
            }

            let now = Local::now();
            let today = now.date_naive();
            if now.hour() >= RETENTION_HOUR && last_retention != Some(today) {
                last_retention = Some(today);
                self.run_retention().await;
            }
            if now.hour() >= BLACKLIST_HOUR && last_blacklist != Some(today) {
                last_blacklist = Some(today);
                self.pull_blacklist().await;
            }
        }
    }

    async fn log_stats(&self) {
        let total = match self.store.count_logs(None).await {
            Ok(total) => total,
            Err(e) => {
                error!("Failed to get stats: {e}");
                return;
            }
        };
        let hourly = self.store.hourly_breakdown().await.unwrap_or_default();
        debug!("Store stats — total: {total}, last hour: {hourly:?}");
        debug!("Enrichment stats — {:?}", self.enricher.stats());
    }

    async fn refresh_wan(&self) {
        if let Err(e) = self.store.detect_wan_ip().await {
            error!("WAN IP detection failed: {e}");
        }
        if let Err(e) = self.store.detect_gateway_ips().await {
            error!("Gateway IP detection failed: {e}");
        }
        // Keep the exclusion set in step with whatever detection found
        if let Err(e) = self.enricher.refresh_exclusions().await {
            error!("Exclusion refresh failed: {e}");
        }
    }

    async fn run_retention(&self) {
        let (general, dns) = self.store.effective_retention().await;
        match self.store.run_retention(general.days as i32, dns.days as i32).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(
                        "Retention: deleted {deleted} rows (general {}d, dns {}d)",
                        general.days, dns.days
                    );
                }
            }
            Err(e) => error!("Retention cleanup failed: {e}"),
        }
    }

    async fn pull_blacklist(&self) {
        if let Err(e) = self.blacklist.fetch_and_store().await {
            error!("Blacklist pull failed: {e}");
        }
    }
}
