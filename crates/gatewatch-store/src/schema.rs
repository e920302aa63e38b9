//! Schema migrations and one-shot repairs.
//!
//! Migrations run on every boot. Each step executes inside its own
//! savepoint: a failure (most commonly insufficient privilege on ALTER)
//! is logged and stepped over rather than aborting startup.

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info, warn};

use gatewatch_core::{Error, Result};

use crate::Store;

/// classid half of the advisory-lock keys shared by the receiver and API
/// processes for the one-shot fixes.
const ADVISORY_CLASS: i32 = 26744;
const ADVISORY_TZ_BACKFILL: i32 = 1;
const ADVISORY_FN_OWNERSHIP: i32 = 2;

/// Idempotent, in order. New steps append; nothing is ever edited in place.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS logs (
        id                  BIGSERIAL PRIMARY KEY,
        created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        timestamp           TIMESTAMPTZ NOT NULL,
        log_type            TEXT NOT NULL,
        direction           TEXT,
        src_ip              INET,
        src_port            INTEGER,
        dst_ip              INET,
        dst_port            INTEGER,
        protocol            TEXT,
        service_name        TEXT,
        rule_name           TEXT,
        rule_desc           TEXT,
        rule_action         TEXT,
        interface_in        TEXT,
        interface_out       TEXT,
        mac_address         TEXT,
        hostname            TEXT,
        dhcp_event          TEXT,
        dns_query           TEXT,
        dns_type            TEXT,
        dns_answer          TEXT,
        wifi_event          TEXT,
        geo_country         TEXT,
        geo_city            TEXT,
        geo_lat             DOUBLE PRECISION,
        geo_lon             DOUBLE PRECISION,
        asn_number          BIGINT,
        asn_name            TEXT,
        rdns                TEXT,
        threat_score        INTEGER,
        threat_categories   TEXT[],
        raw_log             TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs (timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_logs_log_type ON logs (log_type)",
    "CREATE INDEX IF NOT EXISTS idx_logs_src_ip ON logs (src_ip)",
    "CREATE INDEX IF NOT EXISTS idx_logs_dst_ip ON logs (dst_ip)",
    "CREATE INDEX IF NOT EXISTS idx_logs_rule_action ON logs (rule_action)",
    "CREATE INDEX IF NOT EXISTS idx_logs_threat_score ON logs (threat_score) WHERE threat_score IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_logs_direction ON logs (direction)",
    "CREATE TABLE IF NOT EXISTS system_config (
        key         TEXT PRIMARY KEY,
        value       JSONB,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS ip_threats (
        ip                  INET PRIMARY KEY,
        threat_score        INTEGER NOT NULL DEFAULT 0,
        threat_categories   TEXT[],
        looked_up_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_ip_threats_looked_up ON ip_threats (looked_up_at)",
    // Verbose threat detail fields, added after the first release
    "ALTER TABLE ip_threats ADD COLUMN IF NOT EXISTS abuse_usage_type TEXT",
    "ALTER TABLE ip_threats ADD COLUMN IF NOT EXISTS abuse_hostnames TEXT",
    "ALTER TABLE ip_threats ADD COLUMN IF NOT EXISTS abuse_total_reports INTEGER",
    "ALTER TABLE ip_threats ADD COLUMN IF NOT EXISTS abuse_last_reported TIMESTAMPTZ",
    "ALTER TABLE ip_threats ADD COLUMN IF NOT EXISTS abuse_is_whitelisted BOOLEAN",
    "ALTER TABLE ip_threats ADD COLUMN IF NOT EXISTS abuse_is_tor BOOLEAN",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS abuse_usage_type TEXT",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS abuse_hostnames TEXT",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS abuse_total_reports INTEGER",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS abuse_last_reported TIMESTAMPTZ",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS abuse_is_whitelisted BOOLEAN",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS abuse_is_tor BOOLEAN",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS src_device_name TEXT",
    "ALTER TABLE logs ADD COLUMN IF NOT EXISTS dst_device_name TEXT",
    "CREATE TABLE IF NOT EXISTS unifi_clients (
        mac          TEXT PRIMARY KEY,
        ip           INET,
        device_name  TEXT,
        hostname     TEXT,
        oui          TEXT,
        network      TEXT,
        essid        TEXT,
        vlan         INTEGER,
        is_fixed_ip  BOOLEAN,
        is_wired     BOOLEAN,
        last_seen    TIMESTAMPTZ,
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_unifi_clients_ip ON unifi_clients (ip)",
    "CREATE INDEX IF NOT EXISTS idx_unifi_clients_last_seen ON unifi_clients (last_seen DESC)",
    "CREATE TABLE IF NOT EXISTS unifi_devices (
        mac          TEXT PRIMARY KEY,
        ip           INET,
        device_name  TEXT,
        model        TEXT,
        shortname    TEXT,
        device_type  TEXT,
        firmware     TEXT,
        serial       TEXT,
        state        INTEGER,
        uptime       BIGINT,
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    // Retention: one statement, subtype-dependent horizons, returns count
    "CREATE OR REPLACE FUNCTION cleanup_old_logs(general_days INTEGER, dns_days INTEGER)
     RETURNS BIGINT
     LANGUAGE plpgsql
     AS $$
     DECLARE
         deleted BIGINT;
     BEGIN
         DELETE FROM logs
         WHERE (log_type = 'dns' AND timestamp < NOW() - make_interval(days => dns_days))
            OR (log_type <> 'dns' AND timestamp < NOW() - make_interval(days => general_days));
         GET DIAGNOSTICS deleted = ROW_COUNT;
         RETURN deleted;
     END;
     $$",
];

impl Store {
    /// Run the migration list, stepping over failures via savepoints.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Store(format!("Failed to open migration transaction: {e}")))?;

        let mut skipped = 0usize;
        for (step, sql) in MIGRATIONS.iter().enumerate() {
            sqlx::query("SAVEPOINT migration_step")
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Store(format!("Failed to create savepoint: {e}")))?;

            match sqlx::query(sql).execute(&mut *tx).await {
                Ok(_) => {
                    sqlx::query("RELEASE SAVEPOINT migration_step")
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::Store(format!("Failed to release savepoint: {e}")))?;
                }
                Err(e) => {
                    // Commonly "must be owner of" under a restricted role;
                    // the step will be retried on the next boot.
                    warn!("Migration step {step} skipped: {e}");
                    skipped += 1;
                    sqlx::query("ROLLBACK TO SAVEPOINT migration_step")
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::Store(format!("Failed to roll back savepoint: {e}")))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Store(format!("Failed to commit migrations: {e}")))?;

        if skipped > 0 {
            info!("Schema migrations applied ({skipped} steps skipped).");
        } else {
            info!("Schema migrations applied.");
        }
        Ok(())
    }

    /// One-shot: re-own the retention function to the application role.
    ///
    /// The function may have been created by the superuser in an earlier
    /// release, making later CREATE OR REPLACE fail for the app role.
    /// Requires `POSTGRES_SUPERUSER_PASSWORD`; without it the gate stays
    /// unset so a later boot can retry.
    pub async fn fix_function_ownership(&self, app_user: &str) -> Result<()> {
        if self.get_config_or("fn_ownership_fixed", false).await {
            return Ok(());
        }

        let Ok(super_password) = std::env::var("POSTGRES_SUPERUSER_PASSWORD") else {
            debug!("fn ownership fix pending but POSTGRES_SUPERUSER_PASSWORD not set");
            return Ok(());
        };

        if !app_user.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Config(format!("Invalid application role name: {app_user}")));
        }

        let mut guard = AdvisoryLock::acquire(self, ADVISORY_FN_OWNERSHIP).await?;
        if self.get_config_or("fn_ownership_fixed", false).await {
            guard.release(self).await;
            return Ok(());
        }

        // Superuser over the local socket; never through the shared pool
        let options = PgConnectOptions::new()
            .socket("/var/run/postgresql")
            .database(&self.store_config().dbname)
            .username("postgres")
            .password(&super_password);

        let result = async {
            let mut conn = PgConnection::connect_with(&options)
                .await
                .map_err(|e| Error::Store(format!("Superuser connection failed: {e}")))?;
            sqlx::query(&format!(
                "ALTER FUNCTION cleanup_old_logs(INTEGER, INTEGER) OWNER TO {app_user}"
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| Error::Store(format!("Failed to re-own retention function: {e}")))?;
            conn.close()
                .await
                .map_err(|e| Error::Store(format!("Failed to close superuser connection: {e}")))?;
            Ok::<_, Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_config("fn_ownership_fixed", &true).await?;
                info!("Retention function re-owned to {app_user}");
            }
            Err(e) => warn!("Retention function ownership fix failed: {e}"),
        }

        guard.release(self).await;
        Ok(())
    }

    /// One-shot: re-interpret historical timestamps that were stored as
    /// local wall time labelled UTC. Coordinated across the receiver and
    /// API processes with an advisory lock.
    pub async fn run_timezone_backfill(&self) -> Result<()> {
        if self.get_config_or("tz_backfill_done", false).await {
            return Ok(());
        }

        let mut guard = AdvisoryLock::acquire(self, ADVISORY_TZ_BACKFILL).await?;
        // Another process may have finished while we waited on the lock
        if self.get_config_or("tz_backfill_done", false).await {
            guard.release(self).await;
            return Ok(());
        }

        let tz = std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string());
        if tz.is_empty() || tz == "UTC" || tz == "Etc/UTC" {
            info!("Timezone backfill: zone is UTC, nothing to reinterpret");
            self.set_config("tz_backfill_done", &true).await?;
            guard.release(self).await;
            return Ok(());
        }

        // Probe whether Postgres knows the zone before touching any rows
        let probe = sqlx::query("SELECT NOW() AT TIME ZONE $1")
            .bind(&tz)
            .execute(self.pool())
            .await;
        if let Err(e) = probe {
            warn!("Timezone backfill: zone '{tz}' unknown to the store, recording no-op: {e}");
            self.set_config("tz_backfill_done", &true).await?;
            guard.release(self).await;
            return Ok(());
        }

        info!("Timezone backfill: reinterpreting stored timestamps as '{tz}'...");
        let updated = sqlx::query(
            "UPDATE logs SET timestamp = (timestamp AT TIME ZONE 'UTC') AT TIME ZONE $1",
        )
        .bind(&tz)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Store(format!("Timezone backfill failed: {e}")))?
        .rows_affected();

        self.set_config("tz_backfill_done", &true).await?;
        info!("Timezone backfill complete: {updated} rows restamped");
        guard.release(self).await;
        Ok(())
    }
}

/// Session-scoped advisory lock held on a dedicated pooled connection.
struct AdvisoryLock {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

impl AdvisoryLock {
    async fn acquire(store: &Store, key: i32) -> Result<Self> {
        let mut conn = store
            .pool()
            .acquire()
            .await
            .map_err(|e| Error::Store(format!("Failed to acquire connection for lock: {e}")))?;
        sqlx::query("SELECT pg_advisory_lock($1, $2)")
            .bind(ADVISORY_CLASS)
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::Store(format!("Failed to take advisory lock: {e}")))?;
        Ok(Self { conn })
    }

    async fn release(&mut self, _store: &Store) {
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock_all()")
            .execute(&mut *self.conn)
            .await
        {
            warn!("Failed to release advisory lock: {e}");
        }
    }
}
