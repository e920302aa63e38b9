//! Gatewatch persistent store
//!
//! PostgreSQL access for every component: the `logs` table, the
//! `ip_threats` cache, the client/device caches, and the `system_config`
//! key/value store. Owns schema migrations, the retention procedure, and
//! the advisory-locked one-shot fixes.

pub mod config;
pub mod crypto;
pub mod detect;
pub mod devices;
pub mod logs;
pub mod schema;
pub mod threats;

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, error, info};

use gatewatch_core::{Error, Result};

pub use devices::{ClientRecord, DeviceRecord};

/// Connection settings, env-overridable where deployment needs it.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            dbname: "gatewatch".to_string(),
            user: "gatewatch".to_string(),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "changeme".to_string()),
            min_connections: 2,
            max_connections: 10,
        }
    }
}

impl StoreConfig {
    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user)
            .password(&self.password)
    }
}

/// Handle to the PostgreSQL pool, cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    /// Kept for the credential-encryption key derivation and the
    /// superuser one-shot.
    config: StoreConfig,
}

impl Store {
    /// Build the pool and run schema migrations.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL at {}:{}...", config.host, config.port);
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .connect_with(config.connect_options())
            .await
            .map_err(|e| Error::Store(format!("Failed to connect to database: {e}")))?;

        let store = Self {
            pool,
            config: config.clone(),
        };
        store.ensure_schema().await?;
        info!(
            "PostgreSQL connection pool ready (min={}, max={})",
            config.min_connections, config.max_connections
        );
        Ok(store)
    }

    /// Block until PostgreSQL accepts connections, or give up.
    pub async fn wait_ready(config: &StoreConfig, max_retries: u32) -> Result<()> {
        for attempt in 1..=max_retries {
            match PgPoolOptions::new()
                .max_connections(1)
                .connect_with(config.connect_options())
                .await
            {
                Ok(pool) => {
                    pool.close().await;
                    info!("PostgreSQL is ready.");
                    return Ok(());
                }
                Err(_) => {
                    debug!("Waiting for PostgreSQL... ({attempt}/{max_retries})");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        error!("PostgreSQL not available after {max_retries} retries");
        Err(Error::Store("PostgreSQL not available".to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn store_config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn db_password(&self) -> &str {
        &self.config.password
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL connection pool closed.");
    }
}
