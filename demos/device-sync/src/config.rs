use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use statesync::SyncConfig;

/// Demo configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Use PostgreSQL storage when set, in-memory otherwise
    pub database_url: Option<String>,
    pub sync: SyncConfig,
    pub devices: usize,
    pub gateways: usize,
    pub message_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut sync = SyncConfig::default();
        if let Ok(path) = env::var("STATESYNC_STORAGE_PATH") {
            sync = sync.with_storage_path(PathBuf::from(path));
        }
        if let Ok(name) = env::var("STATESYNC_NAME") {
            sync = sync.with_name(name.clone()).with_subscriber_id(name);
        }
        if let Some(n) = parsed::<usize>("STATESYNC_BATCH_SIZE")? {
            sync = sync.with_batch_size(n);
        }
        if let Some(ms) = parsed::<u64>("STATESYNC_FLUSH_TIMEOUT_MS")? {
            sync = sync.with_flush_timeout(Duration::from_millis(ms));
        }
        if let Some(secs) = parsed::<u64>("STATESYNC_TTL_SECS")? {
            sync = sync.with_ttl(Duration::from_secs(secs));
        }
        if let Some(ms) = parsed::<u64>("STATESYNC_SHUTDOWN_GRACE_MS")? {
            sync = sync.with_shutdown_grace(Duration::from_millis(ms));
        }
        if let Some(sync_on_append) = parsed::<bool>("STATESYNC_SYNC_ON_APPEND")? {
            sync = sync.with_sync_on_append(sync_on_append);
        }
        sync.validate().context("invalid STATESYNC_* configuration")?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            sync,
            devices: parsed("DEMO_DEVICES")?.unwrap_or(50),
            gateways: parsed("DEMO_GATEWAYS")?.unwrap_or(5),
            message_interval: Duration::from_millis(parsed("DEMO_INTERVAL_MS")?.unwrap_or(20)),
        })
    }
}

fn parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(None),
    }
}
