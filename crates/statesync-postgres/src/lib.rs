//! PostgreSQL storage for statesync.
//!
//! - [`PgDeviceRepository`] implements `DeviceRepository`: one conditional
//!   `UPDATE` per state group, inside a transaction tagged so change
//!   triggers stay quiet
//! - [`PgHierarchyStore`] implements `HierarchyStore` over
//!   `device_instance.parent_id`
//!
//! Storage errors are mapped so the retry policy can classify them:
//! connection I/O failures surface as `std::io::Error`, pool acquire
//! timeouts and cancelled statements (`57014`) as `QueryTimeout`. Anything
//! else is passed through and treated as permanent.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE device_instance (
//!     id TEXT PRIMARY KEY,
//!     parent_id TEXT REFERENCES device_instance (id) ON DELETE SET NULL,
//!     state TEXT NOT NULL DEFAULT 'notActive'
//!         CHECK (state IN ('online', 'offline', 'notActive')),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_device_instance_parent ON device_instance (parent_id);
//!
//! -- Change triggers skip writes tagged by the synchronizer.
//! CREATE FUNCTION device_instance_state_changed() RETURNS trigger AS $$
//! BEGIN
//!     IF current_setting('statesync.suppress_change_events', true) = 'on' THEN
//!         RETURN NEW;
//!     END IF;
//!     PERFORM pg_notify('device_state_changed', NEW.id || ':' || NEW.state);
//!     RETURN NEW;
//! END
//! $$ LANGUAGE plpgsql;
//!
//! CREATE TRIGGER device_instance_state_changed
//!     AFTER UPDATE OF state ON device_instance
//!     FOR EACH ROW EXECUTE FUNCTION device_instance_state_changed();
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use statesync_postgres::{PgDeviceRepository, PgHierarchyStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/devices").await?;
//! let repository = Arc::new(PgDeviceRepository::new(pool.clone()));
//! let hierarchy = HierarchyService::new(Arc::new(PgHierarchyStore::new(pool)));
//!
//! let handle = StateSynchronizer::builder(config, registry, repository)
//!     .with_hierarchy(hierarchy)
//!     .start(&bus)?;
//! ```

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use statesync::{DeviceRepository, DeviceState, HierarchyStore, QueryTimeout, WriteOptions};
use tracing::debug;

/// SQLSTATE for a statement cancelled by `statement_timeout` or a cancel request.
const QUERY_CANCELED: &str = "57014";

/// Session setting that change triggers check.
pub const SUPPRESS_SETTING: &str = "statesync.suppress_change_events";

/// Table definition used by [`ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS device_instance (
    id TEXT PRIMARY KEY,
    parent_id TEXT REFERENCES device_instance (id) ON DELETE SET NULL,
    state TEXT NOT NULL DEFAULT 'notActive'
        CHECK (state IN ('online', 'offline', 'notActive')),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Create `device_instance` if it does not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Map a sqlx error onto the error families the retry policy knows.
pub fn storage_error(operation: &'static str, err: sqlx::Error, waited: Duration) -> anyhow::Error {
    match err {
        sqlx::Error::Io(io) => anyhow::Error::new(io).context(format!("{operation} failed")),
        sqlx::Error::PoolTimedOut => QueryTimeout::new(operation, waited).into(),
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            anyhow::Error::new(QueryTimeout::new(operation, waited)).context(db.message().to_string())
        }
        other => anyhow::Error::new(other).context(format!("{operation} failed")),
    }
}

/// Device state storage.
#[derive(Clone)]
pub struct PgDeviceRepository {
    pool: PgPool,
}

impl PgDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn error(&self, operation: &'static str, err: sqlx::Error) -> anyhow::Error {
        storage_error(operation, err, self.pool.options().get_acquire_timeout())
    }

    async fn update_states(
        &self,
        ids: &[String],
        state: DeviceState,
        options: WriteOptions,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if options.suppress_change_events {
            sqlx::query("SELECT set_config($1, 'on', true)")
                .bind(SUPPRESS_SETTING)
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query(
            r#"
            UPDATE device_instance
            SET state = $1,
                updated_at = NOW()
            WHERE id = ANY($2)
              AND (NOT $3 OR state <> $4)
            "#,
        )
        .bind(state.as_str())
        .bind(ids)
        .bind(options.skip_if_not_active)
        .bind(DeviceState::NotActive.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Device counts per persisted state.
    pub async fn stats(&self) -> Result<StateStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'online') as online,
                COUNT(*) FILTER (WHERE state = 'offline') as offline,
                COUNT(*) FILTER (WHERE state = 'notActive') as not_active
            FROM device_instance
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.error("stats", e))?;

        Ok(StateStats {
            online: row.get("online"),
            offline: row.get("offline"),
            not_active: row.get("not_active"),
        })
    }
}

#[async_trait]
impl DeviceRepository for PgDeviceRepository {
    /// `SET LOCAL`-style tagging (`set_config(.., true)`) lasts only for the
    /// transaction, so pooled connections never leak the setting.
    async fn bulk_set_state(
        &self,
        ids: &[String],
        state: DeviceState,
        options: WriteOptions,
    ) -> Result<u64> {
        let rows = self
            .update_states(ids, state, options)
            .await
            .map_err(|e| self.error("bulk_set_state", e))?;
        debug!(state = %state, devices = ids.len(), rows, "device states updated");
        Ok(rows)
    }
}

impl std::fmt::Debug for PgDeviceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDeviceRepository").finish_non_exhaustive()
    }
}

/// Persisted state counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateStats {
    pub online: i64,
    pub offline: i64,
    pub not_active: i64,
}

/// Parent/child edges stored in `device_instance.parent_id`.
#[derive(Clone)]
pub struct PgHierarchyStore {
    pool: PgPool,
}

impl PgHierarchyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn error(&self, operation: &'static str, err: sqlx::Error) -> anyhow::Error {
        storage_error(operation, err, self.pool.options().get_acquire_timeout())
    }
}

#[async_trait]
impl HierarchyStore for PgHierarchyStore {
    async fn parent_of(&self, id: &str) -> Result<Option<String>> {
        let parent: Option<Option<String>> =
            sqlx::query_scalar("SELECT parent_id FROM device_instance WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| self.error("parent_of", e))?;
        Ok(parent.flatten())
    }

    async fn node_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_instance")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.error("node_count", e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn set_parent(&self, id: &str, parent_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE device_instance
            SET parent_id = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(parent_id)
        .execute(&self.pool)
        .await
        .map_err(|e| self.error("set_parent", e))?;

        if result.rows_affected() == 0 {
            anyhow::bail!("device {id} does not exist");
        }
        Ok(())
    }

    async fn clear_parent(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE device_instance
            SET parent_id = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| self.error("clear_parent", e))?;
        Ok(())
    }
}

impl std::fmt::Debug for PgHierarchyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgHierarchyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statesync::{FailureKind, RetryPolicy};

    const WAITED: Duration = Duration::from_secs(30);

    #[test]
    fn test_io_errors_are_retryable() {
        let err = storage_error(
            "bulk_set_state",
            sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
            WAITED,
        );
        assert_eq!(RetryPolicy::default().classify(&err), FailureKind::Retryable);
        assert!(err.to_string().contains("bulk_set_state"));
    }

    #[test]
    fn test_pool_timeout_is_a_query_timeout() {
        let err = storage_error("bulk_set_state", sqlx::Error::PoolTimedOut, WAITED);
        let timeout = err.downcast_ref::<QueryTimeout>().unwrap();
        assert_eq!(timeout.elapsed, WAITED);
        assert_eq!(RetryPolicy::default().classify(&err), FailureKind::Retryable);
    }

    #[test]
    fn test_other_errors_are_permanent() {
        let err = storage_error("parent_of", sqlx::Error::RowNotFound, WAITED);
        assert_eq!(RetryPolicy::default().classify(&err), FailureKind::NonRetryable);

        let err = storage_error(
            "bulk_set_state",
            sqlx::Error::ColumnNotFound("state".into()),
            WAITED,
        );
        assert_eq!(RetryPolicy::default().classify(&err), FailureKind::NonRetryable);
    }

    #[test]
    fn test_timeouts_only_retry_when_configured() {
        let err = storage_error("bulk_set_state", sqlx::Error::PoolTimedOut, WAITED);
        let policy = RetryPolicy::new([statesync::RetryableKind::Io]);
        assert_eq!(policy.classify(&err), FailureKind::NonRetryable);
    }
}
