//! Runs against a live database when `DATABASE_URL` is set; otherwise each
//! test returns early.
//!
//! Every test works on a `pg_temp` copy of `device_instance` over a single
//! connection, so nothing is left behind.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use statesync::{DeviceRepository, DeviceState, HierarchyError, HierarchyService, WriteOptions};
use statesync_postgres::{PgDeviceRepository, PgHierarchyStore, SUPPRESS_SETTING};

async fn temp_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .unwrap();
    sqlx::query(
        r#"
        CREATE TEMP TABLE device_instance (
            id TEXT PRIMARY KEY,
            parent_id TEXT REFERENCES device_instance (id) ON DELETE SET NULL,
            state TEXT NOT NULL DEFAULT 'notActive',
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    Some(pool)
}

async fn seed(pool: &PgPool, id: &str, parent: Option<&str>, state: DeviceState) {
    sqlx::query("INSERT INTO device_instance (id, parent_id, state) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(parent)
        .bind(state.as_str())
        .execute(pool)
        .await
        .unwrap();
}

async fn state_of(pool: &PgPool, id: &str) -> DeviceState {
    let state: String = sqlx::query_scalar("SELECT state FROM device_instance WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap();
    DeviceState::parse(&state).unwrap()
}

#[tokio::test]
async fn test_bulk_update_honors_not_active_guard() {
    let Some(pool) = temp_pool().await else {
        return;
    };
    seed(&pool, "a", None, DeviceState::Offline).await;
    seed(&pool, "b", None, DeviceState::NotActive).await;

    let repository = PgDeviceRepository::new(pool.clone());
    let ids = vec!["a".to_string(), "b".to_string(), "missing".to_string()];

    let rows = repository
        .bulk_set_state(&ids, DeviceState::Online, WriteOptions::for_target(DeviceState::Online))
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(state_of(&pool, "a").await, DeviceState::Online);
    assert_eq!(state_of(&pool, "b").await, DeviceState::NotActive);

    let rows = repository
        .bulk_set_state(
            &ids,
            DeviceState::NotActive,
            WriteOptions::for_target(DeviceState::NotActive),
        )
        .await
        .unwrap();
    assert_eq!(rows, 2);
    assert_eq!(state_of(&pool, "a").await, DeviceState::NotActive);

    let stats = repository.stats().await.unwrap();
    assert_eq!(stats.not_active, 2);
}

#[tokio::test]
async fn test_suppression_setting_is_transaction_local() {
    let Some(pool) = temp_pool().await else {
        return;
    };
    seed(&pool, "a", None, DeviceState::Offline).await;

    PgDeviceRepository::new(pool.clone())
        .bulk_set_state(
            &["a".to_string()],
            DeviceState::Online,
            WriteOptions::for_target(DeviceState::Online),
        )
        .await
        .unwrap();

    let setting: Option<String> = sqlx::query_scalar("SELECT current_setting($1, true)")
        .bind(SUPPRESS_SETTING)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_ne!(setting.as_deref(), Some("on"));
}

#[tokio::test]
async fn test_hierarchy_rejects_cycles() {
    let Some(pool) = temp_pool().await else {
        return;
    };
    seed(&pool, "A", None, DeviceState::Online).await;
    seed(&pool, "B", Some("A"), DeviceState::Online).await;
    seed(&pool, "C", Some("B"), DeviceState::Online).await;

    let service = HierarchyService::new(Arc::new(PgHierarchyStore::new(pool.clone())));

    let err = service.set_parent("A", "C").await.unwrap_err();
    assert!(matches!(err, HierarchyError::CyclicDependency { .. }));

    let parent: Option<String> = sqlx::query_scalar("SELECT parent_id FROM device_instance WHERE id = 'A'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(parent, None);

    service.set_parent("C", "A").await.unwrap();
    service.unbind_child("B").await.unwrap();
}
