// Runs the synchronizer against synthetic online/offline traffic until Ctrl-C.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use statesync::{
    CanonicalState, DeviceMessage, DeviceRepository, DeviceState, EventBus, HierarchyService,
    HierarchyStore, StateSynchronizer, SyncHandle,
};
use statesync_postgres::{ensure_schema, PgDeviceRepository, PgHierarchyStore};
use statesync_testing::{InMemoryHierarchy, InMemoryRegistry, InMemoryRepository};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const PRODUCT: &str = "demo-sensor";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,statesync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        storage = %config.sync.buffer_dir().display(),
        batch_size = config.sync.batch_size,
        devices = config.devices,
        "configuration loaded"
    );

    let device_ids: Vec<String> = (0..config.devices).map(|i| format!("device-{i}")).collect();
    let gateway_ids: Vec<String> = (0..config.gateways).map(|i| format!("gateway-{i}")).collect();

    let (repository, store) = storage(&config, &device_ids, &gateway_ids).await?;
    let registry = InMemoryRegistry::new();
    for id in &gateway_ids {
        registry.set_gateway(id.clone());
        registry.set_state(id.clone(), CanonicalState::Online);
    }

    let bus = EventBus::new();
    let handle = StateSynchronizer::builder(config.sync.clone(), Arc::new(registry.clone()), repository)
        .with_hierarchy(HierarchyService::new(store))
        .start(&bus)
        .context("Failed to start synchronizer")?;

    let traffic = tokio::spawn(generate_traffic(
        bus.clone(),
        registry,
        device_ids,
        gateway_ids,
        config.message_interval,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    traffic.abort();
    stop(&handle).await
}

async fn stop(handle: &SyncHandle) -> Result<()> {
    handle.shutdown().await.context("Failed to shut down cleanly")?;
    tracing::info!(left_pending = handle.buffer().len(), "stopped");
    Ok(())
}

/// PostgreSQL storage when `DATABASE_URL` is set, in-memory otherwise.
async fn storage(
    config: &Config,
    device_ids: &[String],
    gateway_ids: &[String],
) -> Result<(Arc<dyn DeviceRepository>, Arc<dyn HierarchyStore>)> {
    let Some(url) = &config.database_url else {
        tracing::info!("DATABASE_URL not set, using in-memory storage");
        let repository = InMemoryRepository::new();
        for id in device_ids.iter().chain(gateway_ids) {
            repository.seed(id.clone(), DeviceState::Offline);
        }
        let hierarchy = InMemoryHierarchy::with_edges(
            device_ids
                .iter()
                .chain(gateway_ids)
                .map(|id| (id.as_str(), None)),
        );
        return Ok((Arc::new(repository), Arc::new(hierarchy)));
    };

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("Failed to connect to database")?;
    ensure_schema(&pool)
        .await
        .context("Failed to create device_instance")?;

    let ids: Vec<String> = device_ids.iter().chain(gateway_ids).cloned().collect();
    sqlx::query(
        r#"
        INSERT INTO device_instance (id, state)
        SELECT id, 'offline' FROM UNNEST($1::text[]) AS id
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&ids)
    .execute(&pool)
    .await
    .context("Failed to seed devices")?;
    tracing::info!(devices = ids.len(), "Database ready");

    Ok((
        Arc::new(PgDeviceRepository::new(pool.clone())),
        Arc::new(PgHierarchyStore::new(pool)),
    ))
}

/// Random online/offline flaps plus the occasional child (re)binding.
async fn generate_traffic(
    bus: EventBus,
    registry: InMemoryRegistry,
    device_ids: Vec<String>,
    gateway_ids: Vec<String>,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut rng = fastrand::Rng::new();

    loop {
        ticker.tick().await;

        if device_ids.is_empty() {
            continue;
        }
        let device = &device_ids[rng.usize(..device_ids.len())];

        if !gateway_ids.is_empty() && rng.u8(..100) < 5 {
            let gateway = &gateway_ids[rng.usize(..gateway_ids.len())];
            let message = if rng.bool() {
                DeviceMessage::child_register(PRODUCT, gateway.clone(), device.clone())
            } else {
                DeviceMessage::child_unregister(PRODUCT, gateway.clone(), device.clone())
            };
            bus.publish(message);
            continue;
        }

        let message = if rng.bool() {
            registry.set_state(device.clone(), CanonicalState::Online);
            DeviceMessage::online(PRODUCT, device.clone())
        } else {
            registry.set_state(device.clone(), CanonicalState::Offline);
            DeviceMessage::offline(PRODUCT, device.clone())
        };
        bus.publish(message);
    }
}
