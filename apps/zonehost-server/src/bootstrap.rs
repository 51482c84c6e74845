use crate::config::{ServerConfig, StoreConfig};
use std::sync::Arc;
use zonehost_kernel::{
    Authenticator, ConnectionRegistry, DataAccess, DeliveryConfig, IntentQueue, MemoryStore,
    PartitionMeta, PluginHost, TickScheduler,
};
use zonehost_persist::FileStore;

/// The wired-up simulation core shared by the transport and the CLI.
#[derive(Clone)]
pub struct Core {
    pub scheduler: TickScheduler,
    pub registry: Arc<ConnectionRegistry>,
    pub intents: Arc<IntentQueue>,
    pub store: Arc<dyn DataAccess>,
}

/// Open the configured store and ensure its seed zones exist.
pub async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn DataAccess>> {
    let store: Arc<dyn DataAccess> = match config {
        StoreConfig::Memory { .. } => Arc::new(MemoryStore::new()),
        StoreConfig::File { path, .. } => Arc::new(FileStore::open(path)?),
    };
    for zone in config.zones() {
        store.ensure_partition(PartitionMeta::new(zone.as_str())).await?;
    }
    Ok(store)
}

/// Build the core: store, plugin, intent queue, registry and scheduler.
///
/// A plugin that fails to build or initialize is logged and the core runs
/// without one.
pub async fn build_core(
    config: &ServerConfig,
    store: Arc<dyn DataAccess>,
    authenticator: Arc<dyn Authenticator>,
) -> Core {
    let catalog = zonehost_plugins::builtin_catalog();
    let plugin = PluginHost::load_named(
        &catalog,
        config.plugin.as_deref(),
        &config.plugin_settings,
        store.as_ref(),
    )
    .await;

    let intents = Arc::new(IntentQueue::new());
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::clone(&intents),
        authenticator,
        DeliveryConfig {
            send_timeout: config.core.send_timeout(),
            max_inflight: config.core.max_inflight_deliveries,
        },
    ));
    let scheduler = TickScheduler::new(
        config.core.clone(),
        Arc::clone(&store),
        Arc::clone(&intents),
        Arc::clone(&registry),
        plugin,
    );
    Core {
        scheduler,
        registry,
        intents,
        store,
    }
}
