//! Simulation plugin contract and loader.
//!
//! A plugin computes one step for one partition and projects the result per
//! viewer. It never sees connections or storage beyond the bootstrap call.
//! Calls made by the core go through [`guarded_step`] and [`guarded_redact`],
//! which turn panics into [`PluginError::Panicked`].

use crate::ports::DataAccess;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use zonehost_common::{Entity, Intent, PartitionId, PlayerId, TickResult};

/// Failures raised by or around plugin code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("plugin failed: {0}")]
    Failed(String),
    #[error("plugin panicked: {0}")]
    Panicked(String),
    #[error("plugin initialization failed: {0}")]
    Init(String),
    #[error("unknown plugin: {0}")]
    Unknown(String),
    #[error("invalid plugin settings: {0}")]
    Settings(String),
}

/// The authoritative post-apply state of a partition for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickState {
    pub tick_number: u64,
    pub partition_id: PartitionId,
    pub entities: Vec<Entity>,
    pub extras: Map<String, Value>,
}

impl TickState {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Result of a successful redaction call.
#[derive(Debug, Clone, PartialEq)]
pub enum Redaction {
    /// The plugin does not redact; viewers receive the full state.
    Passthrough,
    /// The per-viewer projection to send.
    View(Value),
}

/// Game logic plugged into the tick scheduler.
pub trait SimulationPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// One-time bootstrap. May write through the data-access port.
    fn initialize<'a>(&'a self, _store: &'a dyn DataAccess) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    /// Compute one step for one partition. Must not block.
    fn step(
        &self,
        partition: &PartitionId,
        entities: &[Entity],
        intents: &[Intent],
        tick_number: u64,
    ) -> Result<TickResult, PluginError>;

    /// Project the full state for one viewer. Read-only.
    fn redact(
        &self,
        _partition: &PartitionId,
        _viewer: &PlayerId,
        _state: &TickState,
    ) -> Result<Redaction, PluginError> {
        Ok(Redaction::Passthrough)
    }
}

pub fn guarded_step(
    plugin: &dyn SimulationPlugin,
    partition: &PartitionId,
    entities: &[Entity],
    intents: &[Intent],
    tick_number: u64,
) -> Result<TickResult, PluginError> {
    catch_unwind(AssertUnwindSafe(|| {
        plugin.step(partition, entities, intents, tick_number)
    }))
    .unwrap_or_else(|payload| Err(PluginError::Panicked(panic_message(payload.as_ref()))))
}

pub fn guarded_redact(
    plugin: &dyn SimulationPlugin,
    partition: &PartitionId,
    viewer: &PlayerId,
    state: &TickState,
) -> Result<Redaction, PluginError> {
    catch_unwind(AssertUnwindSafe(|| plugin.redact(partition, viewer, state)))
        .unwrap_or_else(|payload| Err(PluginError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Builds a plugin from its settings block.
pub type PluginFactory =
    Box<dyn Fn(&Value) -> Result<Arc<dyn SimulationPlugin>, PluginError> + Send + Sync>;

/// Named plugin factories; one is chosen at process start.
#[derive(Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn SimulationPlugin>, PluginError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str, settings: &Value) -> Result<Arc<dyn SimulationPlugin>, PluginError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PluginError::Unknown(name.to_string()))?;
        factory(settings)
    }
}

/// Loads the configured plugin, falling back to "no plugin" on any failure.
pub struct PluginHost;

impl PluginHost {
    /// Run `initialize`; a failure or panic means no plugin is loaded.
    pub async fn load(
        plugin: Arc<dyn SimulationPlugin>,
        store: &dyn DataAccess,
    ) -> Option<Arc<dyn SimulationPlugin>> {
        let init = AssertUnwindSafe(plugin.initialize(store)).catch_unwind().await;
        match init {
            Ok(Ok(())) => {
                tracing::info!(plugin = plugin.name(), "simulation plugin loaded");
                Some(plugin)
            }
            Ok(Err(e)) => {
                tracing::error!(plugin = plugin.name(), error = %e, "plugin initialization failed; running without plugin");
                None
            }
            Err(payload) => {
                let e = PluginError::Panicked(panic_message(payload.as_ref()));
                tracing::error!(plugin = plugin.name(), error = %e, "plugin initialization panicked; running without plugin");
                None
            }
        }
    }

    /// Look up `name` in the catalog, build it and load it.
    pub async fn load_named(
        catalog: &PluginCatalog,
        name: Option<&str>,
        settings: &Value,
        store: &dyn DataAccess,
    ) -> Option<Arc<dyn SimulationPlugin>> {
        let Some(name) = name else {
            tracing::info!("no simulation plugin configured; broadcasting raw snapshots");
            return None;
        };
        match catalog.create(name, settings) {
            Ok(plugin) => Self::load(plugin, store).await,
            Err(e) => {
                tracing::error!(plugin = name, error = %e, "cannot create plugin; running without plugin");
                None
            }
        }
    }
}
