//! Built-in simulation plugins.
//!
//! # Invariants
//! - Plugins are selected by name from [`builtin_catalog`]; nothing is
//!   discovered at runtime.

pub mod arena;

pub use arena::{ArenaPlugin, ArenaSettings};

use zonehost_kernel::PluginCatalog;

/// Catalog of every plugin shipped with the server.
pub fn builtin_catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    catalog.register(ArenaPlugin::NAME, ArenaPlugin::from_settings);
    catalog
}
