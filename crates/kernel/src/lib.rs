//! Zonehost Kernel: authoritative tick loop, connection registry, intent queue
//! and the simulation plugin contract.
//!
//! # Invariants
//! - The core never interprets entity data or intent payloads.
//! - At most one live connection per player; stale connections cannot
//!   mutate state that belongs to a newer one.
//! - Every queued intent is handed to the simulation at most once.
//! - Plugin failures are contained to one partition for one tick.

pub mod config;
pub mod inspector;
pub mod intents;
pub mod plugin;
pub mod ports;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod transport;

pub use config::CoreConfig;
pub use inspector::{CoreInspector, CoreSummary};
pub use intents::IntentQueue;
pub use plugin::{
    PluginCatalog, PluginError, PluginFactory, PluginHost, Redaction, SimulationPlugin, TickState,
};
pub use ports::{
    AccessError, AuthError, Authenticator, DataAccess, Identity, PartitionMeta, PartitionSnapshot,
};
pub use protocol::{ClientMessage, InboundFrame, ProtocolError, ServerMessage};
pub use registry::{ConnectionInfo, ConnectionRegistry, DISCONNECT_ACTION, Deliveries, DeliveryConfig};
pub use router::{MessageRouter, RouterExit};
pub use scheduler::{SchedulerError, SchedulerState, StopOutcome, TickError, TickScheduler};
pub use stats::{TickHistory, TickStats};
pub use store::MemoryStore;
pub use transport::{ClientHandle, SendError, TrySend};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
