//! Shared types for the zonehost workspace.
//!
//! # Invariants
//! - Identifiers are plain data compared by value.
//! - Entity state is structured JSON; the core never interprets it.

mod delta;
mod types;

pub use delta::{EntityCreate, EntityUpdate, Intent, IntentOrigin, TickResult, apply_deltas};
pub use types::{ConnectionId, Entity, EntityId, PartitionId, PlayerId};
