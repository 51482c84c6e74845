//! Ports the core consumes: storage of partition state and credential resolution.
//!
//! Both are object-safe so a concrete backend can be chosen at startup and
//! shared as `Arc<dyn _>`.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use zonehost_common::{Entity, EntityCreate, EntityId, EntityUpdate, PartitionId, PlayerId};

/// Errors surfaced by a data-access backend.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("unknown partition: {0}")]
    UnknownPartition(PartitionId),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Descriptive data for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub id: PartitionId,
    pub name: String,
}

impl PartitionMeta {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: PartitionId(id),
        }
    }
}

/// A partition's persisted state at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub meta: PartitionMeta,
    pub entities: Vec<Entity>,
}

/// Storage of partitions and their entities.
pub trait DataAccess: Send + Sync {
    fn list_partitions(&self) -> BoxFuture<'_, Result<Vec<PartitionId>, AccessError>>;

    fn load_snapshot<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> BoxFuture<'a, Result<PartitionSnapshot, AccessError>>;

    /// Persist one tick's deltas for a partition.
    fn apply<'a>(
        &'a self,
        partition: &'a PartitionId,
        creates: &'a [EntityCreate],
        updates: &'a [EntityUpdate],
        deletes: &'a [EntityId],
    ) -> BoxFuture<'a, Result<(), AccessError>>;

    /// Create the partition if it does not exist yet. Existing state is kept.
    fn ensure_partition(&self, meta: PartitionMeta) -> BoxFuture<'_, Result<(), AccessError>>;

    fn partition_exists<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> BoxFuture<'a, Result<bool, AccessError>> {
        Box::pin(async move { Ok(self.list_partitions().await?.contains(partition)) })
    }
}

/// Errors from credential resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("credential rejected")]
    Rejected,
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

/// The identity behind a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub player_id: PlayerId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            display_name: None,
        }
    }
}

/// Resolves a credential to an identity. Validation is the implementor's job.
pub trait Authenticator: Send + Sync {
    fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>>;
}
