use crate::lock;
use crate::ports::{AccessError, DataAccess, PartitionMeta, PartitionSnapshot};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use zonehost_common::{Entity, EntityCreate, EntityId, EntityUpdate, PartitionId, apply_deltas};

/// In-memory data-access backend.
///
/// Partitions iterate in id order. Failures can be injected per partition
/// (apply) or globally (listing) to exercise the scheduler's recovery paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: Mutex<BTreeMap<PartitionId, PartitionSnapshot>>,
    failing_applies: Mutex<HashSet<PartitionId>>,
    failing_listing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding empty partitions with the given ids.
    pub fn with_partitions<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut partitions = lock(&store.partitions);
            for id in ids {
                let meta = PartitionMeta::new(id);
                partitions.insert(
                    meta.id.clone(),
                    PartitionSnapshot {
                        meta,
                        entities: Vec::new(),
                    },
                );
            }
        }
        store
    }

    /// Insert an entity directly, bypassing the tick pipeline.
    pub fn insert_entity(&self, partition: &PartitionId, entity: Entity) -> bool {
        match lock(&self.partitions).get_mut(partition) {
            Some(snapshot) => {
                snapshot.entities.push(entity);
                true
            }
            None => false,
        }
    }

    /// Current entities of a partition.
    pub fn entities(&self, partition: &PartitionId) -> Option<Vec<Entity>> {
        lock(&self.partitions)
            .get(partition)
            .map(|snapshot| snapshot.entities.clone())
    }

    pub fn remove_partition(&self, partition: &PartitionId) -> bool {
        lock(&self.partitions).remove(partition).is_some()
    }

    /// Make `apply` fail for one partition until cleared.
    pub fn fail_apply(&self, partition: &PartitionId, failing: bool) {
        let mut failing_applies = lock(&self.failing_applies);
        if failing {
            failing_applies.insert(partition.clone());
        } else {
            failing_applies.remove(partition);
        }
    }

    /// Make `list_partitions` fail until cleared.
    pub fn fail_listing(&self, failing: bool) {
        self.failing_listing.store(failing, Ordering::SeqCst);
    }
}

impl DataAccess for MemoryStore {
    fn list_partitions(&self) -> BoxFuture<'_, Result<Vec<PartitionId>, AccessError>> {
        Box::pin(async move {
            if self.failing_listing.load(Ordering::SeqCst) {
                return Err(AccessError::Unavailable("listing disabled".into()));
            }
            Ok(lock(&self.partitions).keys().cloned().collect())
        })
    }

    fn load_snapshot<'a>(
        &'a self,
        partition: &'a PartitionId,
    ) -> BoxFuture<'a, Result<PartitionSnapshot, AccessError>> {
        Box::pin(async move {
            lock(&self.partitions)
                .get(partition)
                .cloned()
                .ok_or_else(|| AccessError::UnknownPartition(partition.clone()))
        })
    }

    fn apply<'a>(
        &'a self,
        partition: &'a PartitionId,
        creates: &'a [EntityCreate],
        updates: &'a [EntityUpdate],
        deletes: &'a [EntityId],
    ) -> BoxFuture<'a, Result<(), AccessError>> {
        Box::pin(async move {
            if lock(&self.failing_applies).contains(partition) {
                return Err(AccessError::Unavailable(format!(
                    "apply disabled for {partition}"
                )));
            }
            let mut partitions = lock(&self.partitions);
            let snapshot = partitions
                .get_mut(partition)
                .ok_or_else(|| AccessError::UnknownPartition(partition.clone()))?;
            apply_deltas(&mut snapshot.entities, creates, updates, deletes);
            Ok(())
        })
    }

    fn ensure_partition(&self, meta: PartitionMeta) -> BoxFuture<'_, Result<(), AccessError>> {
        Box::pin(async move {
            lock(&self.partitions)
                .entry(meta.id.clone())
                .or_insert_with(|| PartitionSnapshot {
                    meta,
                    entities: Vec::new(),
                });
            Ok(())
        })
    }
}
