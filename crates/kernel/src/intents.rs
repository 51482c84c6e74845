use crate::lock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use zonehost_common::{Intent, IntentOrigin, PartitionId, PlayerId};

/// Per-partition buffer of pending intents.
///
/// Any connection may enqueue at any time; only the scheduler drains, once per
/// partition per tick. The lock covers the push or the swap-out, nothing else.
#[derive(Debug, Default)]
pub struct IntentQueue {
    inner: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<PartitionId, Vec<Intent>>,
    next_sequence: u64,
}

impl IntentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a client-submitted intent. Never blocks on a tick in progress.
    pub fn enqueue(&self, partition: PartitionId, player: PlayerId, payload: Value) -> u64 {
        self.push(partition, player, payload, now_millis(), IntentOrigin::Client)
    }

    /// Queue an intent originating from the core itself.
    pub fn enqueue_system(&self, partition: PartitionId, player: PlayerId, payload: Value) -> u64 {
        self.push(partition, player, payload, now_millis(), IntentOrigin::System)
    }

    /// Queue with an explicit timestamp (milliseconds since the Unix epoch).
    pub fn enqueue_at(
        &self,
        partition: PartitionId,
        player: PlayerId,
        payload: Value,
        timestamp: u64,
    ) -> u64 {
        self.push(partition, player, payload, timestamp, IntentOrigin::Client)
    }

    fn push(
        &self,
        partition: PartitionId,
        player: PlayerId,
        payload: Value,
        timestamp: u64,
        origin: IntentOrigin,
    ) -> u64 {
        let mut state = lock(&self.inner);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let intent = Intent {
            player_id: player,
            partition_id: partition.clone(),
            payload,
            timestamp,
            sequence,
            origin,
        };
        state.pending.entry(partition).or_default().push(intent);
        sequence
    }

    /// Remove and return every queued intent for a partition, oldest first.
    ///
    /// Ties on timestamp keep arrival order.
    pub fn drain(&self, partition: &PartitionId) -> Vec<Intent> {
        let mut drained = lock(&self.inner)
            .pending
            .remove(partition)
            .unwrap_or_default();
        drained.sort_by_key(|intent| (intent.timestamp, intent.sequence));
        drained
    }

    /// Number of intents waiting for a partition.
    pub fn pending(&self, partition: &PartitionId) -> usize {
        lock(&self.inner).pending.get(partition).map_or(0, Vec::len)
    }

    /// Total number of intents waiting across all partitions.
    pub fn total_pending(&self) -> usize {
        lock(&self.inner).pending.values().map(Vec::len).sum()
    }

    /// Drop queues of partitions that are not in `known`. Returns how many
    /// intents were discarded.
    pub fn retain_partitions(&self, known: &[PartitionId]) -> usize {
        let mut state = lock(&self.inner);
        let mut discarded = 0;
        state.pending.retain(|partition, intents| {
            let keep = known.contains(partition);
            if !keep {
                tracing::debug!(%partition, count = intents.len(), "discarding intents for unknown partition");
                discarded += intents.len();
            }
            keep
        });
        discarded
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
