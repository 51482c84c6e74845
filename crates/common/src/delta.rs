use crate::types::{Entity, EntityId, PartitionId, PlayerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where an intent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentOrigin {
    /// Submitted by the player over their connection.
    Client,
    /// Injected by the core itself (e.g. on disconnect).
    System,
}

/// A pending action for one partition, consumed by exactly one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub player_id: PlayerId,
    pub partition_id: PartitionId,
    pub payload: Value,
    /// Submission time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Arrival order; breaks timestamp ties.
    pub sequence: u64,
    pub origin: IntentOrigin,
}

impl Intent {
    /// The `action` field of an object payload, if present.
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }
}

/// A new entity produced by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreate {
    pub entity: Entity,
}

/// A data patch for an existing entity; see [`Entity::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub id: EntityId,
    pub data: Value,
}

/// Output of one plugin step for one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickResult {
    #[serde(default)]
    pub entity_creates: Vec<EntityCreate>,
    #[serde(default)]
    pub entity_updates: Vec<EntityUpdate>,
    #[serde(default)]
    pub entity_deletes: Vec<EntityId>,
    /// Plugin-defined side data forwarded to redaction. Never entity state.
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl TickResult {
    pub fn is_empty(&self) -> bool {
        self.entity_creates.is_empty()
            && self.entity_updates.is_empty()
            && self.entity_deletes.is_empty()
    }

    pub fn create(mut self, entity: Entity) -> Self {
        self.entity_creates.push(EntityCreate { entity });
        self
    }

    pub fn update(mut self, id: EntityId, data: Value) -> Self {
        self.entity_updates.push(EntityUpdate { id, data });
        self
    }

    pub fn delete(mut self, id: EntityId) -> Self {
        self.entity_deletes.push(id);
        self
    }

    /// Apply this result's deltas to an entity list in place.
    pub fn apply_to(&self, entities: &mut Vec<Entity>) {
        apply_deltas(
            entities,
            &self.entity_creates,
            &self.entity_updates,
            &self.entity_deletes,
        );
    }
}

/// Apply creates, then updates, then deletes.
///
/// A create whose id already exists replaces that entity. Updates and
/// deletes naming unknown ids are ignored.
pub fn apply_deltas(
    entities: &mut Vec<Entity>,
    creates: &[EntityCreate],
    updates: &[EntityUpdate],
    deletes: &[EntityId],
) {
    for create in creates {
        match entities.iter_mut().find(|e| e.id == create.entity.id) {
            Some(existing) => *existing = create.entity.clone(),
            None => entities.push(create.entity.clone()),
        }
    }
    for update in updates {
        if let Some(existing) = entities.iter_mut().find(|e| e.id == update.id) {
            existing.merge(&update.data);
        }
    }
    if !deletes.is_empty() {
        entities.retain(|e| !deletes.contains(&e.id));
    }
}
