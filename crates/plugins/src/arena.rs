//! Arena: one avatar per player moving on a bounded plane.
//!
//! Intents (`payload.action`):
//! - `join` spawns the sender's avatar at the origin.
//! - `move` with `dx`/`dy` moves it, each axis clamped to `max_step`.
//! - `leave`, and the core's `owner_disconnected`, remove it.
//!
//! Each viewer only sees positioned entities within `view_radius` of their
//! own avatar.

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use zonehost_common::{Entity, EntityId, Intent, PartitionId, PlayerId, TickResult};
use zonehost_kernel::{
    DISCONNECT_ACTION, DataAccess, PartitionMeta, PluginError, Redaction, SimulationPlugin,
    TickState,
};

const AVATAR_KIND: &str = "avatar";

/// Settings block for the arena plugin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArenaSettings {
    /// Zones created at bootstrap if they do not exist yet.
    pub zones: Vec<String>,
    pub view_radius: f64,
    pub max_step: f64,
    /// Avatars are kept within `[-half_extent, half_extent]` on both axes.
    pub half_extent: f64,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            zones: vec!["lobby".to_string()],
            view_radius: 10.0,
            max_step: 1.0,
            half_extent: 50.0,
        }
    }
}

impl ArenaSettings {
    fn validate(&self) -> Result<(), PluginError> {
        for (name, value) in [
            ("view_radius", self.view_radius),
            ("max_step", self.max_step),
            ("half_extent", self.half_extent),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PluginError::Settings(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

pub struct ArenaPlugin {
    settings: ArenaSettings,
}

/// Working copy of one avatar during a step.
#[derive(Debug, Clone)]
struct Avatar {
    id: EntityId,
    x: f64,
    y: f64,
    spawned: bool,
    moved: bool,
}

impl ArenaPlugin {
    pub const NAME: &'static str = "arena";

    pub fn new(settings: ArenaSettings) -> Result<Self, PluginError> {
        settings.validate()?;
        Ok(Self { settings })
    }

    /// Catalog factory. `null` means default settings.
    pub fn from_settings(settings: &Value) -> Result<Arc<dyn SimulationPlugin>, PluginError> {
        let settings = if settings.is_null() {
            ArenaSettings::default()
        } else {
            ArenaSettings::deserialize(settings).map_err(|e| PluginError::Settings(e.to_string()))?
        };
        Ok(Arc::new(Self::new(settings)?))
    }

    pub fn settings(&self) -> &ArenaSettings {
        &self.settings
    }

    fn clamp_axis(&self, position: f64, delta: f64) -> f64 {
        let step = delta.clamp(-self.settings.max_step, self.settings.max_step);
        (position + step).clamp(-self.settings.half_extent, self.settings.half_extent)
    }
}

fn position(entity: &Entity) -> Option<(f64, f64)> {
    Some((entity.data.get("x")?.as_f64()?, entity.data.get("y")?.as_f64()?))
}

fn axis(payload: &Value, key: &str) -> f64 {
    payload
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

impl SimulationPlugin for ArenaPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initialize<'a>(&'a self, store: &'a dyn DataAccess) -> BoxFuture<'a, Result<(), PluginError>> {
        Box::pin(async move {
            for zone in &self.settings.zones {
                store
                    .ensure_partition(PartitionMeta::new(zone.as_str()))
                    .await
                    .map_err(|e| PluginError::Init(format!("zone {zone}: {e}")))?;
            }
            tracing::info!(zones = self.settings.zones.len(), "arena zones ready");
            Ok(())
        })
    }

    fn step(
        &self,
        partition: &PartitionId,
        entities: &[Entity],
        intents: &[Intent],
        _tick_number: u64,
    ) -> Result<TickResult, PluginError> {
        let mut avatars: BTreeMap<PlayerId, Avatar> = entities
            .iter()
            .filter(|e| e.kind == AVATAR_KIND)
            .filter_map(|e| {
                let owner = e.owner.clone()?;
                let (x, y) = position(e).unwrap_or((0.0, 0.0));
                Some((
                    owner,
                    Avatar {
                        id: e.id,
                        x,
                        y,
                        spawned: false,
                        moved: false,
                    },
                ))
            })
            .collect();
        let mut removed = Vec::new();

        for intent in intents {
            let player = &intent.player_id;
            match intent.action() {
                Some("join") => {
                    avatars.entry(player.clone()).or_insert_with(|| Avatar {
                        id: EntityId::new(),
                        x: 0.0,
                        y: 0.0,
                        spawned: true,
                        moved: false,
                    });
                }
                Some("move") => {
                    let Some(avatar) = avatars.get_mut(player) else {
                        tracing::debug!(%partition, %player, "move without avatar ignored");
                        continue;
                    };
                    avatar.x = self.clamp_axis(avatar.x, axis(&intent.payload, "dx"));
                    avatar.y = self.clamp_axis(avatar.y, axis(&intent.payload, "dy"));
                    avatar.moved = true;
                }
                Some("leave") | Some(DISCONNECT_ACTION) => {
                    if let Some(avatar) = avatars.remove(player) {
                        if !avatar.spawned {
                            removed.push(avatar.id);
                        }
                    }
                }
                other => {
                    tracing::debug!(%partition, %player, action = ?other, "unrecognized arena intent");
                }
            }
        }

        let mut result = TickResult::default();
        for (owner, avatar) in &avatars {
            let data = json!({"x": avatar.x, "y": avatar.y});
            if avatar.spawned {
                let mut entity = Entity::new(AVATAR_KIND, data).owned_by(owner.clone());
                entity.id = avatar.id;
                result = result.create(entity);
            } else if avatar.moved {
                result = result.update(avatar.id, data);
            }
        }
        for id in removed {
            result = result.delete(id);
        }
        result.extras.insert("players".into(), json!(avatars.len()));
        Ok(result)
    }

    fn redact(
        &self,
        _partition: &PartitionId,
        viewer: &PlayerId,
        state: &TickState,
    ) -> Result<Redaction, PluginError> {
        let origin = state
            .entities
            .iter()
            .find(|e| e.kind == AVATAR_KIND && e.owner.as_ref() == Some(viewer))
            .and_then(position);
        let radius = self.settings.view_radius;

        let visible: Vec<&Entity> = state
            .entities
            .iter()
            .filter(|e| match (position(e), origin) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some((x, y)), Some((ox, oy))) => (x - ox).hypot(y - oy) <= radius,
            })
            .collect();

        let mut view = Map::new();
        view.insert("tick_number".into(), json!(state.tick_number));
        view.insert("partition_id".into(), json!(state.partition_id));
        view.insert(
            "entities".into(),
            serde_json::to_value(&visible).map_err(|e| PluginError::Failed(e.to_string()))?,
        );
        view.insert("extras".into(), Value::Object(state.extras.clone()));
        view.insert("viewer_id".into(), json!(viewer));
        Ok(Redaction::View(Value::Object(view)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonehost_common::IntentOrigin;
    use zonehost_kernel::MemoryStore;

    fn arena() -> ArenaPlugin {
        ArenaPlugin::new(ArenaSettings {
            zones: vec!["lobby".into(), "pit".into()],
            view_radius: 5.0,
            max_step: 2.0,
            half_extent: 10.0,
        })
        .unwrap()
    }

    fn intent(player: &str, payload: Value, sequence: u64) -> Intent {
        Intent {
            player_id: PlayerId::new(player),
            partition_id: PartitionId::new("lobby"),
            payload,
            timestamp: 0,
            sequence,
            origin: IntentOrigin::Client,
        }
    }

    fn avatar(owner: &str, x: f64, y: f64) -> Entity {
        Entity::new(AVATAR_KIND, json!({"x": x, "y": y})).owned_by(PlayerId::new(owner))
    }

    fn lobby() -> PartitionId {
        PartitionId::new("lobby")
    }

    #[test]
    fn join_then_move_in_same_tick_creates_at_final_position() {
        let intents = [
            intent("a", json!({"action": "join"}), 0),
            intent("a", json!({"action": "move", "dx": 1.5, "dy": -1}), 1),
            intent("a", json!({"action": "join"}), 2),
        ];
        let result = arena().step(&lobby(), &[], &intents, 1).unwrap();
        assert_eq!(result.entity_creates.len(), 1);
        let created = &result.entity_creates[0].entity;
        assert_eq!(created.owner, Some(PlayerId::new("a")));
        assert_eq!(created.data, json!({"x": 1.5, "y": -1.0}));
        assert!(result.entity_updates.is_empty());
        assert_eq!(result.extras["players"], json!(1));
    }

    #[test]
    fn moves_are_clamped_to_step_and_bounds() {
        let existing = avatar("a", 9.5, 0.0);
        let intents = [intent("a", json!({"action": "move", "dx": 100, "dy": -100}), 0)];
        let result = arena().step(&lobby(), &[existing.clone()], &intents, 1).unwrap();
        assert_eq!(result.entity_updates.len(), 1);
        assert_eq!(result.entity_updates[0].id, existing.id);
        assert_eq!(result.entity_updates[0].data, json!({"x": 10.0, "y": -2.0}));
    }

    #[test]
    fn disconnect_despawns_avatar() {
        let existing = avatar("a", 0.0, 0.0);
        let intents = [intent("a", json!({"action": DISCONNECT_ACTION}), 0)];
        let result = arena().step(&lobby(), &[existing.clone()], &intents, 1).unwrap();
        assert_eq!(result.entity_deletes, vec![existing.id]);
        assert_eq!(result.extras["players"], json!(0));
    }

    #[test]
    fn join_and_leave_in_same_tick_is_a_no_op() {
        let intents = [
            intent("a", json!({"action": "join"}), 0),
            intent("a", json!({"action": "leave"}), 1),
        ];
        let result = arena().step(&lobby(), &[], &intents, 1).unwrap();
        assert!(result.entity_creates.is_empty());
        assert!(result.entity_deletes.is_empty());
    }

    #[test]
    fn unknown_actions_and_orphan_moves_are_ignored() {
        let intents = [
            intent("a", json!({"action": "dance"}), 0),
            intent("b", json!({"action": "move", "dx": 1}), 1),
            intent("c", json!("not an object"), 2),
        ];
        let result = arena().step(&lobby(), &[], &intents, 1).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn redaction_limits_view_to_radius() {
        let a = avatar("a", 0.0, 0.0);
        let near = avatar("b", 3.0, 4.0);
        let far = avatar("c", 8.0, 0.0);
        let banner = Entity::new("banner", json!({"text": "welcome"}));
        let state = TickState {
            tick_number: 7,
            partition_id: lobby(),
            entities: vec![a.clone(), near.clone(), far.clone(), banner.clone()],
            extras: Map::new(),
        };

        let Redaction::View(view) = arena().redact(&lobby(), &PlayerId::new("a"), &state).unwrap()
        else {
            panic!("arena always projects");
        };
        let ids: Vec<Value> = view["entities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(a.id), json!(near.id), json!(banner.id)]);
        assert_eq!(view["viewer_id"], json!("a"));
        assert_eq!(view["tick_number"], json!(7));
    }

    #[test]
    fn spectators_see_only_unpositioned_entities() {
        let banner = Entity::new("banner", json!({}));
        let state = TickState {
            tick_number: 1,
            partition_id: lobby(),
            entities: vec![avatar("a", 0.0, 0.0), banner.clone()],
            extras: Map::new(),
        };
        let Redaction::View(view) = arena().redact(&lobby(), &PlayerId::new("ghost"), &state).unwrap()
        else {
            panic!("arena always projects");
        };
        assert_eq!(view["entities"].as_array().map(Vec::len), Some(1));
        assert_eq!(view["entities"][0]["id"], json!(banner.id));
    }

    #[test]
    fn settings_are_validated() {
        assert!(ArenaPlugin::from_settings(&Value::Null).is_ok());
        assert!(ArenaPlugin::from_settings(&json!({"max_step": 0})).is_err());
        assert!(ArenaPlugin::from_settings(&json!({"teleport": true})).is_err());
    }

    #[tokio::test]
    async fn initialize_creates_configured_zones() {
        let store = MemoryStore::with_partitions(["pit"]);
        arena().initialize(&store).await.unwrap();
        let ids = store.list_partitions().await.unwrap();
        assert_eq!(ids, vec![PartitionId::new("lobby"), PartitionId::new("pit")]);
    }
}
