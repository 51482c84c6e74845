use crate::intents::IntentQueue;
use crate::lock;
use crate::ports::{AuthError, Authenticator};
use crate::protocol::ServerMessage;
use crate::transport::{ClientHandle, SendError, TrySend};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use zonehost_common::{ConnectionId, PartitionId, PlayerId};

/// Action of the system intent queued when a subscribed player disconnects.
pub const DISCONNECT_ACTION: &str = "owner_disconnected";

/// One live, authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub player_id: PlayerId,
    pub connection_id: ConnectionId,
    pub handle: ClientHandle,
    pub subscribed_partition: Option<PartitionId>,
}

/// Outbound delivery settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub send_timeout: Duration,
    pub max_inflight: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(2),
            max_inflight: 1_024,
        }
    }
}

/// Outcome of one recipient's delivery.
#[derive(Debug)]
enum Delivery {
    /// Settled without waiting: queued, closed or refused.
    Settled(Result<(), SendError>),
    /// Waiting in a spawned job for room in the recipient's queue.
    Waiting(JoinHandle<Result<(), SendError>>),
}

/// Deliveries from one broadcast or send.
///
/// Dropping this detaches the waiting jobs; they still run to completion or
/// timeout.
#[derive(Debug, Default)]
pub struct Deliveries {
    jobs: Vec<(PlayerId, Delivery)>,
}

impl Deliveries {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Deliveries still waiting on a slow recipient.
    pub fn waiting(&self) -> usize {
        self.jobs
            .iter()
            .filter(|(_, delivery)| matches!(delivery, Delivery::Waiting(_)))
            .count()
    }

    pub fn extend(&mut self, other: Deliveries) {
        self.jobs.extend(other.jobs);
    }

    /// Wait for every job and report per-recipient outcomes.
    pub async fn settled(self) -> Vec<(PlayerId, Result<(), SendError>)> {
        let mut outcomes = Vec::with_capacity(self.jobs.len());
        for (player, delivery) in self.jobs {
            let outcome = match delivery {
                Delivery::Settled(outcome) => outcome,
                Delivery::Waiting(job) => job.await.unwrap_or(Err(SendError::Closed)),
            };
            outcomes.push((player, outcome));
        }
        outcomes
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<PlayerId, ConnectionInfo>,
    subscriptions: HashMap<PartitionId, HashSet<PlayerId>>,
}

impl RegistryState {
    fn unsubscribe(&mut self, player: &PlayerId, partition: &PartitionId) {
        if let Some(set) = self.subscriptions.get_mut(partition) {
            set.remove(player);
            if set.is_empty() {
                self.subscriptions.remove(partition);
            }
        }
    }
}

/// Live connections and the partition subscription index.
///
/// Every mutation happens under one mutex. Queries copy out so callers can
/// iterate and send without holding it.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    intents: Arc<IntentQueue>,
    authenticator: Arc<dyn Authenticator>,
    next_connection: AtomicU64,
    delivery: DeliveryConfig,
    delivery_slots: Arc<Semaphore>,
}

impl ConnectionRegistry {
    pub fn new(
        intents: Arc<IntentQueue>,
        authenticator: Arc<dyn Authenticator>,
        delivery: DeliveryConfig,
    ) -> Self {
        let slots = delivery.max_inflight.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            state: Mutex::new(RegistryState::default()),
            intents,
            authenticator,
            next_connection: AtomicU64::new(1),
            delivery,
            delivery_slots: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Resolve a credential and mint a fresh connection for the identity.
    ///
    /// The result is not registered yet; see [`register`](Self::register).
    pub async fn authenticate(
        &self,
        handle: ClientHandle,
        credential: &str,
    ) -> Result<ConnectionInfo, AuthError> {
        let identity = self.authenticator.resolve(credential).await?;
        let connection_id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(player = %identity.player_id, %connection_id, "authenticated");
        Ok(ConnectionInfo {
            player_id: identity.player_id,
            connection_id,
            handle,
            subscribed_partition: None,
        })
    }

    /// Install a connection, superseding any previous one of the same player.
    ///
    /// The previous connection is closed and its subscription removed before
    /// the new one becomes visible; a torn-down subscription leaves a
    /// [`DISCONNECT_ACTION`] system intent in that partition. Returns the
    /// superseded connection id.
    pub fn register(&self, mut info: ConnectionInfo) -> Option<ConnectionId> {
        info.subscribed_partition = None;
        let mut state = lock(&self.state);
        let previous = state.connections.remove(&info.player_id);
        if let Some(old) = &previous {
            if let Some(partition) = &old.subscribed_partition {
                self.queue_departure(&old.player_id, partition);
                state.unsubscribe(&old.player_id, partition);
            }
            old.handle.close();
            tracing::info!(
                player = %info.player_id,
                old = %old.connection_id,
                new = %info.connection_id,
                "superseding previous connection"
            );
        } else {
            tracing::info!(player = %info.player_id, connection = %info.connection_id, "connection registered");
        }
        state.connections.insert(info.player_id.clone(), info);
        previous.map(|old| old.connection_id)
    }

    /// Remove a player's connection.
    ///
    /// With `connection`, nothing happens unless it is the currently registered
    /// one. A subscribed player leaves a [`DISCONNECT_ACTION`] system intent in
    /// its partition's queue. Returns whether anything was removed.
    pub fn unregister(&self, player: &PlayerId, connection: Option<ConnectionId>) -> bool {
        let mut state = lock(&self.state);
        let current = match state.connections.get(player) {
            Some(current) => current,
            None => return false,
        };
        if let Some(expected) = connection {
            if current.connection_id != expected {
                tracing::trace!(%player, stale = %expected, current = %current.connection_id, "ignoring stale unregister");
                return false;
            }
        }
        let Some(removed) = state.connections.remove(player) else {
            return false;
        };
        if let Some(partition) = &removed.subscribed_partition {
            self.queue_departure(player, partition);
            state.unsubscribe(player, partition);
        }
        tracing::info!(%player, connection = %removed.connection_id, "connection unregistered");
        true
    }

    /// Point a player's subscription at `partition`.
    ///
    /// Moving away from another partition leaves a [`DISCONNECT_ACTION`]
    /// system intent there. Returns false when the player has no live
    /// connection.
    pub fn subscribe(&self, player: &PlayerId, partition: &PartitionId) -> bool {
        let mut state = lock(&self.state);
        let previous = match state.connections.get_mut(player) {
            Some(info) => info.subscribed_partition.replace(partition.clone()),
            None => return false,
        };
        if let Some(previous) = previous.filter(|previous| previous != partition) {
            self.queue_departure(player, &previous);
            state.unsubscribe(player, &previous);
        }
        state
            .subscriptions
            .entry(partition.clone())
            .or_default()
            .insert(player.clone());
        tracing::debug!(%player, %partition, "subscribed");
        true
    }

    pub fn subscription_of(&self, player: &PlayerId) -> Option<PartitionId> {
        lock(&self.state)
            .connections
            .get(player)
            .and_then(|info| info.subscribed_partition.clone())
    }

    /// Whether `connection` is the player's currently registered connection.
    pub fn is_current(&self, player: &PlayerId, connection: ConnectionId) -> bool {
        lock(&self.state)
            .connections
            .get(player)
            .is_some_and(|info| info.connection_id == connection)
    }

    pub fn connection(&self, player: &PlayerId) -> Option<ConnectionInfo> {
        lock(&self.state).connections.get(player).cloned()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn subscription_count(&self, partition: &PartitionId) -> usize {
        lock(&self.state)
            .subscriptions
            .get(partition)
            .map_or(0, HashSet::len)
    }

    /// Point-in-time copy of a partition's subscribers, ordered by player id.
    pub fn subscribers(&self, partition: &PartitionId) -> Vec<ConnectionInfo> {
        let state = lock(&self.state);
        let Some(players) = state.subscriptions.get(partition) else {
            return Vec::new();
        };
        let mut subscribers: Vec<ConnectionInfo> = players
            .iter()
            .filter_map(|player| state.connections.get(player).cloned())
            .collect();
        subscribers.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        subscribers
    }

    /// Send one message to one connection as a detached, time-bounded job.
    pub fn send_to(&self, info: &ConnectionInfo, message: ServerMessage) -> Deliveries {
        Deliveries {
            jobs: vec![(info.player_id.clone(), self.deliver(info, message))],
        }
    }

    /// Fan a message out to every current subscriber of a partition.
    ///
    /// Each delivery is independent: a stalled or failed recipient neither
    /// delays the others nor gets disconnected here.
    pub fn broadcast_to(
        &self,
        partition: &PartitionId,
        message: ServerMessage,
        exclude: Option<&PlayerId>,
    ) -> Deliveries {
        let jobs = self
            .subscribers(partition)
            .into_iter()
            .filter(|info| Some(&info.player_id) != exclude)
            .map(|info| {
                let delivery = self.deliver(&info, message.clone());
                (info.player_id, delivery)
            })
            .collect();
        Deliveries { jobs }
    }

    fn queue_departure(&self, player: &PlayerId, partition: &PartitionId) {
        self.intents.enqueue_system(
            partition.clone(),
            player.clone(),
            json!({ "action": DISCONNECT_ACTION }),
        );
    }

    /// Close every live connection; used on shutdown.
    pub fn close_all(&self) {
        for info in lock(&self.state).connections.values() {
            info.handle.close();
        }
    }

    /// Queue directly when the recipient has room; otherwise wait in a
    /// spawned job holding one of the `max_inflight` slots. With no slot free
    /// the message is dropped as [`SendError::Saturated`].
    fn deliver(&self, info: &ConnectionInfo, message: ServerMessage) -> Delivery {
        let player = info.player_id.clone();
        let connection = info.connection_id;
        let message = match info.handle.try_send(message) {
            Ok(()) => return Delivery::Settled(Ok(())),
            Err(TrySend::Closed) => {
                tracing::debug!(%player, %connection, "delivery skipped: connection closed");
                return Delivery::Settled(Err(SendError::Closed));
            }
            Err(TrySend::Full(message)) => message,
        };
        let Ok(permit) = Arc::clone(&self.delivery_slots).try_acquire_owned() else {
            tracing::warn!(%player, %connection, "delivery dropped: every slot is waiting on a slow client");
            return Delivery::Settled(Err(SendError::Saturated));
        };

        let handle = info.handle.clone();
        let timeout = self.delivery.send_timeout;
        Delivery::Waiting(tokio::spawn(async move {
            let _permit = permit;
            let result = handle.send(message, timeout).await;
            match &result {
                Ok(()) => {}
                Err(SendError::Closed) => {
                    tracing::debug!(%player, %connection, "delivery skipped: connection closed");
                }
                Err(e) => tracing::warn!(%player, %connection, error = %e, "delivery failed"),
            }
            result
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ports::Identity;
    use futures::future::BoxFuture;
    use tokio::sync::mpsc;
    use zonehost_common::IntentOrigin;

    /// Accepts any non-empty credential as the player id.
    pub(crate) struct NameAuth;

    impl Authenticator for NameAuth {
        fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
            Box::pin(async move {
                if credential.is_empty() {
                    Err(AuthError::Rejected)
                } else {
                    Ok(Identity::new(PlayerId::new(credential)))
                }
            })
        }
    }

    pub(crate) fn registry_with(send_timeout: Duration) -> (ConnectionRegistry, Arc<IntentQueue>) {
        let intents = Arc::new(IntentQueue::new());
        let registry = ConnectionRegistry::new(
            Arc::clone(&intents),
            Arc::new(NameAuth),
            DeliveryConfig {
                send_timeout,
                max_inflight: 64,
            },
        );
        (registry, intents)
    }

    pub(crate) async fn connect(
        registry: &ConnectionRegistry,
        name: &str,
        capacity: usize,
    ) -> (ConnectionInfo, mpsc::Receiver<ServerMessage>) {
        let (handle, rx) = ClientHandle::channel(capacity);
        let info = registry.authenticate(handle, name).await.unwrap();
        registry.register(info.clone());
        (info, rx)
    }

    fn pid(id: &str) -> PartitionId {
        PartitionId::new(id)
    }

    #[tokio::test]
    async fn authenticate_mints_fresh_connection_ids() {
        let (registry, _) = registry_with(Duration::from_millis(50));
        let (h1, _rx1) = ClientHandle::channel(1);
        let (h2, _rx2) = ClientHandle::channel(1);
        let a = registry.authenticate(h1, "a").await.unwrap();
        let b = registry.authenticate(h2, "a").await.unwrap();
        assert_ne!(a.connection_id, b.connection_id);
        assert_eq!(registry.connection_count(), 0);

        let (h3, _rx3) = ClientHandle::channel(1);
        assert!(matches!(
            registry.authenticate(h3, "").await,
            Err(AuthError::Rejected)
        ));
    }

    #[tokio::test]
    async fn reconnect_closes_previous_and_drops_subscription() {
        let (registry, _) = registry_with(Duration::from_millis(50));
        let (first, _rx1) = connect(&registry, "a", 4).await;
        assert!(registry.subscribe(&first.player_id, &pid("old")));

        let (handle, _rx2) = ClientHandle::channel(4);
        let second = registry.authenticate(handle, "a").await.unwrap();
        let superseded = registry.register(second.clone());

        assert_eq!(superseded, Some(first.connection_id));
        assert!(first.handle.is_closed());
        assert!(!second.handle.is_closed());
        assert!(registry.subscribers(&pid("old")).is_empty());
        assert_eq!(registry.subscription_of(&second.player_id), None);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_leaves_departure_in_old_partition() {
        let (registry, intents) = registry_with(Duration::from_millis(50));
        let (first, _rx1) = connect(&registry, "a", 4).await;
        registry.subscribe(&first.player_id, &pid("old"));
        let (second, _rx2) = connect(&registry, "a", 4).await;
        registry.subscribe(&second.player_id, &pid("new"));

        let drained = intents.drain(&pid("old"));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].action(), Some(DISCONNECT_ACTION));
        assert_eq!(drained[0].origin, IntentOrigin::System);
        assert_eq!(intents.pending(&pid("new")), 0);

        // The superseded router's own unregister is stale and adds nothing.
        assert!(!registry.unregister(&first.player_id, Some(first.connection_id)));
        assert_eq!(intents.total_pending(), 0);
    }

    #[tokio::test]
    async fn stale_unregister_is_a_no_op() {
        let (registry, intents) = registry_with(Duration::from_millis(50));
        let (first, _rx1) = connect(&registry, "a", 4).await;
        let (second, _rx2) = connect(&registry, "a", 4).await;
        assert!(registry.subscribe(&second.player_id, &pid("p1")));

        assert!(!registry.unregister(&first.player_id, Some(first.connection_id)));
        let current = registry.connection(&second.player_id).unwrap();
        assert_eq!(current.connection_id, second.connection_id);
        assert_eq!(registry.subscription_count(&pid("p1")), 1);
        assert_eq!(intents.pending(&pid("p1")), 0);
    }

    #[tokio::test]
    async fn unregister_queues_disconnect_intent() {
        let (registry, intents) = registry_with(Duration::from_millis(50));
        let (info, _rx) = connect(&registry, "a", 4).await;
        registry.subscribe(&info.player_id, &pid("p1"));

        assert!(registry.unregister(&info.player_id, Some(info.connection_id)));
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.subscription_count(&pid("p1")), 0);

        let drained = intents.drain(&pid("p1"));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].action(), Some(DISCONNECT_ACTION));
        assert_eq!(drained[0].origin, IntentOrigin::System);
        assert_eq!(drained[0].player_id, info.player_id);
    }

    #[tokio::test]
    async fn unregister_without_subscription_queues_nothing() {
        let (registry, intents) = registry_with(Duration::from_millis(50));
        let (info, _rx) = connect(&registry, "a", 4).await;
        assert!(registry.unregister(&info.player_id, None));
        assert_eq!(intents.total_pending(), 0);
        assert!(!registry.unregister(&info.player_id, None));
    }

    #[tokio::test]
    async fn subscribe_requires_live_connection() {
        let (registry, _) = registry_with(Duration::from_millis(50));
        assert!(!registry.subscribe(&PlayerId::new("ghost"), &pid("p1")));
        assert_eq!(registry.subscription_count(&pid("p1")), 0);
    }

    #[tokio::test]
    async fn subscribe_moves_between_partitions() {
        let (registry, _) = registry_with(Duration::from_millis(50));
        let (info, _rx) = connect(&registry, "a", 4).await;
        registry.subscribe(&info.player_id, &pid("p1"));
        registry.subscribe(&info.player_id, &pid("p2"));
        assert_eq!(registry.subscription_count(&pid("p1")), 0);
        assert_eq!(registry.subscription_count(&pid("p2")), 1);
        assert_eq!(registry.subscription_of(&info.player_id), Some(pid("p2")));
    }

    #[tokio::test]
    async fn switching_partitions_leaves_departure_behind() {
        let (registry, intents) = registry_with(Duration::from_millis(50));
        let (info, _rx) = connect(&registry, "a", 4).await;
        registry.subscribe(&info.player_id, &pid("p1"));
        registry.subscribe(&info.player_id, &pid("p1"));
        assert_eq!(intents.total_pending(), 0);

        registry.subscribe(&info.player_id, &pid("p2"));
        let drained = intents.drain(&pid("p1"));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].action(), Some(DISCONNECT_ACTION));
        assert_eq!(intents.pending(&pid("p2")), 0);
    }

    #[tokio::test]
    async fn broadcast_survives_a_stalled_subscriber() {
        let (registry, _) = registry_with(Duration::from_millis(40));
        let (a, mut rx_a) = connect(&registry, "a", 4).await;
        let (stalled, _rx_stalled) = connect(&registry, "b", 1).await;
        let (c, mut rx_c) = connect(&registry, "c", 4).await;
        for info in [&a, &stalled, &c] {
            registry.subscribe(&info.player_id, &pid("p1"));
        }
        // Fill the stalled connection's queue so its next send blocks.
        stalled
            .handle
            .send(ServerMessage::IntentReceived, Duration::from_millis(10))
            .await
            .unwrap();

        let message = ServerMessage::Tick {
            tick_number: 1,
            state: json!({}),
        };
        let deliveries = registry.broadcast_to(&pid("p1"), message.clone(), None);
        assert_eq!(deliveries.len(), 3);
        let outcomes = deliveries.settled().await;

        for (player, outcome) in &outcomes {
            if player == &stalled.player_id {
                assert!(matches!(outcome, Err(SendError::TimedOut(_))));
            } else {
                assert!(outcome.is_ok());
            }
        }
        assert_eq!(rx_a.recv().await, Some(message.clone()));
        assert_eq!(rx_c.recv().await, Some(message));
        // Timeouts never disconnect.
        assert!(!stalled.handle.is_closed());
        assert_eq!(registry.connection_count(), 3);
    }

    #[tokio::test]
    async fn slow_clients_cannot_hold_back_healthy_ones() {
        let intents = Arc::new(IntentQueue::new());
        let registry = ConnectionRegistry::new(
            intents,
            Arc::new(NameAuth),
            DeliveryConfig {
                send_timeout: Duration::from_millis(200),
                max_inflight: 1,
            },
        );
        let (slow_a, _rx_a) = connect(&registry, "a", 1).await;
        let (slow_b, _rx_b) = connect(&registry, "b", 1).await;
        let (healthy, mut rx_healthy) = connect(&registry, "c", 4).await;
        for info in [&slow_a, &slow_b, &healthy] {
            registry.subscribe(&info.player_id, &pid("p1"));
            if info.player_id != healthy.player_id {
                info.handle.try_send(ServerMessage::IntentReceived).unwrap();
            }
        }

        let message = ServerMessage::Tick {
            tick_number: 1,
            state: json!({}),
        };
        let deliveries = registry.broadcast_to(&pid("p1"), message.clone(), None);
        // The healthy client's copy is queued before broadcast_to returns.
        assert_eq!(rx_healthy.try_recv().ok(), Some(message));
        assert_eq!(deliveries.len(), 3);
        assert_eq!(deliveries.waiting(), 1);

        let outcomes: HashMap<PlayerId, Result<(), SendError>> =
            deliveries.settled().await.into_iter().collect();
        assert_eq!(outcomes[&healthy.player_id], Ok(()));
        assert_eq!(
            outcomes[&slow_a.player_id],
            Err(SendError::TimedOut(Duration::from_millis(200)))
        );
        assert_eq!(outcomes[&slow_b.player_id], Err(SendError::Saturated));

        // The slot is free again once the waiting job has timed out.
        let (fresh, _rx_fresh) = connect(&registry, "d", 1).await;
        fresh.handle.try_send(ServerMessage::IntentReceived).unwrap();
        let retry = registry.send_to(&fresh, ServerMessage::IntentReceived);
        assert_eq!(retry.waiting(), 1);
    }

    #[tokio::test]
    async fn broadcast_honors_exclude() {
        let (registry, _) = registry_with(Duration::from_millis(40));
        let (a, _rx_a) = connect(&registry, "a", 4).await;
        let (b, mut rx_b) = connect(&registry, "b", 4).await;
        registry.subscribe(&a.player_id, &pid("p1"));
        registry.subscribe(&b.player_id, &pid("p1"));

        let outcomes = registry
            .broadcast_to(&pid("p1"), ServerMessage::IntentReceived, Some(&a.player_id))
            .settled()
            .await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, b.player_id);
        assert_eq!(rx_b.recv().await, Some(ServerMessage::IntentReceived));
    }

    #[tokio::test]
    async fn subscribers_is_a_snapshot() {
        let (registry, _) = registry_with(Duration::from_millis(40));
        let (a, _rx_a) = connect(&registry, "a", 4).await;
        registry.subscribe(&a.player_id, &pid("p1"));
        let snapshot = registry.subscribers(&pid("p1"));
        registry.unregister(&a.player_id, None);
        assert_eq!(snapshot.len(), 1);
        assert!(registry.subscribers(&pid("p1")).is_empty());
    }
}
