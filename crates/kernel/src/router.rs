use crate::intents::IntentQueue;
use crate::ports::DataAccess;
use crate::protocol::{self, ClientMessage, InboundFrame, ServerMessage};
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use zonehost_common::PartitionId;

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterExit {
    /// The inbound stream ended.
    Disconnected,
    /// The transport failed to produce a frame.
    TransportError,
    /// The connection was closed from our side, e.g. by a reconnect.
    Closed,
}

/// Receive loop for one live connection.
pub struct MessageRouter {
    info: ConnectionInfo,
    registry: Arc<ConnectionRegistry>,
    intents: Arc<IntentQueue>,
    store: Arc<dyn DataAccess>,
    reply_timeout: Duration,
}

impl MessageRouter {
    pub fn new(
        info: ConnectionInfo,
        registry: Arc<ConnectionRegistry>,
        intents: Arc<IntentQueue>,
        store: Arc<dyn DataAccess>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            info,
            registry,
            intents,
            store,
            reply_timeout,
        }
    }

    /// Decode and dispatch frames until the connection goes away.
    ///
    /// Always unregisters with this connection's own id on the way out, so a
    /// loop outliving a reconnect cannot tear down the newer connection.
    pub async fn run<S, F, E>(self, mut inbound: S) -> RouterExit
    where
        S: Stream<Item = Result<F, E>> + Unpin,
        F: Into<InboundFrame>,
        E: Display,
    {
        let player = self.info.player_id.clone();
        let connection = self.info.connection_id;

        let exit = loop {
            let frame = tokio::select! {
                _ = self.info.handle.closed() => break RouterExit::Closed,
                frame = inbound.next() => frame,
            };
            match frame {
                None => break RouterExit::Disconnected,
                Some(Err(e)) => {
                    tracing::warn!(%player, %connection, error = %e, "transport error; ending receive loop");
                    break RouterExit::TransportError;
                }
                Some(Ok(frame)) => {
                    let frame: InboundFrame = frame.into();
                    let reply = match frame {
                        InboundFrame::Text(text) if text.trim().is_empty() => continue,
                        InboundFrame::Text(text) => self.handle_frame(&text).await,
                        InboundFrame::Rejected(reason) => {
                            tracing::debug!(%player, %connection, %reason, "transport rejected a frame");
                            ServerMessage::error(reason)
                        }
                    };
                    if let Err(e) = self.info.handle.send(reply, self.reply_timeout).await {
                        tracing::debug!(%player, %connection, error = %e, "reply not delivered");
                    }
                }
            }
        };

        self.registry.unregister(&player, Some(connection));
        tracing::debug!(%player, %connection, ?exit, "receive loop finished");
        exit
    }

    /// Decode one frame and produce the reply for it.
    pub async fn handle_frame(&self, frame: &str) -> ServerMessage {
        match protocol::decode(frame) {
            Ok(ClientMessage::Subscribe { partition_id }) => self.subscribe(partition_id).await,
            Ok(ClientMessage::Intent { data }) => self.submit_intent(data),
            Err(e) => {
                tracing::debug!(player = %self.info.player_id, error = %e, "rejected client message");
                ServerMessage::error(e.to_string())
            }
        }
    }

    async fn subscribe(&self, partition: PartitionId) -> ServerMessage {
        match self.store.partition_exists(&partition).await {
            Ok(true) => {}
            Ok(false) => return ServerMessage::error(format!("unknown partition: {partition}")),
            Err(e) => {
                tracing::warn!(%partition, error = %e, "partition lookup failed");
                return ServerMessage::error("partition lookup failed");
            }
        }
        if !self.is_current() || !self.registry.subscribe(&self.info.player_id, &partition) {
            return ServerMessage::error("connection is no longer active");
        }
        ServerMessage::Subscribed {
            partition_id: partition,
        }
    }

    fn submit_intent(&self, data: Value) -> ServerMessage {
        if !self.is_current() {
            return ServerMessage::error("connection is no longer active");
        }
        match self.registry.subscription_of(&self.info.player_id) {
            Some(partition) => {
                self.intents
                    .enqueue(partition, self.info.player_id.clone(), data);
                ServerMessage::IntentReceived
            }
            None => ServerMessage::error("subscribe to a partition before sending intents"),
        }
    }

    fn is_current(&self) -> bool {
        self.registry
            .is_current(&self.info.player_id, self.info.connection_id)
    }
}
