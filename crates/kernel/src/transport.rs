use crate::protocol::ServerMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why an outbound message did not reach the connection's writer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    #[error("too many deliveries already waiting on slow clients")]
    Saturated,
}

/// Outbound side of one client connection.
///
/// Messages go into a bounded queue drained by the transport's writer task. A
/// writer that stops draining makes sends wait, and the per-send timeout turns
/// that wait into a [`SendError::TimedOut`]. Closing only signals the
/// transport; it does not wait for the socket to go away.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

/// Outcome of [`ClientHandle::try_send`] when the message was not queued.
#[derive(Debug)]
pub enum TrySend {
    Full(ServerMessage),
    Closed,
}

impl ClientHandle {
    /// Create a handle and the receiver the transport writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    pub async fn send(&self, message: ServerMessage, timeout: Duration) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        match tokio::time::timeout(timeout, self.tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::TimedOut(timeout)),
        }
    }

    /// Queue a message without waiting.
    ///
    /// A full queue hands the message back so the caller can decide whether to
    /// wait for room.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), TrySend> {
        if self.closed.is_cancelled() {
            return Err(TrySend::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(message) => TrySend::Full(message),
            mpsc::error::TrySendError::Closed(_) => TrySend::Closed,
        })
    }

    /// Ask the transport to close this connection. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}
