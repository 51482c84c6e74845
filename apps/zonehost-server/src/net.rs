//! TCP transport: newline-delimited JSON.
//!
//! The first line from a client must be
//! `{"type":"authenticate","token":"..."}`; the server answers with
//! `{"type":"authenticated","player_id":"..."}` or an error and closes. Every
//! later line is handed to the kernel's message router. A line that is too
//! long or not UTF-8 is skipped and answered with an error; the connection
//! stays open.

use crate::bootstrap::Core;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use zonehost_common::PlayerId;
use zonehost_kernel::{ClientHandle, InboundFrame, MessageRouter, ServerMessage};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Handshake {
    Authenticate { token: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HandshakeReply {
    Authenticated { player_id: PlayerId },
    Error { message: String },
}

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub client_queue: usize,
    pub max_frame_bytes: usize,
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
}

/// Accept connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    core: Core,
    transport: TransportConfig,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(bind = %listener.local_addr()?, "listening");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let core = core.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, core, transport).await;
                });
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
    tracing::info!("listener closed");
    Ok(())
}

/// Newline-delimited text frames that survive unreadable lines.
struct FrameCodec {
    lines: LinesCodec,
    max_frame_bytes: usize,
}

impl FrameCodec {
    fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
        }
    }

    /// Turn per-line failures into rejected frames; `LinesCodec` has already
    /// skipped past the bad line (or is discarding the rest of it).
    fn recover(
        &self,
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<InboundFrame>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(InboundFrame::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(InboundFrame::Rejected(format!(
                "frame exceeds {} bytes",
                self.max_frame_bytes
            )))),
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(InboundFrame::Rejected("frame is not valid UTF-8".into())))
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<InboundFrame>, LinesCodecError> {
        let decoded = self.lines.decode(src);
        self.recover(decoded)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<InboundFrame>, LinesCodecError> {
        let decoded = self.lines.decode_eof(src);
        self.recover(decoded)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), LinesCodecError> {
        self.lines.encode(line, dst)
    }
}

type Lines = Framed<TcpStream, FrameCodec>;

async fn reply(lines: &mut Lines, message: &HandshakeReply) {
    match serde_json::to_string(message) {
        Ok(text) => {
            if let Err(e) = lines.send(text).await {
                tracing::debug!(error = %e, "handshake reply not delivered");
            }
        }
        Err(e) => tracing::warn!(error = %e, "cannot encode handshake reply"),
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, core: Core, transport: TransportConfig) {
    let mut lines = Framed::new(stream, FrameCodec::new(transport.max_frame_bytes));

    let token = match tokio::time::timeout(transport.handshake_timeout, lines.next()).await {
        Ok(Some(Ok(InboundFrame::Text(line)))) => match serde_json::from_str::<Handshake>(&line) {
            Ok(Handshake::Authenticate { token }) => token,
            Err(e) => {
                let message = format!("expected authenticate message: {e}");
                reply(&mut lines, &HandshakeReply::Error { message }).await;
                return;
            }
        },
        Ok(Some(Ok(InboundFrame::Rejected(message)))) => {
            reply(&mut lines, &HandshakeReply::Error { message }).await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::debug!(%peer, error = %e, "handshake read failed");
            return;
        }
        Ok(None) => return,
        Err(_) => {
            tracing::debug!(%peer, "handshake timed out");
            let message = "authentication timed out".to_string();
            reply(&mut lines, &HandshakeReply::Error { message }).await;
            return;
        }
    };

    let (handle, outbound) = ClientHandle::channel(transport.client_queue);
    let info = match core.registry.authenticate(handle, &token).await {
        Ok(info) => info,
        Err(e) => {
            tracing::info!(%peer, error = %e, "authentication failed");
            reply(&mut lines, &HandshakeReply::Error { message: e.to_string() }).await;
            return;
        }
    };
    let player_id = info.player_id.clone();
    reply(&mut lines, &HandshakeReply::Authenticated { player_id: player_id.clone() }).await;
    if let Some(previous) = core.registry.register(info.clone()) {
        tracing::info!(player = %player_id, %previous, "reconnect superseded previous connection");
    }
    tracing::info!(%peer, player = %player_id, connection = %info.connection_id, "client connected");

    let (sink, inbound) = lines.split();
    let writer = tokio::spawn(write_loop(sink, outbound, info.handle.clone()));

    let router = MessageRouter::new(
        info.clone(),
        Arc::clone(&core.registry),
        Arc::clone(&core.intents),
        Arc::clone(&core.store),
        transport.reply_timeout,
    );
    let exit = router.run(inbound).await;

    info.handle.close();
    if let Err(e) = writer.await {
        tracing::warn!(player = %player_id, error = %e, "writer task failed");
    }
    tracing::info!(%peer, player = %player_id, ?exit, "client disconnected");
}

/// Drain the connection's outbound queue onto the socket until it closes.
async fn write_loop(
    mut sink: futures::stream::SplitSink<Lines, String>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    handle: ClientHandle,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = handle.closed() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode outbound message");
                continue;
            }
        };
        if let Err(e) = sink.send(text).await {
            tracing::debug!(error = %e, "socket write failed");
            handle.close();
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "socket close failed");
    }
}
