//! WebSocket transport.
//!
//! Plain TCP listener upgraded with tokio-tungstenite. Each connection gets
//! two halves:
//!
//! - a writer task draining the connection's bounded outbound queue into the
//!   socket as JSON text frames
//! - a reader loop (the connection task itself) decoding text frames into
//!   [`Signal`]s and dispatching them to the [`Hub`] one at a time
//!
//! The registry holds the only sender of the outbound queue. Once the
//! connection is unregistered the queue closes, the writer flushes what is
//! left and closes the socket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use roomcast_core::Environment;
use roomcast_proto::{Outbound, ProtocolError, Signal};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;

use crate::{error::ServerError, hub::Hub, storage::MessageStore};

/// How long the writer may keep flushing after the reader stopped.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// TCP listener accepting WebSocket upgrades.
pub struct WsTransport {
    listener: TcpListener,
}

impl WsTransport {
    /// Bind to `address` (e.g. "0.0.0.0:8080").
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("WebSocket transport bound to {}", addr);
        Ok(Self { listener })
    }

    /// Accept the next TCP connection. The WebSocket handshake happens in
    /// [`serve_connection`].
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        self.listener
            .accept()
            .await
            .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// Run one connection from handshake to cleanup.
///
/// Returns once the client closes, the socket fails, the connection is
/// reaped as unreachable, or `shutdown` is cancelled. The connection is
/// always unregistered before returning.
pub async fn serve_connection<E: Environment, S: MessageStore>(
    hub: Arc<Hub<E, S>>,
    stream: TcpStream,
    peer: SocketAddr,
    outbound_buffer: usize,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Outbound>(outbound_buffer);
    let id = match hub.connect(tx) {
        Ok(id) => id,
        Err(e) => {
            let frame = CloseFrame { code: CloseCode::Again, reason: "server full".into() };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return Err(e);
        },
    };
    tracing::info!(connection = %id, %peer, "client connected");

    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "event encode failed");
                    continue;
                },
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!(connection = %id, error = %e, "socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = source.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match Signal::decode(&text) {
                Ok(signal) => hub.dispatch(id, signal).await,
                Err(e) => hub.reject_frame(id, &e),
            },
            Some(Ok(Message::Binary(_))) => hub.reject_frame(
                id,
                &ProtocolError::Malformed("binary frames are not supported".to_string()),
            ),
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong are answered by tungstenite
            Some(Ok(_)) => {},
            Some(Err(e)) => {
                tracing::debug!(connection = %id, error = %e, "socket read failed");
                break;
            },
        }

        if !hub.registry().is_registered(id) {
            tracing::debug!(connection = %id, "connection reaped while reading");
            break;
        }
    }

    hub.disconnect(id);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(connection = %id, %peer, "client disconnected");
    Ok(())
}
