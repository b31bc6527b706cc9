//! [`BrokerServer`] – WebSocket endpoint hosting a [`Broker`].
//!
//! Nodes connect to `ws://host:port/nodes`.  Every connection must open with
//! NODE_ANNOUNCE; the server answers with a NODE_ANNOUNCE of its own, which
//! completes the handshake, and from then on feeds every inbound frame to
//! [`Broker::dispatch`].  Outbound frames go through a per-connection writer
//! task so a slow node never holds up routing for the others.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use nodebus_types::{BROKER_NODE_NAME, BusError, MessageType, NODES_PATH, TransportMessage};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerConfig, ConnectionHandle, Outgoing};

/// Default TCP port of the broker endpoint.
pub const DEFAULT_PORT: u16 = 3000;

/// Close code sent when a connection does not open with NODE_ANNOUNCE.
pub const CLOSE_HANDSHAKE_REQUIRED: u16 = 4000;

// ---------------------------------------------------------------------------
// BrokerServer
// ---------------------------------------------------------------------------

/// Bound broker endpoint.
///
/// # Example
///
/// ```rust,no_run
/// use nodebus_broker::{BrokerConfig, BrokerServer};
///
/// #[tokio::main]
/// async fn main() -> Result<(), nodebus_types::BusError> {
///     let server = BrokerServer::bind("0.0.0.0:3000", BrokerConfig::default()).await?;
///     server.run().await
/// }
/// ```
pub struct BrokerServer {
    broker: Arc<Broker>,
    listener: TcpListener,
}

impl BrokerServer {
    /// Bind the endpoint.  Use port `0` to let the OS pick one and read it
    /// back with [`BrokerServer::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Transport`] if the listener cannot bind.
    pub async fn bind(addr: impl ToSocketAddrs, config: BrokerConfig) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::Transport(format!("bind error: {e}")))?;
        Ok(Self {
            broker: Arc::new(Broker::new(config)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        self.listener
            .local_addr()
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    /// Shared handle to the broker state, for introspection and
    /// administrative operations.
    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self) -> Result<(), BusError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, path = NODES_PATH, "broker listening");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let broker = Arc::clone(&self.broker);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, broker).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == NODES_PATH {
        Ok(response)
    } else {
        let mut rejection = ErrorResponse::new(Some(format!("unknown endpoint {}", request.uri().path())));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }
}

fn decode(frame: Message) -> Option<Result<TransportMessage, BusError>> {
    match frame {
        Message::Binary(bytes) => Some(TransportMessage::decode(&bytes)),
        Message::Text(text) => Some(TransportMessage::from_json(text.as_str())),
        _ => None,
    }
}

fn encode(frame: Outgoing) -> Result<Message, BusError> {
    match frame {
        Outgoing::Message(message) => Ok(Message::Binary(message.encode()?.into())),
        Outgoing::Close { code, reason } => Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        }))),
    }
}

/// Wait for the NODE_ANNOUNCE that must open every connection.
async fn await_announce(
    ws: &mut WebSocketStream<TcpStream>,
    broker: &Broker,
) -> Result<TransportMessage, BusError> {
    let first = tokio::time::timeout(broker.config().handshake_timeout, async {
        loop {
            match ws.next().await {
                Some(Ok(frame)) => {
                    if let Some(decoded) = decode(frame) {
                        return decoded.ok();
                    }
                }
                _ => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    match first {
        Some(message) if message.msg_type == MessageType::NodeAnnounce => Ok(message),
        _ => {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(CLOSE_HANDSHAKE_REQUIRED),
                    reason: "First message must be NODE_ANNOUNCE".into(),
                }))
                .await;
            Err(BusError::Transport("connection did not open with NODE_ANNOUNCE".to_string()))
        }
    }
}

#[tracing::instrument(skip(stream, broker))]
async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) -> Result<(), BusError> {
    let mut ws = accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| BusError::Transport(e.to_string()))?;

    let announce = await_announce(&mut ws, &broker).await?;
    let node = announce.node_name;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = ConnectionHandle::new(tx);
    // Queue the acknowledgement before the node becomes routable so it is
    // always the first frame the node sees.
    conn.send(Outgoing::Message(TransportMessage::new(
        MessageType::NodeAnnounce,
        BROKER_NODE_NAME,
        broker.id(),
        node.clone(),
    )));
    broker.register_node(&node, conn.clone());

    let (mut sink, mut stream) = ws.split();

    let writer_node = node.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, Outgoing::Close { .. });
            let message = match encode(frame) {
                Ok(message) => message,
                Err(e) => {
                    error!(node = %writer_node, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(message).await {
                warn!(node = %writer_node, error = %e, "send failed, closing writer");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(node = %node, error = %e, "socket error");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        match decode(frame) {
            Some(Ok(message)) => {
                if !broker.dispatch_on(&node, conn.id(), message) {
                    debug!(node = %node, "connection was replaced, stopping reader");
                    break;
                }
            }
            Some(Err(e)) => warn!(node = %node, error = %e, "dropping malformed frame"),
            None => {}
        }
    }

    broker.release_connection(&node, conn.id());
    drop(conn);
    writer.abort();
    info!(node = %node, "connection closed");
    Ok(())
}
