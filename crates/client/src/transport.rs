//! Connection tasks.
//!
//! Each `open` on the session manager spawns one connection task through a
//! [`Connector`]. The task owns the socket; the manager talks to it only
//! through a [`ConnectionLink`]:
//!
//! ```text
//!   manager ── outbound (RelayMessage) ──►  task ──► socket
//!   manager ◄── events (TaggedEvent) ─────  task ◄── socket
//!   manager ── cancel (CancellationToken) ► task
//! ```
//!
//! Every event carries the generation of the `open` that created the task,
//! so the manager can discard events from superseded connections.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{FrameCodec, RelayMessage, TerminalEndpoint};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::ClientError;
use crate::state::Generation;

/// Default timeout for the WebSocket upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the close handshake on local teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What a connection task reports.
#[derive(Debug)]
pub enum LinkEvent {
    /// The transport is up; frames may be sent.
    Opened,
    /// A decoded frame from the host.
    Frame(RelayMessage),
    /// A frame that failed to decode. Dropped by the manager.
    Malformed(String),
    /// The connection ended. `clean` when the host sent a close frame.
    Closed { clean: bool, reason: String },
    /// The connection could not be established.
    Failed(ClientError),
}

/// A [`LinkEvent`] tagged with the generation that produced it.
#[derive(Debug)]
pub struct TaggedEvent {
    pub generation: Generation,
    pub event: LinkEvent,
}

impl TaggedEvent {
    pub fn new(generation: Generation, event: LinkEvent) -> Self {
        Self { generation, event }
    }
}

/// Task side of one connection.
#[derive(Debug)]
pub struct ConnectionLink {
    pub generation: Generation,
    pub events: mpsc::Sender<TaggedEvent>,
    pub outbound: mpsc::UnboundedReceiver<RelayMessage>,
    pub cancel: CancellationToken,
}

impl ConnectionLink {
    /// Deliver an event to the manager. Returns false once the manager is
    /// gone or the connection was cancelled.
    pub async fn emit(&self, event: LinkEvent) -> bool {
        let tagged = TaggedEvent::new(self.generation, event);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(tagged) => sent.is_ok(),
        }
    }
}

/// Starts connection tasks.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: TerminalEndpoint, link: ConnectionLink) -> JoinHandle<()>;
}

/// Connects to a relay over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base: Url,
    codec: FrameCodec,
    connect_timeout: Duration,
}

impl WsConnector {
    /// `base` is the relay address, e.g. `ws://127.0.0.1:23456`.
    pub fn new(base: Url) -> Self {
        Self {
            base,
            codec: FrameCodec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }
}

impl Connector for WsConnector {
    fn connect(&self, endpoint: TerminalEndpoint, link: ConnectionLink) -> JoinHandle<()> {
        let base = self.base.clone();
        let codec = self.codec;
        let timeout = self.connect_timeout;
        tokio::spawn(run_connection(base, endpoint, codec, timeout, link))
    }
}

async fn run_connection(
    base: Url,
    endpoint: TerminalEndpoint,
    codec: FrameCodec,
    connect_timeout: Duration,
    mut link: ConnectionLink,
) {
    let generation = link.generation;
    let url = match endpoint.url(&base) {
        Ok(url) => url,
        Err(e) => {
            link.emit(LinkEvent::Failed(e.into())).await;
            return;
        }
    };

    tracing::debug!(%generation, %url, "connecting");
    let connect = tokio::time::timeout(connect_timeout, connect_async(url.as_str()));
    let ws = tokio::select! {
        _ = link.cancel.cancelled() => {
            tracing::debug!(%generation, "connect cancelled");
            return;
        }
        result = connect => match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                let err = ClientError::from_connect(&endpoint.key, e);
                tracing::debug!(%generation, error = %err, "connect failed");
                link.emit(LinkEvent::Failed(err)).await;
                return;
            }
            Err(_) => {
                link.emit(LinkEvent::Failed(ClientError::ConnectTimeout(connect_timeout)))
                    .await;
                return;
            }
        },
    };

    if !link.emit(LinkEvent::Opened).await {
        return;
    }

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                tracing::debug!(%generation, "connection closed locally");
                break;
            }

            outbound = link.outbound.recv() => {
                let Some(message) = outbound else {
                    // Manager dropped its sender.
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                    break;
                };
                let text = match codec.encode(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(%generation, kind = message.kind(), error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    link.emit(LinkEvent::Closed { clean: false, reason: e.to_string() }).await;
                    break;
                }
            }

            incoming = stream.next() => {
                let decoded = match incoming {
                    Some(Ok(Message::Text(text))) => codec.decode(&text),
                    Some(Ok(Message::Binary(data))) => codec.decode_bytes(&data),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by host".to_string());
                        link.emit(LinkEvent::Closed { clean: true, reason }).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        link.emit(LinkEvent::Closed { clean: false, reason: e.to_string() }).await;
                        break;
                    }
                    None => {
                        link.emit(LinkEvent::Closed {
                            clean: false,
                            reason: "connection dropped".to_string(),
                        })
                        .await;
                        break;
                    }
                };

                let event = match decoded {
                    Ok(frame) => LinkEvent::Frame(frame),
                    Err(e) => LinkEvent::Malformed(e.to_string()),
                };
                if !link.emit(event).await {
                    break;
                }
            }
        }
    }
}
