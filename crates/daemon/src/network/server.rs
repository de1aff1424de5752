//! WebSocket relay listener.
//!
//! Each connection upgrades on
//! `/api/v1/instances/{target}/component/{component}/terminal?lines=N`,
//! attaches one viewer to the session registry and then pumps frames in
//! both directions until either side goes away:
//!
//! ```text
//!   viewer queue ──► writer task ──► ws sink
//!   ws stream ──► reader loop ──► input / resize ──► session host
//! ```
//!
//! Upgrade requests for unknown sessions are refused with HTTP 404 and
//! malformed paths with HTTP 400, before any frame is exchanged.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{
    FrameCodec, ProtocolError, RelayMessage, TerminalEndpoint, DEFAULT_HISTORY_DEPTH,
    MAX_FRAME_SIZE,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::process::ProcessManager;
use crate::session::{
    InputDisposition, ResizeDisposition, SessionError, SessionRegistry, ViewerHandle,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Frames a connection may queue for itself (protocol error notices).
const NOTICE_QUEUE_CAPACITY: usize = 16;

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub max_frame_size: usize,
    /// Consecutive undecodable or misdirected frames before the connection
    /// is closed. Zero disables the limit.
    pub max_protocol_errors: u32,
    /// Depth used when the upgrade request has no `lines` query.
    pub default_history_depth: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_protocol_errors: 16,
            default_history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    BadRequest(String),
    NotFound(String),
}

impl Rejection {
    fn status(&self) -> StatusCode {
        match self {
            Rejection::BadRequest(_) => StatusCode::BAD_REQUEST,
            Rejection::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let status = self.status();
        let reason = match self {
            Rejection::BadRequest(reason) | Rejection::NotFound(reason) => reason,
        };
        let mut response = ErrorResponse::new(Some(reason));
        *response.status_mut() = status;
        response
    }
}

/// Map an upgrade request target to an endpoint the process manager knows.
pub(crate) fn resolve_endpoint(
    path_and_query: &str,
    default_history_depth: usize,
    processes: &dyn ProcessManager,
) -> std::result::Result<TerminalEndpoint, Rejection> {
    let mut endpoint = match TerminalEndpoint::parse(path_and_query) {
        Ok(endpoint) => endpoint,
        Err(ProtocolError::UnknownComponent(name)) => {
            return Err(Rejection::NotFound(format!("unknown component: {name}")))
        }
        Err(e) => return Err(Rejection::BadRequest(e.to_string())),
    };

    let has_lines = path_and_query
        .split_once('?')
        .map(|(_, query)| query.split('&').any(|pair| pair.starts_with("lines=")))
        .unwrap_or(false);
    if !has_lines {
        endpoint.history_depth = default_history_depth;
    }

    if !processes.knows(&endpoint.key) {
        return Err(Rejection::NotFound(format!(
            "no such session: {}",
            endpoint.key
        )));
    }
    Ok(endpoint)
}

/// Accepts WebSocket viewers and binds them to session hosts.
pub struct RelayServer {
    registry: Arc<SessionRegistry>,
    codec: FrameCodec,
    settings: ServerSettings,
    connections: AtomicUsize,
}

impl RelayServer {
    pub fn new(registry: Arc<SessionRegistry>, settings: ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            registry,
            codec: FrameCodec::with_max_frame_size(settings.max_frame_size),
            settings,
            connections: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open WebSocket connections.
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Bind a listener on `addr`.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay listener on {addr}"))
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("Relay listener has no local address")?;
        tracing::info!(addr = %local, "Relay listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            server.connections.fetch_add(1, Ordering::SeqCst);
                            if let Err(e) = Arc::clone(&server).handle_connection(stream, peer, token).await {
                                tracing::debug!(peer = %peer, "Connection ended with error: {:#}", e);
                            }
                            server.connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => tracing::warn!("Relay accept failed: {}", e),
                },
            }
        }

        tracing::info!(addr = %local, "Relay listener stopped");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);

        let mut endpoint = None;
        let processes = Arc::clone(self.registry.processes());
        let default_depth = self.settings.default_history_depth;
        let callback = |request: &Request, response: Response| {
            let uri = request.uri();
            let target = uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or_else(|| uri.path());
            match resolve_endpoint(target, default_depth, processes.as_ref()) {
                Ok(resolved) => {
                    endpoint = Some(resolved);
                    Ok(response)
                }
                Err(rejection) => {
                    tracing::info!(peer = %peer, path = %target, "Upgrade refused: {:?}", rejection);
                    Err(rejection.into_response())
                }
            }
        };

        let ws = accept_hdr_async(stream, callback)
            .await
            .context("WebSocket handshake failed")?;
        let Some(endpoint) = endpoint else {
            return Ok(());
        };
        let (mut sink, stream) = ws.split();

        let attachment = match self.registry.attach(&endpoint.key, endpoint.history_depth) {
            Ok(attachment) => attachment,
            Err(SessionError::ProcessNotRunning(key)) => {
                tracing::info!(peer = %peer, session = %key, "Viewer connected to idle session");
                let frames = [
                    RelayMessage::connected(
                        format!("{} ({}) is not running", key.component.display_name(), key),
                        None,
                    ),
                    RelayMessage::error(SessionError::ProcessNotRunning(key).to_string()),
                ];
                for frame in frames {
                    self.send_frame(&mut sink, &frame).await?;
                }
                self.idle_until_closed(stream, shutdown).await;
                let _ = sink.close().await;
                return Ok(());
            }
            Err(e) => {
                self.send_frame(&mut sink, &RelayMessage::error(e.to_string())).await?;
                let _ = sink.close().await;
                return Err(e.into());
            }
        };

        let viewer = attachment.viewer;
        let _detach = DetachOnDrop {
            registry: Arc::clone(&self.registry),
            viewer: viewer.clone(),
        };
        tracing::debug!(peer = %peer, session = %endpoint.key, viewer_id = viewer.id(), "Viewer streaming");

        let connection = shutdown.child_token();
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_frames(
            sink,
            self.codec,
            attachment.frames,
            notice_rx,
            connection.clone(),
        ));

        self.read_frames(stream, &viewer, &notice_tx, &connection).await;
        drop(notice_tx);
        drop(_detach);
        let _ = writer.await;

        tracing::debug!(peer = %peer, viewer_id = viewer.id(), "Viewer connection closed");
        Ok(())
    }

    async fn send_frame(&self, sink: &mut WsSink, message: &RelayMessage) -> Result<()> {
        let text = self.codec.encode(message)?;
        sink.send(WsMessage::Text(text))
            .await
            .context("Failed to send frame")
    }

    /// Hold a connection that has no session to stream until the peer
    /// closes it.
    async fn idle_until_closed(&self, mut stream: WsStream, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn read_frames(
        &self,
        mut stream: WsStream,
        viewer: &ViewerHandle,
        notices: &mpsc::Sender<RelayMessage>,
        connection: &CancellationToken,
    ) {
        let mut consecutive_errors = 0u32;

        loop {
            let next = tokio::select! {
                _ = connection.cancelled() => break,
                next = stream.next() => next,
            };

            let decoded = match next {
                Some(Ok(WsMessage::Text(text))) => self.codec.decode(&text),
                Some(Ok(WsMessage::Binary(data))) => self.codec.decode_bytes(&data),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(viewer_id = viewer.id(), "WebSocket read failed: {}", e);
                    break;
                }
            };

            let problem = match decoded {
                Ok(RelayMessage::Input { data }) => {
                    match viewer.send_input(&data).await {
                        Ok(InputDisposition::Forwarded) => {}
                        Ok(disposition) => {
                            tracing::trace!(viewer_id = viewer.id(), ?disposition, "Input not forwarded");
                        }
                        Err(e) => {
                            let _ = notices.try_send(RelayMessage::error(e.to_string()));
                        }
                    }
                    None
                }
                Ok(message @ RelayMessage::Resize { .. }) => {
                    if let Some(size) = message.as_size() {
                        match viewer.resize(size).await {
                            Ok(ResizeDisposition::Applied) => {}
                            Ok(disposition) => {
                                tracing::trace!(viewer_id = viewer.id(), ?disposition, "Resize not applied");
                            }
                            Err(e) => {
                                tracing::warn!(viewer_id = viewer.id(), "Resize failed: {}", e);
                            }
                        }
                    }
                    None
                }
                Ok(other) => Some(format!("unexpected {} frame from viewer", other.kind())),
                Err(e) => Some(e.to_string()),
            };

            match problem {
                None => consecutive_errors = 0,
                Some(problem) => {
                    consecutive_errors += 1;
                    tracing::debug!(viewer_id = viewer.id(), consecutive_errors, "Protocol error: {}", problem);
                    let limit = self.settings.max_protocol_errors;
                    if limit > 0 && consecutive_errors >= limit {
                        let _ = notices
                            .send(RelayMessage::error("too many protocol errors; closing"))
                            .await;
                        tracing::warn!(viewer_id = viewer.id(), "Closing connection after {} protocol errors", consecutive_errors);
                        break;
                    }
                    let _ = notices.try_send(RelayMessage::error(problem));
                }
            }
        }
    }
}

/// Drain the viewer queue and connection notices into the socket.
async fn write_frames(
    mut sink: WsSink,
    codec: FrameCodec,
    mut frames: mpsc::Receiver<RelayMessage>,
    mut notices: mpsc::Receiver<RelayMessage>,
    connection: CancellationToken,
) {
    'frames: loop {
        let message = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break 'frames,
            },
            Some(notice) = notices.recv() => notice,
        };

        for text in encode_split(&codec, message) {
            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                tracing::debug!("WebSocket write failed: {}", e);
                break 'frames;
            }
        }
    }

    // Flush notices queued by the reader before it stopped.
    while let Ok(notice) = notices.try_recv() {
        if let Ok(text) = codec.encode(&notice) {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    }

    let _ = sink.close().await;
    connection.cancel();
}

/// Encode `message`, re-splitting `output` and `history` frames that exceed
/// the connection's limit. Other oversized frames are dropped with a warning.
fn encode_split(codec: &FrameCodec, message: RelayMessage) -> Vec<String> {
    let e = match codec.encode(&message) {
        Ok(text) => return vec![text],
        Err(e) => e,
    };
    let pieces = match message {
        RelayMessage::Output { data } => codec.output_frames(&data),
        RelayMessage::History { lines } => codec.history_frames(lines),
        other => {
            tracing::warn!("Dropping {} frame: {}", other.kind(), e);
            return Vec::new();
        }
    };
    tracing::debug!(frames = pieces.len(), "Split oversized frame: {}", e);
    pieces
        .iter()
        .filter_map(|piece| match codec.encode(piece) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("Dropping {} frame: {}", piece.kind(), e);
                None
            }
        })
        .collect()
}

struct DetachOnDrop {
    registry: Arc<SessionRegistry>,
    viewer: ViewerHandle,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.registry.detach(&self.viewer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ChannelProcessManager;
    use protocol::{Component, SessionKey};

    fn manager() -> ChannelProcessManager {
        let manager = ChannelProcessManager::new();
        manager.register(SessionKey::new("bot-1", Component::Main));
        manager
    }

    #[test]
    fn test_resolve_known_endpoint() {
        let processes = manager();
        let endpoint = resolve_endpoint(
            "/api/v1/instances/bot-1/component/main/terminal?lines=20",
            500,
            &processes,
        )
        .unwrap();
        assert_eq!(endpoint.key, SessionKey::new("bot-1", Component::Main));
        assert_eq!(endpoint.history_depth, 20);
    }

    #[test]
    fn test_resolve_uses_default_depth_without_lines() {
        let processes = manager();
        let endpoint = resolve_endpoint(
            "/api/v1/instances/bot-1/component/main/terminal",
            42,
            &processes,
        )
        .unwrap();
        assert_eq!(endpoint.history_depth, 42);
    }

    #[test]
    fn test_resolve_unknown_target_is_not_found() {
        let processes = manager();
        let rejection = resolve_endpoint(
            "/api/v1/instances/bot-2/component/main/terminal",
            500,
            &processes,
        )
        .unwrap_err();
        assert!(matches!(rejection, Rejection::NotFound(_)));
        assert_eq!(rejection.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_resolve_unknown_component_is_not_found() {
        let processes = manager();
        let rejection = resolve_endpoint(
            "/api/v1/instances/bot-1/component/worker/terminal",
            500,
            &processes,
        )
        .unwrap_err();
        assert!(matches!(rejection, Rejection::NotFound(_)));
    }

    #[test]
    fn test_resolve_malformed_path_is_bad_request() {
        let processes = manager();
        for path in [
            "/",
            "/api/v1/instances/bot-1/terminal",
            "/api/v1/instances/bot-1/component/main/terminal?lines=lots",
        ] {
            let rejection = resolve_endpoint(path, 500, &processes).unwrap_err();
            assert_eq!(rejection.status(), StatusCode::BAD_REQUEST, "{path}");
        }
    }

    #[test]
    fn test_rejection_response_carries_status() {
        let response = Rejection::NotFound("gone".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_deref(), Some("gone"));
    }

    #[test]
    fn test_default_settings() {
        let settings = ServerSettings::default();
        assert_eq!(settings.max_frame_size, 1024 * 1024);
        assert_eq!(settings.max_protocol_errors, 16);
        assert_eq!(settings.default_history_depth, 500);
    }

    #[test]
    fn test_encode_split_resplits_oversized_output() {
        let codec = FrameCodec::with_max_frame_size(128);
        let data = "0123456789".repeat(40);
        let texts = encode_split(&codec, RelayMessage::output(data.clone()));
        assert!(texts.len() > 1);

        let mut joined = String::new();
        for text in &texts {
            assert!(text.len() <= 128);
            match codec.decode(text).unwrap() {
                RelayMessage::Output { data } => joined.push_str(&data),
                other => panic!("expected output, got {other:?}"),
            }
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_encode_split_drops_oversized_notice() {
        let codec = FrameCodec::with_max_frame_size(64);
        assert!(encode_split(&codec, RelayMessage::error("x".repeat(100))).is_empty());
        assert_eq!(encode_split(&codec, RelayMessage::error("short")).len(), 1);
    }
}
