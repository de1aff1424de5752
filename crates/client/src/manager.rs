//! Client-side terminal session manager.
//!
//! The manager owns one terminal surface and at most one live relay
//! connection. It never blocks on the network: `open` spawns a connection
//! task and returns, and everything the task observes comes back as a
//! [`TaggedEvent`] that the owner feeds to [`TerminalSessionManager::apply`],
//! either from [`TerminalSessionManager::next_event`] in an async loop or via
//! [`TerminalSessionManager::drain`].
//!
//! ```text
//!            open(key)                        connected frame
//!   Idle ───────────────► Connecting ────────────────────────► Connected
//!                             │  transport error / fatal            │
//!                             ├─────────────────► Error ◄───────────┤
//!                             │  close() / clean remote close       │
//!                             └─────────────────► Closed ◄──────────┘
//! ```
//!
//! Each `open` gets a new [`Generation`]. `apply` drops every event whose
//! generation is not the active one, so a superseded connection can never
//! write into the surface of the session that replaced it.

use std::time::{Duration, Instant};

use protocol::{RelayMessage, SessionKey, TerminalEndpoint, TerminalSize, DEFAULT_HISTORY_DEPTH};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::resize::{ResizeDebouncer, DEFAULT_RESIZE_DEBOUNCE};
use crate::state::{Generation, LifecycleNotice, SessionState};
use crate::surface::TerminalSurface;
use crate::transport::{ConnectionLink, Connector, LinkEvent, TaggedEvent};

/// Buffer size for the event channel between connection tasks and the manager.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Buffer size for the lifecycle notice broadcast channel.
const NOTICE_BUFFER_SIZE: usize = 64;

const RULE: &str = "\x1b[1;36m========================================\x1b[0m";

/// Configuration for a session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// History depth requested by `open`.
    pub history_depth: usize,
    /// Quiet period before a geometry change is sent.
    pub resize_debounce: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            history_depth: DEFAULT_HISTORY_DEPTH,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
        }
    }
}

impl ManagerConfig {
    pub fn history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    pub fn resize_debounce(mut self, delay: Duration) -> Self {
        self.resize_debounce = delay;
        self
    }
}

/// What `apply` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// The event changed state or the surface.
    Applied,
    /// The event belongs to a superseded or torn down connection.
    Stale,
    /// The event was current but not acceptable and was dropped.
    Ignored,
}

struct ActiveConnection {
    key: SessionKey,
    generation: Generation,
    outbound: mpsc::UnboundedSender<RelayMessage>,
    cancel: CancellationToken,
    link_open: bool,
    _task: JoinHandle<()>,
}

/// Manages the relay session shown on one terminal surface.
pub struct TerminalSessionManager<S: TerminalSurface, C: Connector> {
    connector: C,
    surface: S,
    config: ManagerConfig,
    state: SessionState,
    generation: Generation,
    key: Option<SessionKey>,
    active: Option<ActiveConnection>,
    events_tx: mpsc::Sender<TaggedEvent>,
    events_rx: mpsc::Receiver<TaggedEvent>,
    notice_tx: broadcast::Sender<LifecycleNotice>,
    geometry: TerminalSize,
    debouncer: ResizeDebouncer,
    last_sent_size: Option<TerminalSize>,
    /// Lines replayed so far while a replay block is open on the surface.
    replaying: Option<usize>,
}

impl<S: TerminalSurface, C: Connector> TerminalSessionManager<S, C> {
    pub fn new(connector: C, surface: S) -> Self {
        Self::with_config(connector, surface, ManagerConfig::default())
    }

    pub fn with_config(connector: C, surface: S, config: ManagerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (notice_tx, _) = broadcast::channel(NOTICE_BUFFER_SIZE);
        let geometry = surface.size();
        let debouncer = ResizeDebouncer::new(config.resize_debounce);
        Self {
            connector,
            surface,
            config,
            state: SessionState::Idle,
            generation: Generation(0),
            key: None,
            active: None,
            events_tx,
            events_rx,
            notice_tx,
            geometry,
            debouncer,
            last_sent_size: None,
            replaying: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the most recent `open`.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Identity of the most recent `open`.
    pub fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn geometry(&self) -> TerminalSize {
        self.geometry
    }

    /// The size carried by the last `resize` frame sent on this generation.
    pub fn last_sent_size(&self) -> Option<TerminalSize> {
        self.last_sent_size
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.notice_tx.subscribe()
    }

    /// Open a session with the configured history depth.
    pub fn open(&mut self, key: SessionKey) -> Generation {
        let depth = self.config.history_depth;
        self.open_with_depth(key, depth)
    }

    /// Open a session for `key`.
    ///
    /// Opening the identity that is already connecting or connected is a
    /// no-op. Any other live connection is torn down first.
    pub fn open_with_depth(&mut self, key: SessionKey, history_depth: usize) -> Generation {
        if self.state.is_live() && self.key.as_ref() == Some(&key) {
            tracing::debug!(%key, generation = %self.generation, "already open");
            return self.generation;
        }

        if self.state.is_live() {
            self.teardown(format!("switching to {key}"));
        }

        self.generation = self.generation.next();
        let generation = self.generation;
        self.key = Some(key.clone());
        self.last_sent_size = None;
        self.replaying = None;
        self.debouncer.cancel();

        self.surface.clear();
        self.write_header(&key);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let endpoint = TerminalEndpoint::new(key.clone()).with_history_depth(history_depth);
        let link = ConnectionLink {
            generation,
            events: self.events_tx.clone(),
            outbound: outbound_rx,
            cancel: cancel.clone(),
        };
        let task = self.connector.connect(endpoint, link);

        self.active = Some(ActiveConnection {
            key: key.clone(),
            generation,
            outbound,
            cancel,
            link_open: false,
            _task: task,
        });

        tracing::info!(%key, %generation, history_depth, "opening terminal session");
        self.notify(LifecycleNotice::Connecting { generation, key });
        self.set_state(SessionState::Connecting);
        generation
    }

    /// Tear down the current session. Later events for it are ignored.
    pub fn close(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.teardown("closed".to_string());
    }

    /// Forward keystrokes or pasted text to the host.
    pub fn send_input(&mut self, data: &str) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.send(RelayMessage::input(data))
    }

    /// Record a new geometry. While connected the change is sent after the
    /// debounce period, see [`Self::tick`].
    pub fn set_geometry(&mut self, size: TerminalSize, now: Instant) {
        if !size.is_valid() {
            tracing::debug!(%size, "ignoring empty geometry");
            return;
        }
        self.geometry = size;
        if self.state == SessionState::Connected {
            self.debouncer.record(size, now);
        }
    }

    /// Re-read the geometry from the surface.
    pub fn refresh_geometry(&mut self, now: Instant) {
        let size = self.surface.size();
        self.set_geometry(size, now);
    }

    /// When `tick` next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// Send a debounced geometry change once it is due.
    pub fn tick(&mut self, now: Instant) {
        if let Some(size) = self.debouncer.poll(now) {
            self.send_resize(size);
        }
    }

    /// Send any pending geometry change immediately.
    pub fn flush_resize(&mut self) {
        if let Some(size) = self.debouncer.flush() {
            self.send_resize(size);
        }
    }

    /// Wait for the next event from any connection task.
    pub async fn next_event(&mut self) -> Option<TaggedEvent> {
        self.events_rx.recv().await
    }

    /// Apply every event that is already queued. Returns how many were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            if self.apply(event) == FrameDisposition::Applied {
                applied += 1;
            }
        }
        applied
    }

    /// Apply one event. Events from any generation other than the active one
    /// are dropped without touching state or surface.
    pub fn apply(&mut self, tagged: TaggedEvent) -> FrameDisposition {
        let generation = match &self.active {
            Some(active) if active.generation == tagged.generation => active.generation,
            _ => {
                tracing::trace!(
                    event_generation = %tagged.generation,
                    current = %self.generation,
                    "dropping stale event"
                );
                return FrameDisposition::Stale;
            }
        };

        match tagged.event {
            LinkEvent::Opened => {
                if let Some(active) = self.active.as_mut() {
                    active.link_open = true;
                }
                tracing::debug!(%generation, "transport open");
                FrameDisposition::Applied
            }
            LinkEvent::Frame(frame) => self.apply_frame(generation, frame),
            LinkEvent::Malformed(reason) => {
                tracing::warn!(%generation, %reason, "dropping malformed frame");
                FrameDisposition::Ignored
            }
            LinkEvent::Closed { clean: true, reason } => {
                self.surface.write_line("");
                self.surface
                    .write_line(&format!("\x1b[90m--- connection closed: {reason} ---\x1b[0m"));
                self.finish(SessionState::Closed);
                self.notify(LifecycleNotice::Closed { generation, reason });
                FrameDisposition::Applied
            }
            LinkEvent::Closed {
                clean: false,
                reason,
            } => {
                tracing::warn!(%generation, %reason, "connection lost");
                self.surface.write_line("");
                self.surface
                    .write_line(&format!("\x1b[1;31m✗ Connection lost: {reason}\x1b[0m"));
                self.finish(SessionState::Error);
                self.notify(LifecycleNotice::Error {
                    generation,
                    message: reason,
                    fatal: false,
                });
                FrameDisposition::Applied
            }
            LinkEvent::Failed(err) => {
                self.fail(generation, err);
                FrameDisposition::Applied
            }
        }
    }

    fn apply_frame(&mut self, generation: Generation, frame: RelayMessage) -> FrameDisposition {
        match frame {
            RelayMessage::Connected { message, pid } => {
                if self.state != SessionState::Connecting {
                    tracing::warn!(%generation, "duplicate connected frame");
                    return FrameDisposition::Ignored;
                }
                self.surface
                    .write_line(&format!("\x1b[1;32m✓ {message}\x1b[0m"));
                self.surface.write_line("");
                self.set_state(SessionState::Connected);
                self.notify(LifecycleNotice::Connected {
                    generation,
                    message,
                    pid,
                });

                // The host learns the real size before any output arrives.
                self.debouncer.cancel();
                let size = self.geometry;
                self.send_resize(size);
                FrameDisposition::Applied
            }
            RelayMessage::History { lines } => {
                if !lines.is_empty() {
                    self.notify(LifecycleNotice::ReplayingHistory {
                        generation,
                        lines: lines.len(),
                    });
                    // A long replay arrives as consecutive frames under one header.
                    if self.replaying.is_none() {
                        self.surface.write_line("\x1b[90m--- history ---\x1b[0m");
                    }
                    *self.replaying.get_or_insert(0) += lines.len();
                    for line in &lines {
                        self.surface.write(line);
                    }
                }
                FrameDisposition::Applied
            }
            RelayMessage::Output { data } => {
                self.end_replay(generation);
                self.surface.write(&data);
                FrameDisposition::Applied
            }
            RelayMessage::Error { message } => {
                self.end_replay(generation);
                self.surface.write_line("");
                self.surface
                    .write_line(&format!("\x1b[1;31m✗ {message}\x1b[0m"));
                self.notify(LifecycleNotice::Error {
                    generation,
                    message,
                    fatal: false,
                });
                FrameDisposition::Applied
            }
            other @ (RelayMessage::Input { .. } | RelayMessage::Resize { .. }) => {
                tracing::warn!(%generation, kind = other.kind(), "host sent a client-only frame");
                FrameDisposition::Ignored
            }
        }
    }

    /// Close an open replay block with the live marker.
    fn end_replay(&mut self, generation: Generation) {
        if let Some(replayed) = self.replaying.take() {
            self.surface.write_line("");
            self.surface.write_line("\x1b[90m--- live ---\x1b[0m");
            tracing::debug!(%generation, replayed, "history replay complete");
        }
    }

    fn fail(&mut self, generation: Generation, err: ClientError) {
        let fatal = err.is_fatal();
        let message = err.to_string();
        if fatal {
            tracing::error!(%generation, error = %message, "cannot open terminal");
            self.surface.clear();
            self.surface.write_line(RULE);
            self.surface
                .write_line(&format!("\x1b[1;31m✗ Cannot open terminal: {message}\x1b[0m"));
            self.surface.write_line(RULE);
        } else {
            tracing::warn!(%generation, error = %message, "terminal connection failed");
            self.surface.write_line("");
            self.surface.write_line(&format!(
                "\x1b[1;31m✗ Terminal connection failed: {message}\x1b[0m"
            ));
        }
        self.finish(SessionState::Error);
        self.notify(LifecycleNotice::Error {
            generation,
            message,
            fatal,
        });
    }

    fn send(&mut self, message: RelayMessage) -> Result<()> {
        match &self.active {
            Some(active) if active.link_open => active
                .outbound
                .send(message)
                .map_err(|_| ClientError::NotConnected),
            _ => Err(ClientError::NotConnected),
        }
    }

    fn send_resize(&mut self, size: TerminalSize) {
        if self.last_sent_size == Some(size) {
            return;
        }
        match self.send(RelayMessage::resize(size)) {
            Ok(()) => {
                tracing::debug!(generation = %self.generation, %size, "sent resize");
                self.last_sent_size = Some(size);
            }
            Err(e) => tracing::debug!(%size, error = %e, "resize not sent"),
        }
    }

    /// Local teardown: stop sending, cancel the task, retire the generation.
    fn teardown(&mut self, reason: String) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.debouncer.cancel();
        drop(active.outbound);
        if self.state.is_live() {
            active.cancel.cancel();
        }
        tracing::info!(key = %active.key, generation = %active.generation, %reason, "terminal session closed");
        self.set_state(SessionState::Closed);
        self.notify(LifecycleNotice::Closed {
            generation: active.generation,
            reason,
        });
    }

    /// The connection ended on its own.
    fn finish(&mut self, state: SessionState) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
        self.debouncer.cancel();
        self.set_state(state);
    }

    fn write_header(&mut self, key: &SessionKey) {
        self.surface.write_line(RULE);
        self.surface
            .write_line(&format!("\x1b[1;33mTarget:\x1b[0m    {}", key.target_id));
        self.surface.write_line(&format!(
            "\x1b[1;33mComponent:\x1b[0m {} ({})",
            key.component.display_name(),
            key.component
        ));
        self.surface.write_line(RULE);
        self.surface.write_line("");
        self.surface
            .write_line("\x1b[1;32mConnecting to terminal...\x1b[0m");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, generation = %self.generation, "session state");
        self.state = state;
        self.notify(LifecycleNotice::StateChanged {
            generation: self.generation,
            state,
        });
    }

    fn notify(&self, notice: LifecycleNotice) {
        // No subscribers is fine.
        let _ = self.notice_tx.send(notice);
    }
}

impl<S: TerminalSurface, C: Connector> Drop for TerminalSessionManager<S, C> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}
