//! Session host: one live relay session bound to one process.
//!
//! ```text
//!   process output ──► pump ──► on_process_output ─┬─► ring buffer
//!                                                  ├─► viewer 1 queue
//!                                                  └─► viewer 2 queue (authoritative)
//!   viewer 2 input/resize ──► process input / PTY resize
//! ```
//!
//! The ring buffer and the viewer list share one mutex. Attach takes the
//! history snapshot and registers the viewer under that mutex, and the pump
//! appends and fans out under it too, so a new viewer's first live `output`
//! frame directly follows the last replayed line.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use protocol::{FrameCodec, RelayMessage, SessionKey, TerminalSize, MAX_FRAME_SIZE};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ring_buffer::{OutputRingBuffer, DEFAULT_RING_CAPACITY, DEFAULT_RING_MAX_BYTES};
use super::viewer::{
    Attachment, Delivery, ViewerHandle, ViewerId, ViewerInfo, ViewerSlot,
    DEFAULT_VIEWER_QUEUE_CAPACITY, MIN_VIEWER_QUEUE_CAPACITY,
};
use super::SessionError;
use crate::process::{OutputStream, ProcessInput, PtyResize};

/// Notice sent to viewers when the process output stream ends.
pub const PROCESS_EXITED_NOTICE: &str = "process exited";

/// Per-host limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSettings {
    pub ring_capacity: usize,
    pub ring_max_bytes: usize,
    pub viewer_queue_capacity: usize,
    /// Largest encoded frame a viewer may be sent. Longer history and
    /// output are split across several frames.
    pub max_frame_size: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            ring_max_bytes: DEFAULT_RING_MAX_BYTES,
            viewer_queue_capacity: DEFAULT_VIEWER_QUEUE_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// What happened to a chunk of viewer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    Forwarded,
    /// Another viewer attached more recently.
    NotAuthoritative,
    Terminated,
    /// The process exposes no input sink.
    NoInput,
}

/// What happened to a viewer resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDisposition {
    Applied,
    /// Recorded, but the process is not attached to a PTY.
    NoPty,
    NotAuthoritative,
    Terminated,
}

/// Process-side bindings of a host.
pub(crate) struct ProcessBinding {
    pub pid: Option<u32>,
    pub backlog: Vec<String>,
    pub input: Option<Arc<dyn ProcessInput>>,
    pub resize: Option<Arc<dyn PtyResize>>,
}

struct HostInner {
    buffer: OutputRingBuffer,
    /// Attach order; the last entry is authoritative.
    viewers: Vec<ViewerSlot>,
}

/// Snapshot of a host for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub host_id: Uuid,
    pub session_id: String,
    pub key: SessionKey,
    pub pid: Option<u32>,
    pub terminated: bool,
    pub authoritative_viewer: Option<ViewerId>,
    pub viewers: Vec<ViewerInfo>,
    pub buffered_chunks: usize,
    pub buffered_bytes: usize,
    pub total_chunks: u64,
    pub age_secs: u64,
}

pub struct SessionHost {
    id: Uuid,
    key: SessionKey,
    pid: Option<u32>,
    input: Option<Arc<dyn ProcessInput>>,
    resize: Option<Arc<dyn PtyResize>>,
    queue_capacity: usize,
    codec: FrameCodec,
    inner: Mutex<HostInner>,
    next_viewer_id: AtomicU64,
    terminated: AtomicBool,
    viewer_count: AtomicUsize,
    /// Bumped on every attach and detach.
    membership_epoch: AtomicU64,
    pump_cancel: CancellationToken,
    created_at: Instant,
}

impl SessionHost {
    pub(crate) fn new(key: SessionKey, binding: ProcessBinding, settings: HostSettings) -> Arc<Self> {
        let mut buffer =
            OutputRingBuffer::with_byte_limit(settings.ring_capacity, settings.ring_max_bytes);
        for chunk in binding.backlog {
            buffer.push(chunk);
        }

        Arc::new(Self {
            id: Uuid::new_v4(),
            key,
            pid: binding.pid,
            input: binding.input,
            resize: binding.resize,
            queue_capacity: settings.viewer_queue_capacity.max(MIN_VIEWER_QUEUE_CAPACITY),
            codec: FrameCodec::with_max_frame_size(settings.max_frame_size),
            inner: Mutex::new(HostInner {
                buffer,
                viewers: Vec::new(),
            }),
            next_viewer_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
            viewer_count: AtomicUsize::new(0),
            membership_epoch: AtomicU64::new(0),
            pump_cancel: CancellationToken::new(),
            created_at: Instant::now(),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewer_count.load(Ordering::SeqCst)
    }

    pub(crate) fn membership_epoch(&self) -> u64 {
        self.membership_epoch.load(Ordering::SeqCst)
    }

    /// The most recently attached viewer that is still attached.
    pub fn authoritative_viewer(&self) -> Option<ViewerId> {
        self.lock_inner().viewers.last().map(|v| v.id)
    }

    /// Drain `output` into this host until the process ends or the host is
    /// retired, then mark it terminated and call `on_end`.
    pub(crate) fn spawn_pump<F>(self: &Arc<Self>, mut output: OutputStream, on_end: F)
    where
        F: FnOnce(Arc<SessionHost>) + Send + 'static,
    {
        let host = Arc::clone(self);
        let cancel = self.pump_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = output.recv() => match chunk {
                        Some(chunk) => host.on_process_output(chunk),
                        None => {
                            tracing::info!(
                                session_id = %host.key.session_id(),
                                host_id = %host.id,
                                "Process output ended"
                            );
                            host.mark_terminated(PROCESS_EXITED_NOTICE);
                            break;
                        }
                    },
                }
            }
            on_end(host);
        });
    }

    fn connected_message(&self) -> RelayMessage {
        let name = self.key.component.display_name();
        let message = if self.is_terminated() {
            format!("{} ({}) has exited", name, self.key)
        } else {
            format!("Attached to {} ({})", name, self.key)
        };
        RelayMessage::connected(message, self.pid)
    }

    /// Register a new authoritative viewer.
    ///
    /// The returned queue already holds `connected` and the newest
    /// `min(history_depth, buffered)` chunks in one or more `history`
    /// frames, followed by the exit notice if the process has ended.
    pub fn attach(self: &Arc<Self>, history_depth: usize) -> Attachment {
        let id = self.next_viewer_id.fetch_add(1, Ordering::SeqCst);

        let (rx, replayed, history_frames) = {
            let mut inner = self.lock_inner();
            let lines = inner.buffer.tail(history_depth);
            let replayed = lines.len();
            let history = self.codec.history_frames(lines);
            let history_frames = history.len();

            // Room for the replay on top of the live queue.
            let (tx, rx) = mpsc::channel(self.queue_capacity + history_frames + 2);
            let mut slot = ViewerSlot::new(id, tx);
            slot.deliver(self.connected_message());
            for frame in history {
                slot.deliver(frame);
            }
            if self.is_terminated() {
                slot.deliver(RelayMessage::error(PROCESS_EXITED_NOTICE));
            }
            inner.viewers.push(slot);
            self.viewer_count.store(inner.viewers.len(), Ordering::SeqCst);
            self.membership_epoch.fetch_add(1, Ordering::SeqCst);
            (rx, replayed, history_frames)
        };

        tracing::info!(
            session_id = %self.key.session_id(),
            host_id = %self.id,
            viewer_id = id,
            replayed,
            history_frames,
            "Viewer attached"
        );

        Attachment {
            viewer: ViewerHandle::new(id, Arc::clone(self)),
            frames: rx,
        }
    }

    /// Remove a viewer. Returns false if it was not attached.
    ///
    /// When authority passes to another viewer whose size is known, that
    /// size is re-applied to the PTY.
    pub fn detach(&self, viewer: ViewerId) -> bool {
        let (removed, handover) = {
            let mut inner = self.lock_inner();
            let was_authoritative = inner.viewers.last().map(|v| v.id) == Some(viewer);
            let before = inner.viewers.len();
            inner.viewers.retain(|v| v.id != viewer);
            let removed = inner.viewers.len() != before;
            self.viewer_count.store(inner.viewers.len(), Ordering::SeqCst);
            if removed {
                self.membership_epoch.fetch_add(1, Ordering::SeqCst);
            }
            let handover = if removed && was_authoritative {
                inner.viewers.last().and_then(|v| v.size)
            } else {
                None
            };
            (removed, handover)
        };

        if removed {
            tracing::info!(
                session_id = %self.key.session_id(),
                host_id = %self.id,
                viewer_id = viewer,
                remaining = self.viewer_count(),
                "Viewer detached"
            );
        }
        if let Some(size) = handover {
            self.apply_size_in_background(size);
        }
        removed
    }

    fn apply_size_in_background(&self, size: TerminalSize) {
        let (Some(hook), false) = (self.resize.clone(), self.is_terminated()) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session_id = self.key.session_id();
        runtime.spawn(async move {
            if let Err(e) = hook.resize(size).await {
                tracing::debug!(session_id = %session_id, error = %e, "Handover resize failed");
            }
        });
    }

    /// Append a chunk to the history and offer it to every viewer.
    pub fn on_process_output(&self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        let frames = self.codec.output_frames(&chunk);
        let mut inner = self.lock_inner();
        inner.buffer.push(chunk);
        for frame in frames {
            self.fan_out(&mut inner, frame);
        }
    }

    /// Offer `message` to every viewer, dropping those that overflow or are
    /// gone. Called with the inner lock held.
    fn fan_out(&self, inner: &mut HostInner, message: RelayMessage) {
        let session_id = &self.key;
        inner.viewers.retain_mut(|viewer| match viewer.deliver(message.clone()) {
            Delivery::Queued => true,
            Delivery::Overflow => {
                tracing::warn!(
                    session = %session_id,
                    viewer_id = viewer.id,
                    queued = viewer.stats.frames_queued,
                    "Viewer queue full, dropping viewer"
                );
                false
            }
            Delivery::Closed => {
                tracing::debug!(session = %session_id, viewer_id = viewer.id, "Viewer gone");
                false
            }
        });
        self.viewer_count.store(inner.viewers.len(), Ordering::SeqCst);
    }

    /// Forward input from `viewer` if it is authoritative.
    pub async fn on_viewer_input(
        &self,
        viewer: ViewerId,
        data: &str,
    ) -> Result<InputDisposition, SessionError> {
        if self.is_terminated() {
            return Ok(InputDisposition::Terminated);
        }
        if self.authoritative_viewer() != Some(viewer) {
            tracing::debug!(
                session_id = %self.key.session_id(),
                viewer_id = viewer,
                "Ignoring input from non-authoritative viewer"
            );
            return Ok(InputDisposition::NotAuthoritative);
        }
        let Some(input) = &self.input else {
            return Ok(InputDisposition::NoInput);
        };
        input.write(data.as_bytes()).await?;
        Ok(InputDisposition::Forwarded)
    }

    /// Record the viewer's size and apply it if the viewer is authoritative.
    pub async fn on_viewer_resize(
        &self,
        viewer: ViewerId,
        size: TerminalSize,
    ) -> Result<ResizeDisposition, SessionError> {
        let authoritative = {
            let mut inner = self.lock_inner();
            if let Some(slot) = inner.viewers.iter_mut().find(|v| v.id == viewer) {
                slot.size = Some(size);
            }
            inner.viewers.last().map(|v| v.id) == Some(viewer)
        };

        if self.is_terminated() {
            return Ok(ResizeDisposition::Terminated);
        }
        if !authoritative {
            return Ok(ResizeDisposition::NotAuthoritative);
        }
        let Some(hook) = &self.resize else {
            return Ok(ResizeDisposition::NoPty);
        };
        hook.resize(size).await?;
        Ok(ResizeDisposition::Applied)
    }

    /// The newest `min(depth, buffered)` chunks, oldest first.
    pub fn replay_history(&self, depth: usize) -> Vec<String> {
        self.lock_inner().buffer.tail(depth)
    }

    /// Mark the host terminated and notify every viewer. Viewers stay
    /// attached so they keep the final screen.
    pub fn mark_terminated(&self, notice: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.lock_inner();
        self.fan_out(&mut inner, RelayMessage::error(notice));
    }

    /// Notify and disconnect every viewer and stop the pump.
    pub fn retire(&self, reason: &str) {
        self.pump_cancel.cancel();
        self.terminated.store(true, Ordering::SeqCst);
        let mut inner = self.lock_inner();
        for viewer in inner.viewers.iter_mut() {
            let _ = viewer.deliver(RelayMessage::error(reason));
        }
        let dropped = inner.viewers.len();
        inner.viewers.clear();
        self.viewer_count.store(0, Ordering::SeqCst);
        drop(inner);

        tracing::info!(
            session_id = %self.key.session_id(),
            host_id = %self.id,
            dropped,
            reason,
            "Session host retired"
        );
    }

    pub fn info(&self) -> HostInfo {
        let inner = self.lock_inner();
        let authoritative = inner.viewers.last().map(|v| v.id);
        let viewers = inner
            .viewers
            .iter()
            .map(|v| ViewerInfo {
                id: v.id,
                authoritative: Some(v.id) == authoritative,
                size: v.size,
                attached_secs: v.attached_at.elapsed().as_secs(),
                stats: v.stats.clone(),
            })
            .collect();
        HostInfo {
            host_id: self.id,
            session_id: self.key.session_id(),
            key: self.key.clone(),
            pid: self.pid,
            terminated: self.is_terminated(),
            authoritative_viewer: authoritative,
            viewers,
            buffered_chunks: inner.buffer.len(),
            buffered_bytes: inner.buffer.byte_len(),
            total_chunks: inner.buffer.total_emitted(),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for SessionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHost")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("terminated", &self.is_terminated())
            .field("viewers", &self.viewer_count())
            .finish()
    }
}
