//! Daemon orchestrator for wiring together all components.
//!
//! [`RelayDaemon`] owns the process manager, the session registry and the
//! WebSocket relay listener, and answers operator requests arriving over IPC.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{IpcHandler, IpcResponse, IpcRequest, IpcSessionInfo};
use crate::network::{RelayServer, ServerSettings};
use crate::process::{BoxFuture, ProcessManager, PtyProcessManager};
use crate::session::SessionRegistry;
use protocol::SessionKey;

/// Notice sent to viewers when the daemon shuts down.
pub const SHUTDOWN_NOTICE: &str = "relay daemon shutting down";

/// How long `stop` waits for background tasks.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener and starting components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the daemon.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    StateChanged(DaemonState),
    ProcessStarted { key: SessionKey, pid: Option<u32> },
    ProcessFailed { key: SessionKey, message: String },
}

/// The relay daemon.
pub struct RelayDaemon {
    config: Config,
    processes: Arc<dyn ProcessManager>,
    registry: Arc<SessionRegistry>,
    server: Arc<RelayServer>,
    state: RwLock<DaemonState>,
    local_addr: RwLock<Option<SocketAddr>>,
    started_at: RwLock<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<DaemonEvent>,
}

impl RelayDaemon {
    /// Creates a daemon that runs the configured components in PTYs.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let processes = PtyProcessManager::new(config.command_specs())
            .with_size(config.pty_size())
            .with_backlog_capacity(config.pty.backlog_capacity)
            .with_stop_timeout(Duration::from_secs(config.pty.stop_timeout_secs));

        Ok(Self::with_process_manager(config, Arc::new(processes)))
    }

    /// Creates a daemon around an existing process manager.
    pub fn with_process_manager(config: Config, processes: Arc<dyn ProcessManager>) -> Self {
        let registry = SessionRegistry::new(Arc::clone(&processes), config.registry_settings());
        let server = RelayServer::new(Arc::clone(&registry), config.server_settings());
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            processes,
            registry,
            server,
            state: RwLock::new(DaemonState::Stopped),
            local_addr: RwLock::new(None),
            started_at: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    /// Returns a receiver for daemon events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the relay listener, starts serving and launches autostart
    /// components. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != DaemonState::Stopped {
                anyhow::bail!("Daemon is already running");
            }
            *state = DaemonState::Starting;
        }
        self.emit_event(DaemonEvent::StateChanged(DaemonState::Starting));

        info!("Starting relay daemon...");

        let listener = match RelayServer::bind(&self.config.server.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(DaemonState::Stopped).await;
                return Err(e);
            }
        };
        let addr = listener
            .local_addr()
            .context("Relay listener has no local address")?;
        *self.local_addr.write().await = Some(addr);

        let server = Arc::clone(&self.server);
        let token = self.shutdown_token.clone();
        let serve = tokio::spawn(async move {
            if let Err(e) = server.serve(listener, token).await {
                warn!("Relay listener failed: {:#}", e);
            }
        });
        self.tasks.lock().await.push(serve);

        for key in self.config.autostart_keys() {
            self.start_process(&key).await;
        }

        *self.started_at.write().await = Some(Instant::now());
        self.set_state(DaemonState::Running).await;
        info!(addr = %addr, targets = self.processes.targets().len(), "Relay daemon running");
        Ok(addr)
    }

    async fn start_process(&self, key: &SessionKey) -> Option<u32> {
        match self.processes.start(key).await {
            Ok(pid) => {
                info!(session_id = %key.session_id(), ?pid, "Started component");
                self.emit_event(DaemonEvent::ProcessStarted {
                    key: key.clone(),
                    pid,
                });
                pid
            }
            Err(e) => {
                warn!(session_id = %key.session_id(), "Failed to start component: {}", e);
                self.emit_event(DaemonEvent::ProcessFailed {
                    key: key.clone(),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Stops the daemon gracefully: closes the listener, notifies viewers
    /// and stops running components.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == DaemonState::Stopped {
                return Ok(());
            }
            if *state == DaemonState::ShuttingDown {
                anyhow::bail!("Daemon is already shutting down");
            }
            *state = DaemonState::ShuttingDown;
        }
        self.emit_event(DaemonEvent::StateChanged(DaemonState::ShuttingDown));

        info!("Stopping relay daemon...");

        self.shutdown_token.cancel();
        self.registry.shutdown(SHUTDOWN_NOTICE);

        let running: Vec<SessionKey> = self
            .processes
            .targets()
            .into_iter()
            .filter(|key| {
                self.processes
                    .status(key)
                    .map(|status| status.is_running())
                    .unwrap_or(false)
            })
            .collect();
        let stops = running.iter().map(|key| async move {
            debug!(session_id = %key.session_id(), "Stopping component");
            if let Err(e) = self.processes.stop(key, false).await {
                warn!(session_id = %key.session_id(), "Error stopping component: {}", e);
            }
        });
        join_all(stops).await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, join_all(tasks))
            .await
            .is_err()
        {
            warn!("Background tasks did not finish within {:?}", TASK_DRAIN_TIMEOUT);
        }

        *self.started_at.write().await = None;
        self.set_state(DaemonState::Stopped).await;
        info!("Relay daemon stopped");
        Ok(())
    }

    async fn set_state(&self, state: DaemonState) {
        *self.state.write().await = state;
        self.emit_event(DaemonEvent::StateChanged(state));
    }

    fn emit_event(&self, event: DaemonEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn processes(&self) -> &Arc<dyn ProcessManager> {
        &self.processes
    }

    pub fn server(&self) -> &Arc<RelayServer> {
        &self.server
    }

    /// Address the relay listener is bound to, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn uptime(&self) -> Duration {
        self.started_at
            .read()
            .await
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    async fn answer(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: self.state().await == DaemonState::Running,
                uptime_secs: self.uptime().await.as_secs(),
                bind: self
                    .local_addr()
                    .await
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| self.config.server.bind.clone()),
                session_count: self.registry.count(),
                viewer_count: self.registry.viewer_count(),
                connection_count: self.server.active_connections(),
                target_count: self.processes.targets().len(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.shutdown_token.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self
                    .registry
                    .list()
                    .iter()
                    .map(IpcSessionInfo::from)
                    .collect(),
            },
            IpcRequest::StartProcess { key } => match self.processes.start(&key).await {
                Ok(pid) => {
                    self.emit_event(DaemonEvent::ProcessStarted {
                        key: key.clone(),
                        pid,
                    });
                    IpcResponse::ProcessStarted { key, pid }
                }
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            },
            IpcRequest::StopProcess { key, force } => {
                match self.processes.stop(&key, force).await {
                    Ok(status) => IpcResponse::ProcessStopped { key, status },
                    Err(e) => IpcResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            IpcRequest::ProcessStatus { key } => match self.processes.status(&key) {
                Ok(status) => IpcResponse::ProcessStatus { key, status },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            },
        }
    }
}

impl IpcHandler for RelayDaemon {
    fn handle(&self, request: IpcRequest) -> BoxFuture<'_, IpcResponse> {
        Box::pin(self.answer(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ChannelProcessManager, ProcessStatus};
    use protocol::Component;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".to_string();
        config
    }

    fn channel_daemon() -> (RelayDaemon, Arc<ChannelProcessManager>) {
        let processes = Arc::new(ChannelProcessManager::new());
        processes.register(SessionKey::new("bot-1", Component::Main));
        let daemon = RelayDaemon::with_process_manager(test_config(), processes.clone());
        (daemon, processes)
    }

    #[tokio::test]
    async fn test_daemon_creation() {
        let daemon = RelayDaemon::new(test_config()).unwrap();
        assert_eq!(daemon.state().await, DaemonState::Stopped);
        assert!(daemon.local_addr().await.is_none());
        assert!(daemon.processes().targets().is_empty());
    }

    #[tokio::test]
    async fn test_daemon_rejects_invalid_config() {
        let mut config = test_config();
        config.daemon.log_level = "loud".to_string();
        assert!(RelayDaemon::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (daemon, _processes) = channel_daemon();
        let mut events = daemon.subscribe();

        let addr = daemon.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(daemon.state().await, DaemonState::Running);
        assert_eq!(daemon.local_addr().await, Some(addr));
        assert!(daemon.start().await.is_err());

        daemon.stop().await.unwrap();
        assert_eq!(daemon.state().await, DaemonState::Stopped);
        assert!(daemon.shutdown_token().is_cancelled());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DaemonEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                DaemonState::Starting,
                DaemonState::Running,
                DaemonState::ShuttingDown,
                DaemonState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let (daemon, _processes) = channel_daemon();
        daemon.stop().await.unwrap();
        assert_eq!(daemon.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_autostart_failure_is_reported() {
        let processes = Arc::new(ChannelProcessManager::new());
        processes.register(SessionKey::new("bot-1", Component::Main));
        let mut config = test_config();
        config.targets.push(crate::config::TargetConfig {
            id: "bot-1".to_string(),
            components: [(
                "main".to_string(),
                crate::config::ComponentConfig {
                    command: "sh".to_string(),
                    autostart: true,
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        let daemon = RelayDaemon::with_process_manager(config, processes);
        let mut events = daemon.subscribe();

        daemon.start().await.unwrap();

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if let DaemonEvent::ProcessFailed { key, .. } = event {
                assert_eq!(key, SessionKey::new("bot-1", Component::Main));
                failed = true;
            }
        }
        assert!(failed);
        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_ping_and_status() {
        let (daemon, _processes) = channel_daemon();
        assert_eq!(daemon.handle(IpcRequest::Ping).await, IpcResponse::Pong);

        let addr = daemon.start().await.unwrap();
        match daemon.handle(IpcRequest::Status).await {
            IpcResponse::Status {
                running,
                bind,
                session_count,
                target_count,
                ..
            } => {
                assert!(running);
                assert_eq!(bind, addr.to_string());
                assert_eq!(session_count, 0);
                assert_eq!(target_count, 1);
            }
            other => panic!("Expected Status response, got {other:?}"),
        }
        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_process_status_and_sessions() {
        let (daemon, processes) = channel_daemon();
        let key = SessionKey::new("bot-1", Component::Main);

        assert_eq!(
            daemon
                .handle(IpcRequest::ProcessStatus { key: key.clone() })
                .await,
            IpcResponse::ProcessStatus {
                key: key.clone(),
                status: ProcessStatus::NotStarted,
            }
        );

        let _run = processes.launch(&key, Some(77)).unwrap();
        let attachment = daemon.registry().attach(&key, 10).unwrap();

        match daemon.handle(IpcRequest::ListSessions).await {
            IpcResponse::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].session_id, "bot-1_main");
                assert_eq!(sessions[0].pid, Some(77));
                assert_eq!(sessions[0].viewer_count, 1);
            }
            other => panic!("Expected Sessions response, got {other:?}"),
        }

        daemon.registry().detach(&attachment.viewer);
    }

    #[tokio::test]
    async fn test_ipc_unknown_target_is_error() {
        let (daemon, _processes) = channel_daemon();
        let key = SessionKey::new("bot-9", Component::Napcat);
        assert!(matches!(
            daemon.handle(IpcRequest::ProcessStatus { key: key.clone() }).await,
            IpcResponse::Error { .. }
        ));
        assert!(matches!(
            daemon.handle(IpcRequest::StartProcess { key }).await,
            IpcResponse::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_ipc_stop_cancels_shutdown_token() {
        let (daemon, _processes) = channel_daemon();
        assert_eq!(daemon.handle(IpcRequest::Stop).await, IpcResponse::Stopping);
        assert!(daemon.shutdown_token().is_cancelled());
    }
}
