//! End-to-end tests: relay server and client session manager over a real
//! WebSocket, with an in-memory process manager standing in for real
//! processes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use client::{
    LifecycleNotice, MemorySurface, SessionState, TerminalSessionManager, WsConnector,
};
use daemon::process::{ChannelProcess, ChannelProcessManager, ProcessManager};
use daemon::session::{RegistrySettings, SessionRegistry};
use daemon::{RelayServer, ServerSettings};
use protocol::{Component, SessionKey, TerminalSize};
use tokio_util::sync::CancellationToken;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

type Manager = TerminalSessionManager<MemorySurface, WsConnector>;

struct Relay {
    server: Arc<RelayServer>,
    processes: Arc<ChannelProcessManager>,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Relay {
    async fn start() -> Self {
        let processes = Arc::new(ChannelProcessManager::new());
        let registry = SessionRegistry::new(
            Arc::clone(&processes) as Arc<dyn ProcessManager>,
            RegistrySettings::default(),
        );
        let server = RelayServer::new(registry, ServerSettings::default());
        let listener = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&server).serve(listener, shutdown.clone()));
        Self {
            server,
            processes,
            addr,
            shutdown,
        }
    }

    fn launch(&self, key: &SessionKey, pid: u32) -> ChannelProcess {
        self.processes.register(key.clone());
        self.processes.launch(key, Some(pid)).unwrap()
    }

    fn client(&self) -> Manager {
        let url = Url::parse(&format!("ws://{}", self.addr)).unwrap();
        let connector = WsConnector::new(url).connect_timeout(WAIT);
        TerminalSessionManager::new(connector, MemorySurface::new(TerminalSize::new(24, 80)))
    }

    fn viewers(&self, key: &SessionKey) -> usize {
        self.server
            .registry()
            .get(key)
            .map(|host| host.viewer_count())
            .unwrap_or(0)
    }

    async fn wait_for_viewers(&self, key: &SessionKey, count: usize) {
        let deadline = Instant::now() + WAIT;
        while self.viewers(key) != count {
            assert!(Instant::now() < deadline, "viewer count never reached {count}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn key(target: &str) -> SessionKey {
    SessionKey::new(target, Component::Main)
}

/// Apply events until `done` holds.
async fn pump_until(m: &mut Manager, mut done: impl FnMut(&Manager) -> bool) {
    tokio::time::timeout(WAIT, async {
        while !done(&*m) {
            let event = m.next_event().await.expect("event channel closed");
            m.apply(event);
        }
    })
    .await
    .expect("timed out waiting for the session");
}

async fn pump_connected(m: &mut Manager) {
    pump_until(m, |m| m.state() == SessionState::Connected).await;
}

async fn next_input(process: &mut ChannelProcess) -> String {
    tokio::time::timeout(WAIT, process.next_input())
        .await
        .expect("timed out waiting for input")
        .expect("input channel closed")
}

async fn next_resize(process: &mut ChannelProcess) -> TerminalSize {
    tokio::time::timeout(WAIT, process.next_resize())
        .await
        .expect("timed out waiting for resize")
        .expect("resize channel closed")
}

#[tokio::test]
async fn test_history_replay_continues_with_live_output() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    let mut process = relay.launch(&key, 100);
    for chunk in ["a\r\n", "b\r\n", "c\r\n", "d\r\n", "e\r\n"] {
        process.emit(chunk);
    }

    let mut m = relay.client();
    m.open_with_depth(key.clone(), 3);
    pump_until(&mut m, |m| m.surface().contents().contains("e\r\n")).await;

    // The host learns the client's size right after `connected`.
    assert_eq!(next_resize(&mut process).await, TerminalSize::new(24, 80));

    process.emit("f\r\n");
    pump_until(&mut m, |m| m.surface().contents().ends_with("f\r\n")).await;

    let contents = m.surface().contents();
    assert!(contents.contains("--- history ---"));
    assert!(contents.contains("c\r\nd\r\ne\r\n"));
    assert!(!contents.contains("b\r\nc\r\n"));
    let live = contents.find("--- live ---").unwrap();
    assert!(contents[live..].contains("f\r\n"));
    assert!(contents.contains("Attached to MaiBot (bot-1/main)"));
}

#[tokio::test]
async fn test_replay_larger_than_a_frame_arrives_whole() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    let process = relay.launch(&key, 108);

    // Create the host, then leave it running with no viewers.
    let mut first = relay.client();
    first.open(key.clone());
    pump_connected(&mut first).await;
    first.close();
    relay.wait_for_viewers(&key, 0).await;

    let chunks: Vec<String> = (0..400)
        .map(|i| format!("{i:04}{}\r\n", "x".repeat(3994)))
        .collect();
    for chunk in &chunks {
        process.emit(chunk);
    }
    let host = relay.server.registry().get(&key).unwrap();
    let deadline = Instant::now() + WAIT;
    while host.info().buffered_chunks < chunks.len() {
        assert!(Instant::now() < deadline, "ring never filled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut m = relay.client();
    m.open_with_depth(key.clone(), 1000);
    let last = chunks.last().unwrap().clone();
    pump_until(&mut m, |m| m.surface().contents().contains(&last)).await;
    process.emit("LIVE-MARKER");
    pump_until(&mut m, |m| m.surface().contents().ends_with("LIVE-MARKER")).await;

    let contents = m.surface().contents();
    let history = contents.find("--- history ---").expect("history marker missing");
    let replay = contents.find(&chunks.concat()).expect("replay has a gap");
    let live = contents.find("--- live ---").unwrap();
    assert!(history < replay);
    assert!(replay < live);
    assert_eq!(contents.matches("--- history ---").count(), 1);
}

#[tokio::test]
async fn test_input_reaches_process() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    let mut process = relay.launch(&key, 101);

    let mut m = relay.client();
    m.open(key);
    pump_connected(&mut m).await;

    m.send_input("ls -la\r").unwrap();
    assert_eq!(next_input(&mut process).await, "ls -la\r");
}

#[tokio::test]
async fn test_unknown_target_is_fatal() {
    let relay = Relay::start().await;
    let mut m = relay.client();
    let mut notices = m.subscribe();

    m.open(key("ghost"));
    pump_until(&mut m, |m| m.state().is_terminal()).await;

    assert_eq!(m.state(), SessionState::Error);
    assert!(m
        .surface()
        .contents()
        .contains("Cannot open terminal: no such target: ghost/main"));
    let fatal = std::iter::from_fn(|| notices.try_recv().ok())
        .any(|n| matches!(n, LifecycleNotice::Error { fatal: true, .. }));
    assert!(fatal);
}

#[tokio::test]
async fn test_stopped_component_reports_not_running() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    relay.processes.register(key.clone());

    let mut m = relay.client();
    m.open(key);
    pump_until(&mut m, |m| m.surface().contents().contains('✗')).await;

    assert_eq!(m.state(), SessionState::Connected);
    assert!(m
        .surface()
        .contents()
        .contains("MaiBot (bot-1/main) is not running"));
}

#[tokio::test]
async fn test_resize_converges_to_final_geometry() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    let mut process = relay.launch(&key, 102);

    let mut m = relay.client();
    m.open(key);
    pump_connected(&mut m).await;
    assert_eq!(next_resize(&mut process).await, TerminalSize::new(24, 80));

    let now = Instant::now();
    m.set_geometry(TerminalSize::new(30, 90), now);
    m.set_geometry(TerminalSize::new(35, 100), now);
    m.set_geometry(TerminalSize::new(40, 120), now);
    m.tick(now + Duration::from_secs(1));

    assert_eq!(next_resize(&mut process).await, TerminalSize::new(40, 120));
    assert_eq!(m.last_sent_size(), Some(TerminalSize::new(40, 120)));
}

#[tokio::test]
async fn test_latest_viewer_holds_authority() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    let mut process = relay.launch(&key, 103);

    let mut v1 = relay.client();
    v1.open(key.clone());
    pump_connected(&mut v1).await;
    let mut v2 = relay.client();
    v2.open(key.clone());
    pump_connected(&mut v2).await;

    v1.send_input("one").unwrap();
    v2.send_input("two").unwrap();
    assert_eq!(next_input(&mut process).await, "two");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(process.try_next_input(), None);

    v2.close();
    relay.wait_for_viewers(&key, 1).await;

    v1.send_input("three").unwrap();
    assert_eq!(next_input(&mut process).await, "three");
}

#[tokio::test]
async fn test_identity_switch_discards_old_session() {
    let relay = Relay::start().await;
    let first = key("bot-1");
    let second = key("bot-2");
    let old = relay.launch(&first, 104);
    let new = relay.launch(&second, 105);

    let mut m = relay.client();
    m.open(first.clone());
    pump_connected(&mut m).await;

    m.open(second.clone());
    old.emit("STALE");
    new.emit("fresh");
    pump_until(&mut m, |m| m.surface().contents().contains("fresh")).await;

    assert_eq!(m.key(), Some(&second));
    assert!(!m.surface().contents().contains("STALE"));
    relay.wait_for_viewers(&first, 0).await;
}

#[tokio::test]
async fn test_process_exit_is_announced() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    let process = relay.launch(&key, 106);

    let mut m = relay.client();
    m.open(key);
    pump_connected(&mut m).await;

    process.emit("bye\r\n");
    process.exit(Some(0));
    pump_until(&mut m, |m| m.surface().contents().contains("process exited")).await;

    assert!(m.surface().contents().contains("bye\r\n"));
    assert_eq!(m.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_registry_shutdown_closes_viewers_cleanly() {
    let relay = Relay::start().await;
    let key = key("bot-1");
    let _process = relay.launch(&key, 107);

    let mut m = relay.client();
    m.open(key);
    pump_connected(&mut m).await;

    relay.server.registry().shutdown("relay shutting down");
    pump_until(&mut m, |m| m.state().is_terminal()).await;

    assert_eq!(m.state(), SessionState::Closed);
    assert!(m.surface().contents().contains("relay shutting down"));
    assert_eq!(relay.server.registry().count(), 0);
}
