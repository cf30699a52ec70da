//! Shared helpers for integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use tether_control::{
    ChannelExit, ChannelHandle, CommandExecutor, ControlChannel, Dispatcher, Endpoint,
    ReconnectBackoff,
};
use tether_delivery::{DeliveryQueue, ReporterPool, WorkerSnapshot};
use tether_types::{CommandRef, ControlConfig, ServerConfig};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const AGENT_ID: &str = "agent-test";
pub const AGENT_KEY: &str = "s3cret";

/// The `Authorization` value the agent is expected to send.
pub fn expected_authorization() -> String {
    format!(r#"id="{AGENT_ID}", key="{AGENT_KEY}""#)
}

/// Server section pointing at `url` with the test credentials.
pub fn server_config(url: &str) -> ServerConfig {
    ServerConfig {
        url: url.to_string(),
        id: AGENT_ID.to_string(),
        key: AGENT_KEY.to_string(),
        ca_certificate: None,
        verify_certificate: true,
    }
}

static BUILD_CLI: Once = Once::new();

/// Path of the `tether` binary, building `tether-cli` on first use.
///
/// The binary lives in another workspace package, so Cargo does not build
/// it for this test crate on its own.
pub fn tether_bin() -> PathBuf {
    BUILD_CLI.call_once(|| {
        let workspace_root = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .expect("tests/ should sit inside the workspace");
        let status = std::process::Command::new(env!("CARGO"))
            .args(["build", "-p", "tether-cli", "--bin", "tether"])
            .current_dir(workspace_root)
            .status()
            .expect("should invoke cargo build");
        assert!(status.success(), "building tether-cli failed");
    });

    let bin = assert_cmd::cargo::cargo_bin("tether");
    assert!(bin.exists(), "tether binary not found at {}", bin.display());
    bin
}

/// Write `contents` to `tether.toml` inside `dir`.
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("tether.toml");
    std::fs::write(&path, contents).expect("should write config file");
    path
}

/// A plain `ws://` backhaul server on an ephemeral port.
///
/// Every accepted websocket is handed to the test through
/// [`BackhaulServer::next_connection`].
pub struct BackhaulServer {
    addr: SocketAddr,
    attempts: Arc<AtomicUsize>,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
    task: JoinHandle<()>,
}

impl BackhaulServer {
    pub async fn start() -> Self {
        Self::start_refusing(0).await
    }

    /// Like [`BackhaulServer::start`], but the first `refuse` TCP
    /// connections are dropped before the websocket handshake.
    pub async fn start_refusing(refuse: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind backhaul listener");
        let addr = listener.local_addr().expect("listener should have an address");
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, accepted) = mpsc::unbounded_channel();

        let counter = Arc::clone(&attempts);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= refuse {
                    drop(stream);
                    continue;
                }
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(conn) = ServerConn::accept(stream).await {
                        let _ = tx.send(conn);
                    }
                });
            }
        });

        Self {
            addr,
            attempts,
            accepted,
            task,
        }
    }

    /// Base URL to put in `server.url`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// TCP connections seen so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn next_connection(&mut self) -> ServerConn {
        tokio::time::timeout(TEST_TIMEOUT, self.accepted.recv())
            .await
            .expect("agent should connect in time")
            .expect("backhaul server task should be running")
    }

    /// Whether another websocket shows up within `wait`.
    pub async fn connects_within(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.accepted.recv()).await,
            Ok(Some(_))
        )
    }
}

impl Drop for BackhaulServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Server side of one accepted backhaul websocket.
pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
    pub path: String,
    pub headers: HeaderMap,
}

impl ServerConn {
    async fn accept(stream: TcpStream) -> Option<Self> {
        let mut seen = None;
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                seen = Some((request.uri().path().to_string(), request.headers().clone()));
                Ok(response)
            },
        )
        .await
        .ok()?;
        let (path, headers) = seen?;
        Some(Self { ws, path, headers })
    }

    pub async fn send_json(&mut self, frame: Value) {
        self.send_text(&frame.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("should send frame to agent");
    }

    /// Next text frame from the agent; `None` once the agent closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            let frame = tokio::time::timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .expect("agent should send or close in time");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Send a websocket-level ping frame (not a JSON query).
    pub async fn send_control_ping(&mut self) {
        self.ws
            .send(Message::Ping(b"heartbeat".to_vec().into()))
            .await
            .expect("should send ping frame to agent");
    }

    pub async fn expect_ping(&mut self) {
        let text = self
            .recv_text()
            .await
            .expect("agent closed instead of sending a ping");
        let frame: Value = serde_json::from_str(&text).expect("ping should be JSON");
        assert_eq!(frame, json!({"query": "ping"}));
    }

    pub async fn expect_closed(&mut self) {
        if let Some(text) = self.recv_text().await {
            panic!("expected the agent to close, got frame {text}");
        }
    }
}

/// A command observed by [`RecordingExecutor`], together with the paths
/// that were already queued when it started.
pub struct Executed {
    pub command: CommandRef,
    pub queued: Vec<String>,
}

/// Executor that drains the queue and reports what it saw instead of
/// running anything.
pub struct RecordingExecutor {
    queue: Arc<DeliveryQueue>,
    tx: mpsc::UnboundedSender<Executed>,
}

impl RecordingExecutor {
    pub fn new(queue: Arc<DeliveryQueue>) -> (Arc<Self>, mpsc::UnboundedReceiver<Executed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { queue, tx }), rx)
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, command: CommandRef) {
        let queued = drain_paths(&self.queue);
        let _ = self.tx.send(Executed { command, queued });
    }
}

/// Pop everything currently in the queue and return the request paths in
/// delivery order.
pub fn drain_paths(queue: &DeliveryQueue) -> Vec<String> {
    std::iter::from_fn(|| queue.try_dequeue())
        .map(|request| request.path)
        .collect()
}

/// Start a control channel against `url` with a millisecond reconnect
/// schedule (10ms doubling to 40ms).
pub fn spawn_channel(
    url: &str,
    queue: Arc<DeliveryQueue>,
    executor: Arc<dyn CommandExecutor>,
) -> (JoinHandle<ChannelExit>, ChannelHandle) {
    let endpoint = Endpoint::from_config(&server_config(url), &ControlConfig::default())
        .expect("should build backhaul endpoint");
    let (channel, handle) = ControlChannel::new(endpoint, Dispatcher::new(queue, executor));
    let channel = channel.with_backoff(ReconnectBackoff::new(
        Duration::from_millis(10),
        Duration::from_millis(40),
    ));
    (tokio::spawn(channel.run()), handle)
}

/// Wait for the channel task to finish.
pub async fn join_channel(task: JoinHandle<ChannelExit>) -> ChannelExit {
    tokio::time::timeout(TEST_TIMEOUT, task)
        .await
        .expect("control channel should stop in time")
        .expect("control channel task should not panic")
}

/// Poll the pool until its combined stats satisfy `done`.
pub async fn wait_for_stats(
    pool: &ReporterPool,
    wait: Duration,
    done: impl Fn(&WorkerSnapshot) -> bool,
) -> WorkerSnapshot {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let stats = pool.stats();
        if done(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reporter stats never converged: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
