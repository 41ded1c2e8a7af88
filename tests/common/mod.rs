//! Common test utilities
//!
//! Node configs tuned for fast tests, a scripted parent for relay tests,
//! and timeout helpers so a hung protocol fails instead of blocking CI.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hieravg::config::NodeConfig;
use hieravg::leaf::LeafClient;
use hieravg::protocol::{split_stream, Message, TcpFrameWriter, DEFAULT_MAX_FRAME_BYTES};
use hieravg::types::{GlobalState, ParamVector};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

/// Upper bound for any single protocol step in tests
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Node config bound to an ephemeral loopback port
pub fn test_config(dimension: usize, initial_delay_ms: u64) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.host = "127.0.0.1".to_string();
    config.node.port = 0;
    config.node.dimension = dimension;
    config.node.send_timeout_ms = 500;
    config.node.handshake_timeout_ms = 2_000;
    config.schedule.initial_delay_ms = initial_delay_ms;
    config.schedule.min_delay_ms = 50;
    config.schedule.max_delay_ms = initial_delay_ms.max(50);
    config.schedule.poll_interval_ms = 10;
    config.relay.reconnect_initial_ms = 50;
    config.relay.reconnect_max_ms = 200;
    config
}

/// Await `fut`, panicking if it takes longer than [`STEP_TIMEOUT`]
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Poll `cond` until it holds or [`STEP_TIMEOUT`] passes
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn connect_leaf(addr: SocketAddr) -> LeafClient {
    within(
        "leaf connect",
        LeafClient::connect(&addr.to_string(), DEFAULT_MAX_FRAME_BYTES, STEP_TIMEOUT),
    )
    .await
    .expect("leaf should connect")
}

pub fn vector(values: &[f64]) -> ParamVector {
    ParamVector::from_vec(values.to_vec())
}

pub fn assert_close(actual: &ParamVector, expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "dimension of {}", actual);
    for (a, e) in actual.as_slice().iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "expected {:?}, got {}", expected, actual);
    }
}

// ─────────────────────────────────────────────────────────────────
// Scripted Parent
// ─────────────────────────────────────────────────────────────────

/// Stand-in for a parent node: greets one child with a fixed `Hello`,
/// records everything the child sends, and broadcasts on demand.
pub struct MockParent {
    pub addr: SocketAddr,
    pub hello: GlobalState,
    received: mpsc::UnboundedReceiver<Message>,
    writer: Arc<Mutex<Option<TcpFrameWriter>>>,
}

impl MockParent {
    pub async fn start(hello: GlobalState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, received) = mpsc::unbounded_channel();
        let writer = Arc::new(Mutex::new(None));

        let greeting = hello.clone();
        let writer_slot = Arc::clone(&writer);
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (mut reader, mut w) = split_stream(stream, DEFAULT_MAX_FRAME_BYTES);
            if w.send(&Message::hello(&greeting)).await.is_err() {
                return;
            }
            *writer_slot.lock().await = Some(w);

            while let Ok(msg) = reader.receive().await {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            hello,
            received,
            writer,
        }
    }

    /// Next message sent by the child
    pub async fn next_message(&mut self) -> Message {
        within("message at mock parent", self.received.recv())
            .await
            .expect("child link closed")
    }

    /// Assert that the child sends nothing for `quiet`
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Some(msg)) = tokio::time::timeout(quiet, self.received.recv()).await {
            panic!("unexpected message at mock parent: {:?}", msg);
        }
    }

    pub async fn broadcast(&self, state: &GlobalState) {
        wait_for_writer(&self.writer).await;
        let mut guard = self.writer.lock().await;
        if let Some(w) = guard.as_mut() {
            w.send(&Message::broadcast(state)).await.unwrap();
        }
    }
}

async fn wait_for_writer(writer: &Arc<Mutex<Option<TcpFrameWriter>>>) {
    let deadline = Instant::now() + STEP_TIMEOUT;
    while writer.lock().await.is_none() {
        if Instant::now() > deadline {
            panic!("child never connected to mock parent");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
