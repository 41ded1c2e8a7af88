//! Node server: listener, per-session handlers, and the node handle
//!
//! One task accepts connections, one task per accepted connection reads its
//! updates, one scheduler task closes rounds, and on relays one more task
//! listens to the parent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, NodeSettings};
use crate::error::{Error, Result, SessionAction};
use crate::protocol::{FrameReader, FrameWriter, Message};
use crate::types::GlobalState;

use super::aggregator::{RoundAggregator, SubmitOutcome};
use super::broadcaster::Broadcaster;
use super::registry::{SessionId, SharedWriter};
use super::scheduler::{RoundScheduler, ScheduleState};
use super::state::{new_shared, NodeRole, NodeState, NodeStatus, SharedState};
use super::upstream::{connect_with_retry, UpstreamRelay};
use super::wait_for_shutdown;

// ─────────────────────────────────────────────────────────────────
// Node Handle
// ─────────────────────────────────────────────────────────────────

/// How long `shutdown` waits for each node task before aborting it
const TASK_STOP_GRACE: Duration = Duration::from_secs(2);

/// A running root or relay node
pub struct NodeHandle {
    role: NodeRole,
    local_addr: SocketAddr,
    state: SharedState,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    upstream: Option<Arc<UpstreamRelay>>,
}

impl NodeHandle {
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Address the listener is bound to (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Most recently published or adopted global state
    pub fn global_state(&self) -> Arc<GlobalState> {
        Arc::clone(&self.state.lock().global)
    }

    pub fn status(&self) -> NodeStatus {
        self.state.lock().status()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the node: close the listener, stop the scheduler, say goodbye
    /// to the parent and close every child connection. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(role = %self.role, addr = %self.local_addr, "Shutting down node");

        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            match tokio::time::timeout(TASK_STOP_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(error = %e, "Node task ended abnormally"),
                Err(_) => {
                    warn!("Node task did not stop in time, aborting it");
                    task.abort();
                }
            }
        }

        if let Some(upstream) = &self.upstream {
            upstream.close().await;
        }

        let sessions = self.state.lock().registry.drain();
        let closed = sessions.len();
        for session in sessions {
            session.close().await;
        }

        info!(role = %self.role, sessions = closed, "Node stopped");
    }
}

// ─────────────────────────────────────────────────────────────────
// Startup
// ─────────────────────────────────────────────────────────────────

/// Start a root node: the sole minter of round tokens
pub async fn start_root(config: &NodeConfig) -> Result<NodeHandle> {
    config.validate()?;

    let listener = bind(&config.node).await?;
    let global = GlobalState::initial(config.node.dimension);
    let state = new_shared(NodeState::new(
        global,
        ScheduleState::from_settings(&config.schedule),
    ));

    let (shutdown_tx, _) = watch::channel(false);
    Ok(launch(NodeRole::Root, listener, state, config, shutdown_tx, None))
}

/// Start a relay node. Blocks until the parent has been reached and its
/// `Hello` received, since the relay's first round runs under that token.
pub async fn start_relay(config: &NodeConfig) -> Result<NodeHandle> {
    config.validate()?;

    let listener = bind(&config.node).await?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let link = connect_with_retry(&config.relay, &config.node, &mut shutdown_rx)
        .await?
        .ok_or_else(|| Error::Internal("relay start-up interrupted".to_string()))?;
    info!(parent = %link.peer, token = %link.hello.token.short(), "Connected to parent");

    let state = new_shared(NodeState::new(
        link.hello,
        ScheduleState::from_settings(&config.schedule),
    ));
    let upstream = Arc::new(UpstreamRelay::new(
        config.relay.clone(),
        config.node.clone(),
        state.clone(),
        Broadcaster::new(state.clone(), config.node.send_timeout()),
        link.writer,
    ));

    Ok(launch(
        NodeRole::Relay,
        listener,
        state,
        config,
        shutdown_tx,
        Some((upstream, link.reader)),
    ))
}

async fn bind(settings: &NodeSettings) -> Result<TcpListener> {
    let addr = settings.listen_addr();
    TcpListener::bind(&addr)
        .await
        .map_err(|source| Error::BindFailed { addr, source })
}

fn launch(
    role: NodeRole,
    listener: TcpListener,
    state: SharedState,
    config: &NodeConfig,
    shutdown_tx: watch::Sender<bool>,
    upstream: Option<(Arc<UpstreamRelay>, crate::protocol::TcpFrameReader)>,
) -> NodeHandle {
    let local_addr = listener
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], config.node.port)));
    let mut tasks = Vec::new();

    let scheduler = RoundScheduler::new(state.clone(), role);
    let upstream_relay = upstream.as_ref().map(|(relay, _)| Arc::clone(relay));
    tasks.push(tokio::spawn(scheduler.run(
        Broadcaster::new(state.clone(), config.node.send_timeout()),
        upstream_relay.clone(),
        shutdown_tx.subscribe(),
    )));

    if let Some((relay, reader)) = upstream {
        tasks.push(tokio::spawn(relay.run(reader, shutdown_tx.subscribe())));
    }

    tasks.push(tokio::spawn(accept_loop(
        listener,
        state.clone(),
        config.node.clone(),
        shutdown_tx.subscribe(),
    )));

    info!(
        role = %role,
        addr = %local_addr,
        dimension = config.node.dimension,
        delay_ms = config.schedule.initial_delay_ms,
        "Node listening"
    );

    NodeHandle {
        role,
        local_addr,
        state,
        shutdown_tx,
        stopped: AtomicBool::new(false),
        tasks: Mutex::new(tasks),
        upstream: upstream_relay,
    }
}

// ─────────────────────────────────────────────────────────────────
// Connections
// ─────────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    state: SharedState,
    settings: NodeSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => admit(&state, stream, peer, &settings).await,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    debug!("Listener closed");
}

/// Register a new child, send it `Hello`, and start its handler.
///
/// The session's writer is locked before registration so that a broadcast
/// racing with the accept can never reach the child ahead of its `Hello`.
async fn admit(
    state: &SharedState,
    stream: TcpStream,
    peer: SocketAddr,
    settings: &NodeSettings,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let reader = FrameReader::new(read_half, settings.max_frame_bytes);
    let writer: SharedWriter = Arc::new(AsyncMutex::new(FrameWriter::new(
        Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>
    )));
    let mut hello_guard = Arc::clone(&writer).lock_owned().await;

    let (id, replaced, global) = {
        let mut st = state.lock();
        let (id, replaced) = st.registry.register(peer, Arc::clone(&writer));
        (id, replaced, Arc::clone(&st.global))
    };

    if let Some(previous) = replaced {
        info!(peer = %peer, "Replacing existing session from the same address");
        previous.close().await;
    }

    let deadline = settings.send_timeout();
    let sent = match tokio::time::timeout(deadline, hello_guard.send(&Message::hello(&global))).await {
        Ok(sent) => sent,
        Err(_) => Err(Error::connection_timeout(peer.to_string(), "send Hello to", deadline)),
    };
    if let Err(e) = sent {
        warn!(peer = %peer, error = %e, "Failed to send Hello");
        drop(hello_guard);
        let removed = state.lock().registry.unregister_session(peer, id);
        if let Some(session) = removed {
            session.close().await;
        }
        return;
    }
    drop(hello_guard);

    let handler = tokio::spawn(serve_session(Arc::clone(state), reader, peer, id));
    let attached = state
        .lock()
        .registry
        .attach_handler(peer, id, handler.abort_handle());
    if !attached {
        handler.abort();
        return;
    }

    info!(peer = %peer, token = %global.token.short(), "Session opened");
}

/// Read updates from one child until it disconnects
async fn serve_session(
    state: SharedState,
    mut reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
    peer: SocketAddr,
    id: SessionId,
) {
    let aggregator = RoundAggregator::new(state.clone());

    loop {
        match reader.receive().await {
            Ok(Message::Update { token, value, weight }) => {
                let outcome = aggregator.submit(peer, id, token, &value, weight);
                if !log_submit(peer, &outcome) {
                    break;
                }
            }
            Ok(Message::Close) => {
                debug!(peer = %peer, "Child sent Close");
                break;
            }
            Ok(other) => {
                let e = Error::UnexpectedMessage {
                    message_type: other.type_name(),
                    peer,
                };
                warn!(peer = %peer, error = %e, "Ignoring message");
            }
            Err(e) => match e.session_action() {
                SessionAction::Remove => {
                    debug!(peer = %peer, error = %e, "Session ended");
                    break;
                }
                SessionAction::Ignore => warn!(peer = %peer, error = %e, "Ignoring message"),
                SessionAction::Propagate => {
                    error!(peer = %peer, error = %e.format_for_log(), "Session failed");
                    break;
                }
            },
        }
    }

    let removed = state.lock().registry.unregister_session(peer, id);
    if let Some(mut session) = removed {
        let connected_secs = session.connected_at.elapsed().as_secs();
        session.detach_handler();
        session.close().await;
        info!(peer = %peer, connected_secs = connected_secs, "Session closed");
    }
}

/// Log a submit outcome; returns false when the session is gone
fn log_submit(peer: SocketAddr, outcome: &SubmitOutcome) -> bool {
    match outcome {
        SubmitOutcome::Applied { total_weight, responded, live } => {
            debug!(
                peer = %peer,
                weight = total_weight,
                responded = responded,
                live = live,
                "Update applied"
            );
        }
        SubmitOutcome::Stale { current } => {
            debug!(peer = %peer, token = %current.short(), "Dropping stale update");
        }
        SubmitOutcome::Sealed => {
            debug!(peer = %peer, "Round already forwarded, dropping update");
        }
        SubmitOutcome::ShapeMismatch(e) => {
            warn!(peer = %peer, error = %e, "Dropping update");
        }
        SubmitOutcome::InvalidWeight => {
            warn!(peer = %peer, "Dropping update with invalid weight or values");
        }
        SubmitOutcome::Overflow => {
            warn!(peer = %peer, "Dropping update that would overflow the round sum");
        }
        SubmitOutcome::UnknownSession => return false,
    }
    true
}
