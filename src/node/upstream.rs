//! Upstream relay (relay nodes only)
//!
//! Upward, every non-empty local round closure is sent to the parent as one
//! combined `Update`. Downward, a listener task waits on the parent
//! connection and adopts each `Broadcast` as the local round state before
//! re-broadcasting it to this node's children.
//!
//! When the parent link drops, the listener reconnects with exponential
//! backoff. The `Hello` of the new connection is adopted like a broadcast.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::config::{NodeSettings, RelaySettings};
use crate::error::{Error, Result, SessionAction};
use crate::protocol::{split_stream, Message, TcpFrameReader, TcpFrameWriter};
use crate::types::{GlobalState, ParamVector, RoundToken};

use super::broadcaster::Broadcaster;
use super::state::SharedState;
use super::wait_for_shutdown;

/// A freshly established parent connection
pub struct ParentLink {
    pub peer: SocketAddr,
    pub reader: TcpFrameReader,
    pub writer: TcpFrameWriter,

    /// State announced by the parent on connect
    pub hello: GlobalState,
}

/// Connect to the parent and wait for its `Hello`, bounded by the
/// handshake timeout
pub async fn connect_parent(addr: &str, node: &NodeSettings) -> Result<ParentLink> {
    let deadline = node.handshake_timeout();
    tokio::time::timeout(deadline, handshake(addr, node))
        .await
        .map_err(|_| Error::connection_timeout(addr, "receive Hello from", deadline))?
}

async fn handshake(addr: &str, node: &NodeSettings) -> Result<ParentLink> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::connection_failed(addr, e.to_string()))?;
    let _ = stream.set_nodelay(true);
    let peer = stream.peer_addr()?;
    let (mut reader, writer) = split_stream(stream, node.max_frame_bytes);

    let hello = match reader.receive().await? {
        Message::Hello { global_value, token } => GlobalState::new(global_value, token),
        other => {
            return Err(Error::UnexpectedMessage {
                message_type: other.type_name(),
                peer,
            })
        }
    };

    if hello.dimension() != node.dimension {
        return Err(Error::config_field_invalid(
            "node.dimension",
            format!(
                "parent {} publishes vectors of length {}, this node is configured for {}",
                peer,
                hello.dimension(),
                node.dimension
            ),
        ));
    }

    debug!(parent = %peer, token = %hello.token.short(), "Parent link established");
    Ok(ParentLink {
        peer,
        reader,
        writer,
        hello,
    })
}

fn reconnect_backoff(settings: &RelaySettings) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(settings.reconnect_initial_ms),
        max_interval: Duration::from_millis(settings.reconnect_max_ms),
        max_elapsed_time: None, // Attempts are counted instead
        ..Default::default()
    }
}

/// Connect to the parent, retrying with backoff.
///
/// Returns `Ok(None)` if `shutdown` fires first. Non-retryable errors (for
/// example a dimension mismatch) are returned immediately.
pub async fn connect_with_retry(
    settings: &RelaySettings,
    node: &NodeSettings,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<ParentLink>> {
    let addr = settings.parent_addr();
    let mut backoff = reconnect_backoff(settings);
    let mut attempts: u32 = 0;

    loop {
        info!(parent = %addr, "Connecting to parent");
        let err = match connect_parent(&addr, node).await {
            Ok(link) => return Ok(Some(link)),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        attempts += 1;
        if settings.max_reconnect_attempts > 0 && attempts >= settings.max_reconnect_attempts {
            error!(
                attempts = attempts,
                max = settings.max_reconnect_attempts,
                "Max reconnection attempts reached"
            );
            return Err(err);
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(Duration::from_millis(settings.reconnect_max_ms));
        warn!(
            parent = %addr,
            error = %err,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Parent unreachable, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(shutdown) => return Ok(None),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Upstream Relay
// ─────────────────────────────────────────────────────────────────

pub struct UpstreamRelay {
    settings: RelaySettings,
    node: NodeSettings,
    state: SharedState,
    broadcaster: Broadcaster,

    /// `None` while the parent link is down
    writer: AsyncMutex<Option<TcpFrameWriter>>,
}

impl UpstreamRelay {
    pub fn new(
        settings: RelaySettings,
        node: NodeSettings,
        state: SharedState,
        broadcaster: Broadcaster,
        writer: TcpFrameWriter,
    ) -> Self {
        Self {
            settings,
            node,
            state,
            broadcaster,
            writer: AsyncMutex::new(Some(writer)),
        }
    }

    pub fn parent_addr(&self) -> String {
        self.settings.parent_addr()
    }

    /// Send this subtree's combined result for `token` to the parent
    pub async fn forward(&self, token: RoundToken, value: ParamVector, weight: f64) -> Result<()> {
        let deadline = self.node.send_timeout();
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::connection_lost("parent link is down"))?;
        tokio::time::timeout(deadline, writer.send(&Message::Update { token, value, weight }))
            .await
            .map_err(|_| Error::connection_timeout(self.parent_addr(), "forward to", deadline))??;
        debug!(token = %token.short(), weight = weight, "Forwarded round to parent");
        Ok(())
    }

    /// Replace the local round with the parent's state and pass it down
    pub async fn adopt_and_relay(&self, global: GlobalState) {
        let adopted = {
            let mut st = self.state.lock();
            if global.dimension() != st.global.dimension() {
                warn!(
                    token = %global.token.short(),
                    expected = st.global.dimension(),
                    actual = global.dimension(),
                    "Ignoring parent state with wrong dimension"
                );
                return;
            }
            st.adopt(global)
        };
        debug!(token = %adopted.token.short(), "Adopted parent state");
        self.broadcaster.broadcast(&adopted).await;
    }

    /// Downward listener; owns the parent read half until shutdown
    pub async fn run(self: Arc<Self>, reader: TcpFrameReader, mut shutdown: watch::Receiver<bool>) {
        let mut reader = reader;

        loop {
            let lost = tokio::select! {
                e = self.listen(&mut reader) => e,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };
            warn!(parent = %self.parent_addr(), error = %lost, "Parent link lost");
            *self.writer.lock().await = None;

            let link = match connect_with_retry(&self.settings, &self.node, &mut shutdown).await {
                Ok(Some(link)) => link,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Giving up on parent, children stay connected without upstream");
                    break;
                }
            };

            info!(parent = %link.peer, "Reconnected to parent");
            reader = link.reader;
            *self.writer.lock().await = Some(link.writer);
            self.adopt_and_relay(link.hello).await;
        }

        debug!("Upstream listener stopped");
    }

    /// Process parent messages until the link fails
    async fn listen(&self, reader: &mut TcpFrameReader) -> Error {
        loop {
            match reader.receive().await {
                Ok(Message::Broadcast { global_value, token }) | Ok(Message::Hello { global_value, token }) => {
                    self.adopt_and_relay(GlobalState::new(global_value, token)).await;
                }
                Ok(Message::Close) => return Error::connection_lost("parent closed the link"),
                Ok(other) => {
                    warn!(message_type = other.type_name(), "Ignoring unexpected message from parent");
                }
                Err(e) => match e.session_action() {
                    SessionAction::Ignore => warn!(error = %e, "Parent message ignored"),
                    _ => return e,
                },
            }
        }
    }

    /// Say goodbye to the parent and close the write half
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            match tokio::time::timeout(self.node.send_timeout(), writer.send(&Message::Close)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Parent did not receive Close"),
                Err(_) => debug!("Timed out sending Close to parent"),
            }
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn node(dimension: usize) -> NodeSettings {
        NodeSettings {
            dimension,
            handshake_timeout_ms: 500,
            ..NodeSettings::default()
        }
    }

    /// Accept one connection and greet it with `first`
    async fn greeting_parent(first: Message) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_reader, mut writer) = split_stream(stream, node(1).max_frame_bytes);
            writer.send(&first).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_parent_reads_hello() {
        let hello = GlobalState::initial(3);
        let addr = greeting_parent(Message::hello(&hello)).await;

        let link = connect_parent(&addr, &node(3)).await.unwrap();
        assert_eq!(link.hello, hello);
    }

    #[tokio::test]
    async fn test_connect_parent_rejects_dimension() {
        let addr = greeting_parent(Message::hello(&GlobalState::initial(2))).await;

        let err = connect_parent(&addr, &node(3)).await.err().unwrap();
        assert!(!err.is_retryable());
        assert_eq!(err.exit_code(), 10);
    }

    #[tokio::test]
    async fn test_connect_parent_expects_hello_first() {
        let addr = greeting_parent(Message::Close).await;

        let err = connect_parent(&addr, &node(1)).await.err().unwrap();
        assert!(matches!(err, Error::UnexpectedMessage { .. }));
    }

    #[tokio::test]
    async fn test_connect_parent_times_out_without_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accepts, then stays silent
        let silent = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let started = std::time::Instant::now();
        let err = connect_parent(&addr, &node(1)).await.err().unwrap();
        assert!(matches!(err, Error::ConnectionTimeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
        silent.abort();
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let settings = RelaySettings {
            parent_host: "127.0.0.1".to_string(),
            parent_port: port,
            reconnect_initial_ms: 10,
            reconnect_max_ms: 20,
            max_reconnect_attempts: 2,
        };
        let (_tx, mut rx) = watch::channel(false);

        let result = connect_with_retry(&settings, &node(1), &mut rx).await;
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    }
}
