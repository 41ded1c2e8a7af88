//! Leaf client: the bottom of the tree
//!
//! A leaf receives each new global state, produces one weighted update for
//! it and submits it under that state's token.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::node::wait_for_shutdown;
use crate::protocol::{split_stream, Message, TcpFrameReader, TcpFrameWriter};
use crate::types::{GlobalState, ParamVector, RoundToken};

/// Produces the update a leaf submits for a given global state.
///
/// This is where a training step plugs in. Returning `Ok(None)` skips the round.
#[async_trait]
pub trait UpdateSource: Send {
    async fn produce(&mut self, state: &GlobalState) -> Result<Option<(ParamVector, f64)>>;
}

/// Submits the same vector and weight every round after a fixed delay
#[derive(Debug, Clone)]
pub struct FixedUpdate {
    pub value: ParamVector,
    pub weight: f64,
    pub delay: Duration,
}

impl FixedUpdate {
    pub fn new(value: ParamVector, weight: f64, delay: Duration) -> Self {
        Self { value, weight, delay }
    }
}

#[async_trait]
impl UpdateSource for FixedUpdate {
    async fn produce(&mut self, state: &GlobalState) -> Result<Option<(ParamVector, f64)>> {
        if self.value.len() != state.dimension() {
            return Err(Error::config_field_invalid(
                "leaf.value",
                format!(
                    "leaf.value has {} elements but the tree uses vectors of length {}",
                    self.value.len(),
                    state.dimension()
                ),
            ));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Some((self.value.clone(), self.weight)))
    }
}

// ─────────────────────────────────────────────────────────────────
// Leaf Client
// ─────────────────────────────────────────────────────────────────

pub struct LeafClient {
    peer: SocketAddr,
    reader: TcpFrameReader,
    writer: TcpFrameWriter,
    latest: GlobalState,
}

impl LeafClient {
    /// Connect to a root or relay and wait for its `Hello`. Both steps
    /// together must finish within `handshake_timeout`.
    pub async fn connect(addr: &str, max_frame_bytes: u32, handshake_timeout: Duration) -> Result<Self> {
        tokio::time::timeout(handshake_timeout, Self::handshake(addr, max_frame_bytes))
            .await
            .map_err(|_| Error::connection_timeout(addr, "receive Hello from", handshake_timeout))?
    }

    async fn handshake(addr: &str, max_frame_bytes: u32) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;
        let (mut reader, writer) = split_stream(stream, max_frame_bytes);

        let latest = match reader.receive().await? {
            Message::Hello { global_value, token } => GlobalState::new(global_value, token),
            other => {
                return Err(Error::UnexpectedMessage {
                    message_type: other.type_name(),
                    peer,
                })
            }
        };
        debug!(server = %peer, token = %latest.token.short(), "Received Hello");

        Ok(Self {
            peer,
            reader,
            writer,
            latest,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Last global state received from the server
    pub fn latest(&self) -> &GlobalState {
        &self.latest
    }

    /// Submit an update for the latest known round
    pub async fn submit(&mut self, value: ParamVector, weight: f64) -> Result<()> {
        let token = self.latest.token;
        self.submit_for(token, value, weight).await
    }

    /// Submit an update under an explicit token
    pub async fn submit_for(&mut self, token: RoundToken, value: ParamVector, weight: f64) -> Result<()> {
        self.writer.send(&Message::Update { token, value, weight }).await
    }

    /// Wait for the next global state whose token differs from the latest one
    pub async fn next_state(&mut self) -> Result<&GlobalState> {
        loop {
            match self.reader.receive().await? {
                Message::Broadcast { global_value, token } | Message::Hello { global_value, token } => {
                    if token == self.latest.token {
                        continue;
                    }
                    self.latest = GlobalState::new(global_value, token);
                    return Ok(&self.latest);
                }
                other => {
                    warn!(
                        server = %self.peer,
                        message_type = other.type_name(),
                        "Ignoring unexpected message"
                    );
                }
            }
        }
    }

    /// Take part in `rounds` rounds (0 = until `shutdown` or the connection ends)
    pub async fn run<S: UpdateSource + ?Sized>(
        &mut self,
        source: &mut S,
        rounds: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64> {
        let mut completed = 0u64;

        loop {
            let update = tokio::select! {
                update = source.produce(&self.latest) => update?,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            if let Some((value, weight)) = update {
                self.submit(value, weight).await?;
                debug!(token = %self.latest.token.short(), weight = weight, "Update submitted");
            }

            tokio::select! {
                state = self.next_state() => { state?; }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
            completed += 1;
            info!(
                round = completed,
                token = %self.latest.token.short(),
                value = %self.latest.value,
                "New global state"
            );

            if rounds > 0 && completed >= rounds {
                break;
            }
        }

        Ok(completed)
    }

    /// Send `Close` and shut the connection down
    pub async fn close(mut self) -> Result<()> {
        self.writer.send(&Message::Close).await?;
        self.writer.shutdown().await
    }
}
