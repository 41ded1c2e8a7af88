//! Fan-out of a published global state to every child session

use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::protocol::{EncodedFrame, Message};
use crate::types::GlobalState;

use super::registry::{SessionHandle, SessionId};
use super::state::SharedState;

/// Delivery counts of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    state: SharedState,

    /// Per-session deadline; a child that stops reading counts as failed
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(state: SharedState, send_timeout: Duration) -> Self {
        Self { state, send_timeout }
    }

    /// Send `global` to every registered session.
    ///
    /// The frame is serialized once. The node lock is taken for the snapshot
    /// and again for removing the sessions whose send failed; the sends run
    /// concurrently with the lock released, each bounded by the send timeout.
    pub async fn broadcast(&self, global: &GlobalState) -> BroadcastReport {
        let frame = match EncodedFrame::encode(&Message::broadcast(global)) {
            Ok(frame) => frame,
            Err(e) => {
                error!(token = %global.token.short(), error = %e, "Failed to encode broadcast");
                return BroadcastReport::default();
            }
        };

        let targets = self.state.lock().registry.snapshot();
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let send_timeout = self.send_timeout;
        let sends = targets.into_iter().map(|target| {
            let frame = frame.clone();
            async move {
                let send = async { target.writer.lock().await.send_frame(&frame).await };
                let result = match tokio::time::timeout(send_timeout, send).await {
                    Ok(sent) => sent,
                    Err(_) => Err(Error::connection_timeout(
                        target.addr.to_string(),
                        "broadcast to",
                        send_timeout,
                    )),
                };
                (target, result)
            }
        });

        let mut report = BroadcastReport::default();
        let mut failed: Vec<SessionHandle> = Vec::new();
        for (target, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(peer = %target.addr, error = %e, "Broadcast send failed, dropping session");
                    failed.push(target);
                }
            }
        }
        report.failed = failed.len();

        if !failed.is_empty() {
            self.remove(failed.iter().map(|t| (t.addr, t.id))).await;
        }

        debug!(
            token = %global.token.short(),
            bytes = frame.payload_len(),
            delivered = report.delivered,
            "Broadcast sent"
        );
        report
    }

    async fn remove(&self, sessions: impl Iterator<Item = (std::net::SocketAddr, SessionId)>) {
        let removed: Vec<_> = {
            let mut st = self.state.lock();
            sessions
                .filter_map(|(addr, id)| st.registry.unregister_session(addr, id))
                .collect()
        };
        for session in removed {
            session.close().await;
        }
    }
}
