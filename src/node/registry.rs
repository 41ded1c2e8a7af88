//! Connection registry: live child sessions of one node
//!
//! The registry itself is not synchronized: it lives inside the node state
//! and is only touched while the node lock is held, so the quorum check always
//! sees a consistent session count.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWrite;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::protocol::FrameWriter;

/// Distinguishes successive sessions from the same peer address
pub type SessionId = u64;

/// Write half of a child connection
pub type SessionWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Writer shared between the broadcaster and session teardown
pub type SharedWriter = Arc<AsyncMutex<SessionWriter>>;

/// Upper bound on waiting for a writer that a stuck send still holds
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────

/// One connected child
pub struct Session {
    pub addr: SocketAddr,
    pub id: SessionId,

    /// Submitted an accepted update in the current round
    pub responded: bool,

    /// Accept time, reported when the session closes
    pub connected_at: Instant,
    writer: SharedWriter,
    handler: Option<AbortHandle>,
}

impl Session {
    /// Forget the handler task, used when the handler tears down its own session
    pub fn detach_handler(&mut self) {
        self.handler = None;
    }

    /// Close the connection and stop its handler task
    pub async fn close(self) {
        if let Some(handler) = self.handler {
            handler.abort();
        }
        let shutdown = async { self.writer.lock().await.shutdown().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.addr, error = %e, "Shutdown of session writer failed"),
            // The socket is released once the last writer handle drops
            Err(_) => debug!(peer = %self.addr, "Session writer busy, dropping it unflushed"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("responded", &self.responded)
            .finish()
    }
}

/// Point-in-time view of a session used for fan-out outside the lock
#[derive(Clone)]
pub struct SessionHandle {
    pub addr: SocketAddr,
    pub id: SessionId,
    pub writer: SharedWriter,
}

// ─────────────────────────────────────────────────────────────────
// Connection Registry
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: BTreeMap<SocketAddr, Session>,
    next_id: SessionId,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. A previous session at the same address is
    /// removed and returned so the caller can close it once the lock is released.
    pub fn register(&mut self, addr: SocketAddr, writer: SharedWriter) -> (SessionId, Option<Session>) {
        self.next_id += 1;
        let id = self.next_id;
        let session = Session {
            addr,
            id,
            responded: false,
            connected_at: Instant::now(),
            writer,
            handler: None,
        };
        let replaced = self.sessions.insert(addr, session);
        (id, replaced)
    }

    /// Attach the handler task of a session. Returns false if the session is
    /// already gone, in which case the caller must stop the task itself.
    pub fn attach_handler(&mut self, addr: SocketAddr, id: SessionId, handler: AbortHandle) -> bool {
        match self.sessions.get_mut(&addr) {
            Some(session) if session.id == id => {
                session.handler = Some(handler);
                true
            }
            _ => false,
        }
    }

    /// Remove whatever session is registered at `addr`. No-op if absent.
    pub fn unregister(&mut self, addr: SocketAddr) -> Option<Session> {
        self.sessions.remove(&addr)
    }

    /// Remove the session only if it is still the one identified by `id`
    pub fn unregister_session(&mut self, addr: SocketAddr, id: SessionId) -> Option<Session> {
        match self.sessions.get(&addr) {
            Some(session) if session.id == id => self.sessions.remove(&addr),
            _ => None,
        }
    }

    /// Remove every session (node shutdown)
    pub fn drain(&mut self) -> Vec<Session> {
        std::mem::take(&mut self.sessions).into_values().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .values()
            .map(|s| SessionHandle {
                addr: s.addr,
                id: s.id,
                writer: Arc::clone(&s.writer),
            })
            .collect()
    }

    pub fn contains(&self, addr: SocketAddr, id: SessionId) -> bool {
        self.sessions.get(&addr).is_some_and(|s| s.id == id)
    }

    /// Mark a session as having responded in the current round
    pub fn mark_responded(&mut self, addr: SocketAddr, id: SessionId) -> bool {
        match self.sessions.get_mut(&addr) {
            Some(session) if session.id == id => {
                session.responded = true;
                true
            }
            _ => false,
        }
    }

    pub fn clear_responded(&mut self) {
        for session in self.sessions.values_mut() {
            session.responded = false;
        }
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn responded_count(&self) -> usize {
        self.sessions.values().filter(|s| s.responded).count()
    }

    /// Every live session has responded (and there is at least one)
    pub fn quorum_reached(&self) -> bool {
        let live = self.live_count();
        live > 0 && self.responded_count() == live
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.sessions.keys().copied().collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) fn test_writer() -> SharedWriter {
        let (ours, _theirs) = tokio::io::duplex(1024);
        Arc::new(AsyncMutex::new(FrameWriter::new(
            Box::new(ours) as Box<dyn AsyncWrite + Send + Unpin>
        )))
    }

    pub(crate) fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_register_and_snapshot_order() {
        let mut registry = ConnectionRegistry::new();
        registry.register(addr(9002), test_writer());
        registry.register(addr(9001), test_writer());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].addr, addr(9001));
        assert_eq!(snapshot[1].addr, addr(9002));
    }

    #[test]
    fn test_register_replaces_same_address() {
        let mut registry = ConnectionRegistry::new();
        let (first, replaced) = registry.register(addr(9001), test_writer());
        assert!(replaced.is_none());

        let (second, replaced) = registry.register(addr(9001), test_writer());
        assert_eq!(replaced.map(|s| s.id), Some(first));
        assert_ne!(first, second);
        assert_eq!(registry.live_count(), 1);

        // A late teardown of the first session must not remove the second
        assert!(registry.unregister_session(addr(9001), first).is_none());
        assert!(registry.contains(addr(9001), second));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        registry.register(addr(9001), test_writer());

        assert!(registry.unregister(addr(9001)).is_some());
        assert!(registry.unregister(addr(9001)).is_none());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_quorum_tracks_live_sessions() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.quorum_reached());

        let (a, _) = registry.register(addr(9001), test_writer());
        let (b, _) = registry.register(addr(9002), test_writer());
        registry.register(addr(9003), test_writer());

        assert!(registry.mark_responded(addr(9001), a));
        assert!(registry.mark_responded(addr(9002), b));
        assert_eq!(registry.responded_count(), 2);
        assert!(!registry.quorum_reached());

        registry.unregister(addr(9003));
        assert!(registry.quorum_reached());

        registry.clear_responded();
        assert_eq!(registry.responded_count(), 0);
        assert!(!registry.quorum_reached());
    }

    #[test]
    fn test_mark_responded_ignores_replaced_session() {
        let mut registry = ConnectionRegistry::new();
        let (old, _) = registry.register(addr(9001), test_writer());
        registry.register(addr(9001), test_writer());

        assert!(!registry.mark_responded(addr(9001), old));
        assert_eq!(registry.responded_count(), 0);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = ConnectionRegistry::new();
        registry.register(addr(9001), test_writer());
        registry.register(addr(9002), test_writer());

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.live_count(), 0);
        assert!(registry.addresses().is_empty());
    }
}
