//! Node state guarded by the single node lock

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{GlobalState, ParamVector, RoundToken};

use super::aggregator::{Round, RoundCapture, SubmitOutcome};
use super::registry::{ConnectionRegistry, SessionId};
use super::scheduler::ScheduleState;

/// Everything that round handling mutates. Never held across I/O.
#[derive(Debug)]
pub struct NodeState {
    pub registry: ConnectionRegistry,
    pub round: Round,
    pub global: Arc<GlobalState>,
    pub schedule: ScheduleState,
}

pub type SharedState = Arc<Mutex<NodeState>>;

/// Position of a node in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Final authority; the only node that mints round tokens
    Root,
    /// Aggregates its children and forwards one combined update to a parent
    Relay,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Root => write!(f, "root"),
            NodeRole::Relay => write!(f, "relay"),
        }
    }
}

pub fn new_shared(state: NodeState) -> SharedState {
    Arc::new(Mutex::new(state))
}

/// Read-only summary for logs, tests and operators
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub token: RoundToken,
    pub total_weight: f64,
    pub contributions: usize,
    pub responded: usize,
    pub live: usize,
    pub sealed: bool,
    pub delay: std::time::Duration,
}

impl NodeState {
    pub fn new(global: GlobalState, schedule: ScheduleState) -> Self {
        let round = Round::open(global.token, global.dimension());
        Self {
            registry: ConnectionRegistry::new(),
            round,
            global: Arc::new(global),
            schedule,
        }
    }

    pub fn apply_update(
        &mut self,
        addr: SocketAddr,
        session: SessionId,
        token: RoundToken,
        value: &ParamVector,
        weight: f64,
    ) -> SubmitOutcome {
        if !self.registry.contains(addr, session) {
            return SubmitOutcome::UnknownSession;
        }
        match self.round.apply(token, value, weight) {
            Ok(total_weight) => {
                self.registry.mark_responded(addr, session);
                SubmitOutcome::Applied {
                    total_weight,
                    responded: self.registry.responded_count(),
                    live: self.registry.live_count(),
                }
            }
            Err(outcome) => outcome,
        }
    }

    /// The only path that clears accumulator state
    pub fn close_round(&mut self) -> RoundCapture {
        let capture = self.round.capture_and_reset();
        self.registry.clear_responded();
        capture
    }

    /// Publish `global` and open a fresh round under its token
    pub fn publish(&mut self, global: GlobalState) -> Arc<GlobalState> {
        self.round = Round::open(global.token, global.dimension());
        self.global = Arc::new(global);
        Arc::clone(&self.global)
    }

    /// Take over a parent's state, discarding whatever was collected locally
    pub fn adopt(&mut self, global: GlobalState) -> Arc<GlobalState> {
        self.registry.clear_responded();
        self.publish(global)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            token: self.round.token(),
            total_weight: self.round.total_weight(),
            contributions: self.round.contributions(),
            responded: self.registry.responded_count(),
            live: self.registry.live_count(),
            sealed: self.round.is_sealed(),
            delay: self.schedule.delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::registry::tests::{addr, test_writer};

    fn state_with_session() -> (NodeState, SocketAddr, SessionId) {
        let mut state = NodeState::new(GlobalState::initial(1), ScheduleState::default());
        let peer = addr(4000);
        let (id, _) = state.registry.register(peer, test_writer());
        (state, peer, id)
    }

    #[test]
    fn test_update_marks_responded() {
        let (mut state, peer, id) = state_with_session();
        let token = state.global.token;

        let outcome = state.apply_update(peer, id, token, &ParamVector::from_vec(vec![2.0]), 3.0);
        assert_eq!(
            outcome,
            SubmitOutcome::Applied {
                total_weight: 3.0,
                responded: 1,
                live: 1
            }
        );
        assert!(state.registry.quorum_reached());
    }

    #[test]
    fn test_replaced_session_is_unknown() {
        let (mut state, peer, old) = state_with_session();
        let token = state.global.token;
        state.registry.register(peer, test_writer());

        let outcome = state.apply_update(peer, old, token, &ParamVector::from_vec(vec![1.0]), 1.0);
        assert_eq!(outcome, SubmitOutcome::UnknownSession);
        assert_eq!(state.status().total_weight, 0.0);
    }

    #[test]
    fn test_close_round_clears_responded() {
        let (mut state, peer, id) = state_with_session();
        let token = state.global.token;
        state.apply_update(peer, id, token, &ParamVector::from_vec(vec![4.0]), 2.0);

        let capture = state.close_round();
        assert_eq!(capture.total_weight, 2.0);
        assert_eq!(state.status().responded, 0);
        assert_eq!(state.status().total_weight, 0.0);
        assert_eq!(state.status().token, token);
    }

    #[test]
    fn test_adopt_resets_round_and_unseals() {
        let (mut state, peer, id) = state_with_session();
        let token = state.global.token;
        state.apply_update(peer, id, token, &ParamVector::from_vec(vec![1.0]), 1.0);
        state.round.seal();

        let next = GlobalState::new(ParamVector::from_vec(vec![9.0]), RoundToken::next_after(token));
        let published = state.adopt(next.clone());

        assert_eq!(*published, next);
        let status = state.status();
        assert_eq!(status.token, next.token);
        assert!(!status.sealed);
        assert_eq!(status.responded, 0);
        assert_eq!(status.total_weight, 0.0);
    }
}
