//! Protocol message definitions
//!
//! Every frame carries exactly one message, serialized as JSON with a
//! `type` discriminator.

use serde::{Deserialize, Serialize};

use crate::types::{GlobalState, ParamVector, RoundToken};

/// All protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Parent → Child ─────────────────────────────────────────
    /// Current global state, sent once right after accept
    Hello {
        global_value: ParamVector,
        token: RoundToken,
    },

    /// New global state after a round closed
    Broadcast {
        global_value: ParamVector,
        token: RoundToken,
    },

    // ─── Child → Parent ─────────────────────────────────────────
    /// Weighted contribution for the round identified by `token`
    Update {
        token: RoundToken,
        value: ParamVector,
        weight: f64,
    },

    /// Graceful disconnect
    Close,
}

impl Message {
    pub fn hello(state: &GlobalState) -> Self {
        Message::Hello {
            global_value: state.value.clone(),
            token: state.token,
        }
    }

    pub fn broadcast(state: &GlobalState) -> Self {
        Message::Broadcast {
            global_value: state.value.clone(),
            token: state.token,
        }
    }

    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Broadcast { .. } => "BROADCAST",
            Message::Update { .. } => "UPDATE",
            Message::Close => "CLOSE",
        }
    }

    /// Global state carried by `Hello` and `Broadcast`
    pub fn into_global_state(self) -> Option<GlobalState> {
        match self {
            Message::Hello { global_value, token } | Message::Broadcast { global_value, token } => {
                Some(GlobalState::new(global_value, token))
            }
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
