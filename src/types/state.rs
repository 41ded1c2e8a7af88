//! Published global state

use serde::{Deserialize, Serialize};

use super::{ParamVector, RoundToken};

/// Result of the most recently closed round, as seen by everyone below
/// the node that published it. Never mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub value: ParamVector,
    pub token: RoundToken,
}

impl GlobalState {
    pub fn new(value: ParamVector, token: RoundToken) -> Self {
        Self { value, token }
    }

    /// Zero vector with a freshly drawn token (root start-up state)
    pub fn initial(dimension: usize) -> Self {
        Self {
            value: ParamVector::zeros(dimension),
            token: RoundToken::generate(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.value.len()
    }
}
