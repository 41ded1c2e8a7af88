//! Round tokens
//!
//! A token identifies the round an update was computed against. Only the
//! root mints tokens; relays adopt whatever their parent broadcasts.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, equality-comparable round identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundToken(Uuid);

impl RoundToken {
    /// Draw a fresh random token
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Draw a fresh token guaranteed to differ from `previous`
    pub fn next_after(previous: RoundToken) -> Self {
        loop {
            let token = Self::generate();
            if token != previous {
                return token;
            }
        }
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// First eight hex digits, for log lines
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for RoundToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
