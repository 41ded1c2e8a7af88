//! hieravg - hierarchical weighted parameter averaging
//!
//! A tree of participants averages parameter vectors in rounds. Leaves
//! submit weighted updates, relays fold their children's updates into one
//! combined update for their parent, and the root closes each round and
//! broadcasts the new global value together with a fresh round token.

pub mod cli;
pub mod config;
pub mod error;
pub mod leaf;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod types;
pub mod version;

pub use error::{Error, Result};
