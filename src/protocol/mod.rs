//! Wire protocol between parents and children
//!
//! Four tagged message kinds carried in length-prefixed JSON frames over TCP.

mod framing;
mod messages;

pub use framing::*;
pub use messages::*;
