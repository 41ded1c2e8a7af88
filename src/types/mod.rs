//! Core value types shared by every node role
//!
//! Parameter vectors, round tokens, and the published global state.

mod state;
mod token;
mod vector;

pub use state::*;
pub use token::*;
pub use vector::*;
