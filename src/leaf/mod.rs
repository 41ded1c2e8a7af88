//! Leaf participants

mod client;

pub use client::{FixedUpdate, LeafClient, UpdateSource};
