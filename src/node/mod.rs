//! Root and relay nodes
//!
//! Both roles share the same round machinery: a registry of child sessions,
//! an aggregator for the open round, a scheduler that closes rounds, and a
//! broadcaster for fan-out. Relays add an upstream link to their parent.

pub mod aggregator;
pub mod broadcaster;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod upstream;

pub use aggregator::{RoundAggregator, RoundCapture, SubmitOutcome};
pub use broadcaster::{BroadcastReport, Broadcaster};
pub use registry::{ConnectionRegistry, SessionId};
pub use scheduler::{ClosedBy, RoundScheduler, RoundSummary, ScheduleState, TickOutcome};
pub use server::{start_relay, start_root, NodeHandle};
pub use state::{NodeRole, NodeStatus};
pub use upstream::UpstreamRelay;

use tokio::sync::watch;

/// Resolve once the shutdown flag is set or its sender is gone
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
