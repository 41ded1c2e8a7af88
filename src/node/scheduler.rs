//! Round scheduler
//!
//! One loop per node. Every tick it checks the open round under the node
//! lock and closes it once every live session has responded or the adaptive
//! delay has elapsed. Closure, averaging, delay adaptation and (on the root)
//! publication of the next token happen in one critical section; only the
//! resulting fan-out or upstream send runs after the lock is released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{GrowthPolicy, ScheduleSettings};
use crate::types::{GlobalState, ParamVector, RoundToken};

use super::aggregator::RoundCapture;
use super::broadcaster::Broadcaster;
use super::state::{NodeRole, NodeState, SharedState};
use super::upstream::UpstreamRelay;
use super::wait_for_shutdown;

// ─────────────────────────────────────────────────────────────────
// Schedule State
// ─────────────────────────────────────────────────────────────────

/// Adaptive round timeout, always within `[min_delay, max_delay]`
#[derive(Debug, Clone)]
pub struct ScheduleState {
    delay: Duration,
    min_delay: Duration,
    max_delay: Duration,
    shrink_factor: f64,
    empty_growth: GrowthPolicy,
    timeout_growth: GrowthPolicy,
    poll_interval: Duration,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self::from_settings(&ScheduleSettings::default())
    }
}

impl ScheduleState {
    pub fn from_settings(settings: &ScheduleSettings) -> Self {
        let min_delay = Duration::from_millis(settings.min_delay_ms);
        let max_delay = Duration::from_millis(settings.max_delay_ms).max(min_delay);
        Self {
            delay: Duration::from_millis(settings.initial_delay_ms).clamp(min_delay, max_delay),
            min_delay,
            max_delay,
            shrink_factor: settings.shrink_factor,
            empty_growth: settings.empty_growth,
            timeout_growth: settings.timeout_growth,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Nothing was collected: back off toward `max_delay`
    pub fn on_empty_round(&mut self) -> Duration {
        self.delay = self.empty_growth.grow(self.delay, self.max_delay);
        self.delay
    }

    /// Everyone answered before the timeout: tighten toward `min_delay`
    pub fn on_quorum(&mut self) -> Duration {
        self.delay = self.delay.mul_f64(self.shrink_factor).max(self.min_delay);
        self.delay
    }

    /// The timeout fired with partial participation: relax toward `max_delay`
    pub fn on_timeout(&mut self) -> Duration {
        self.delay = self.timeout_growth.grow(self.delay, self.max_delay);
        self.delay
    }

    /// Sleep between two scheduler checks
    pub fn poll_tick(&self) -> Duration {
        self.poll_interval
            .min(self.delay / 10)
            .max(Duration::from_millis(1))
    }
}

// ─────────────────────────────────────────────────────────────────
// Round Outcomes
// ─────────────────────────────────────────────────────────────────

/// Why a round was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Quorum,
    Timeout,
}

impl std::fmt::Display for ClosedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClosedBy::Quorum => write!(f, "quorum"),
            ClosedBy::Timeout => write!(f, "timeout"),
        }
    }
}

/// Statistics of one closed, non-empty round
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub token: RoundToken,
    pub contributions: usize,
    pub total_weight: f64,
    pub closed_by: ClosedBy,
    pub elapsed: Duration,
    pub next_delay: Duration,
    pub closed_at: DateTime<Utc>,
}

impl RoundSummary {
    pub fn log(&self, role: NodeRole) {
        info!(
            role = %role,
            token = %self.token.short(),
            contributions = self.contributions,
            weight = self.total_weight,
            closed_by = %self.closed_by,
            elapsed_ms = self.elapsed.as_millis() as u64,
            delay_ms = self.next_delay.as_millis() as u64,
            closed_at = %self.closed_at.to_rfc3339(),
            "Round closed"
        );
    }
}

/// Result of one scheduler check
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Round still open
    Idle,
    /// No live sessions; the round timer was restarted
    Isolated,
    /// Closed without any weight; token kept, delay grown
    Empty { token: RoundToken, next_delay: Duration },
    /// The average was not finite and was thrown away; token kept, delay grown
    Discarded {
        token: RoundToken,
        contributions: usize,
        next_delay: Duration,
    },
    /// Root closed a round and published a new global state
    Published { global: Arc<GlobalState>, summary: RoundSummary },
    /// Relay closed a round; the combined update must go to the parent
    Forward {
        token: RoundToken,
        value: ParamVector,
        weight: f64,
        summary: RoundSummary,
    },
}

// ─────────────────────────────────────────────────────────────────
// Round Scheduler
// ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RoundScheduler {
    state: SharedState,
    role: NodeRole,
}

impl RoundScheduler {
    pub fn new(state: SharedState, role: NodeRole) -> Self {
        Self { state, role }
    }

    /// Check the open round once and close it if due
    pub fn tick(&self) -> TickOutcome {
        let mut st = self.state.lock();
        tick_locked(&mut st, self.role)
    }

    /// Current sleep between checks
    pub fn poll_tick(&self) -> Duration {
        self.state.lock().schedule.poll_tick()
    }

    /// Drive rounds until `shutdown` flips to true
    pub async fn run(
        self,
        broadcaster: Broadcaster,
        upstream: Option<Arc<UpstreamRelay>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(role = %self.role, "Round scheduler started");

        while !*shutdown.borrow() {
            match self.tick() {
                TickOutcome::Published { global, summary } => {
                    summary.log(self.role);
                    tokio::select! {
                        report = broadcaster.broadcast(&global) => debug!(
                            token = %global.token.short(),
                            delivered = report.delivered,
                            failed = report.failed,
                            "Broadcast complete"
                        ),
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
                TickOutcome::Forward { token, value, weight, summary } => {
                    summary.log(self.role);
                    match &upstream {
                        Some(upstream) => tokio::select! {
                            sent = upstream.forward(token, value, weight) => {
                                if let Err(e) = sent {
                                    warn!(token = %token.short(), error = %e, "Failed to forward round to parent");
                                }
                            }
                            _ = wait_for_shutdown(&mut shutdown) => break,
                        },
                        None => warn!(token = %token.short(), "Relay round closed without a parent link"),
                    }
                }
                TickOutcome::Empty { token, next_delay } => {
                    debug!(
                        token = %token.short(),
                        delay_ms = next_delay.as_millis() as u64,
                        "Round closed empty, backing off"
                    );
                }
                TickOutcome::Discarded { token, contributions, next_delay } => {
                    error!(
                        token = %token.short(),
                        contributions = contributions,
                        delay_ms = next_delay.as_millis() as u64,
                        "Round average is not finite, discarding round"
                    );
                }
                TickOutcome::Idle | TickOutcome::Isolated => {}
            }

            let tick = self.poll_tick();
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(role = %self.role, "Round scheduler stopped");
    }
}

fn tick_locked(st: &mut NodeState, role: NodeRole) -> TickOutcome {
    if st.registry.live_count() == 0 {
        st.round.restart_timer();
        return TickOutcome::Isolated;
    }
    if st.round.is_sealed() {
        st.round.restart_timer();
        return TickOutcome::Idle;
    }

    let quorum = st.registry.quorum_reached();
    let timed_out = st.round.elapsed() >= st.schedule.delay();
    if !quorum && !timed_out {
        return TickOutcome::Idle;
    }

    let capture = st.close_round();
    finish_round(st, role, capture, quorum)
}

/// Turn a captured round into the next state (root) or the upstream update (relay)
fn finish_round(st: &mut NodeState, role: NodeRole, capture: RoundCapture, quorum: bool) -> TickOutcome {
    let Some(average) = capture.average() else {
        let next_delay = st.schedule.on_empty_round();
        return TickOutcome::Empty {
            token: capture.token,
            next_delay,
        };
    };

    if !average.is_finite() {
        let next_delay = st.schedule.on_empty_round();
        return TickOutcome::Discarded {
            token: capture.token,
            contributions: capture.contributions,
            next_delay,
        };
    }

    let (closed_by, next_delay) = if quorum {
        (ClosedBy::Quorum, st.schedule.on_quorum())
    } else {
        (ClosedBy::Timeout, st.schedule.on_timeout())
    };
    let summary = RoundSummary {
        token: capture.token,
        contributions: capture.contributions,
        total_weight: capture.total_weight,
        closed_by,
        elapsed: capture.elapsed,
        next_delay,
        closed_at: Utc::now(),
    };

    match role {
        NodeRole::Root => {
            let token = RoundToken::next_after(capture.token);
            let global = st.publish(GlobalState::new(average, token));
            TickOutcome::Published { global, summary }
        }
        NodeRole::Relay => {
            st.round.seal();
            TickOutcome::Forward {
                token: capture.token,
                value: average,
                weight: capture.total_weight,
                summary,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
