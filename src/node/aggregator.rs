//! Round aggregation
//!
//! Folds weighted updates into the open round. All mutation happens under
//! the node lock; only the scheduler captures and resets the accumulator.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::types::{DimensionMismatch, ParamVector, RoundToken};

use super::registry::SessionId;
use super::state::SharedState;

// ─────────────────────────────────────────────────────────────────
// Round
// ─────────────────────────────────────────────────────────────────

/// Accumulator for the round identified by `token`
#[derive(Debug, Clone)]
pub struct Round {
    token: RoundToken,
    running_sum: ParamVector,
    total_weight: f64,
    contributions: usize,
    started_at: Instant,

    /// Relay only: the subtree result for this token has been forwarded and
    /// no more updates are accepted until the parent publishes a new token
    sealed: bool,
}

/// What happened to a submitted update
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Folded into the round
    Applied { total_weight: f64, responded: usize, live: usize },
    /// Token does not match the open round
    Stale { current: RoundToken },
    /// Round already forwarded upstream, waiting for the parent
    Sealed,
    /// Vector length differs from the node's dimension
    ShapeMismatch(DimensionMismatch),
    /// Weight is not a positive finite number, or the vector has non-finite entries
    InvalidWeight,
    /// Folding the update in would push the running sum or weight past `f64::MAX`
    Overflow,
    /// Session was removed before the update could be applied
    UnknownSession,
}

/// Accumulator contents taken at closure
#[derive(Debug, Clone, PartialEq)]
pub struct RoundCapture {
    pub token: RoundToken,
    pub sum: ParamVector,
    pub total_weight: f64,
    pub contributions: usize,
    pub elapsed: Duration,
}

impl RoundCapture {
    /// No weight was collected (empty quorum)
    pub fn is_empty(&self) -> bool {
        self.total_weight <= 0.0
    }

    /// Weighted average `Σ(w·v) / Σw`, `None` for an empty capture
    pub fn average(&self) -> Option<ParamVector> {
        if self.is_empty() {
            None
        } else {
            Some(self.sum.divided_by(self.total_weight))
        }
    }
}

impl Round {
    pub fn open(token: RoundToken, dimension: usize) -> Self {
        Self {
            token,
            running_sum: ParamVector::zeros(dimension),
            total_weight: 0.0,
            contributions: 0,
            started_at: Instant::now(),
            sealed: false,
        }
    }

    pub fn token(&self) -> RoundToken {
        self.token
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn contributions(&self) -> usize {
        self.contributions
    }

    pub fn dimension(&self) -> usize {
        self.running_sum.len()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn restart_timer(&mut self) {
        self.started_at = Instant::now();
    }

    /// Validate an update against this round without touching it
    pub fn check(&self, token: RoundToken, value: &ParamVector, weight: f64) -> Result<(), SubmitOutcome> {
        if token != self.token {
            return Err(SubmitOutcome::Stale { current: self.token });
        }
        if self.sealed {
            return Err(SubmitOutcome::Sealed);
        }
        if value.len() != self.dimension() {
            return Err(SubmitOutcome::ShapeMismatch(DimensionMismatch {
                expected: self.dimension(),
                actual: value.len(),
            }));
        }
        if !(weight.is_finite() && weight > 0.0) || !value.is_finite() {
            return Err(SubmitOutcome::InvalidWeight);
        }
        if !(self.total_weight + weight).is_finite()
            || !self.running_sum.add_scaled_stays_finite(value, weight)
        {
            return Err(SubmitOutcome::Overflow);
        }
        Ok(())
    }

    /// `runningSum += weight * value; totalWeight += weight`
    pub fn apply(&mut self, token: RoundToken, value: &ParamVector, weight: f64) -> Result<f64, SubmitOutcome> {
        self.check(token, value, weight)?;
        self.running_sum
            .add_scaled(value, weight)
            .map_err(SubmitOutcome::ShapeMismatch)?;
        self.total_weight += weight;
        self.contributions += 1;
        Ok(self.total_weight)
    }

    /// Take the accumulator and reset it to zero; the token is kept
    pub fn capture_and_reset(&mut self) -> RoundCapture {
        let dimension = self.dimension();
        let sum = std::mem::replace(&mut self.running_sum, ParamVector::zeros(dimension));
        let capture = RoundCapture {
            token: self.token,
            sum,
            total_weight: self.total_weight,
            contributions: self.contributions,
            elapsed: self.started_at.elapsed(),
        };
        self.total_weight = 0.0;
        self.contributions = 0;
        self.started_at = Instant::now();
        capture
    }
}

// ─────────────────────────────────────────────────────────────────
// Round Aggregator
// ─────────────────────────────────────────────────────────────────

/// Handle for feeding updates into a node's current round
#[derive(Clone)]
pub struct RoundAggregator {
    state: SharedState,
}

impl RoundAggregator {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Apply an update from the session `(addr, session)` if its token matches
    pub fn submit(
        &self,
        addr: SocketAddr,
        session: SessionId,
        token: RoundToken,
        value: &ParamVector,
        weight: f64,
    ) -> SubmitOutcome {
        self.state.lock().apply_update(addr, session, token, value, weight)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
