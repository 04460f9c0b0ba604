//! Health state machine
//!
//! ```text
//! Starting  --(success_threshold consecutive successes)--> Healthy
//! Healthy   --(failure_threshold consecutive non-successes)--> Unhealthy
//! Unhealthy --(success_threshold consecutive successes)--> Healthy
//! ```
//!
//! Non-successes while `Starting` keep the service `Starting`; how long a
//! caller is willing to wait for it is the startup deadline's business.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::probe::Outcome;
use crate::config::HealthCheckSpec;

/// Health of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        *self == HealthState::Healthy
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What applying one outcome did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The outcome belongs to a generation at or before the applied one
    Stale,
    /// Counters moved, state did not
    Unchanged(HealthState),
    /// State changed
    Transition { from: HealthState, to: HealthState },
}

/// Published view of a monitored service
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    /// Generation of the last applied probe outcome, 0 before any
    pub generation: u64,
    pub last_outcome: Option<Outcome>,
    pub changed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn starting() -> Self {
        Self {
            state: HealthState::Starting,
            generation: 0,
            last_outcome: None,
            changed_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            ..Self::starting()
        }
    }
}

/// Threshold counters for one service
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    success_threshold: u32,
    failure_threshold: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
    applied_generation: u64,
}

impl HealthTracker {
    /// Thresholds below 1 are raised to 1
    pub fn new(success_threshold: u32, failure_threshold: u32) -> Self {
        Self {
            state: HealthState::Starting,
            success_threshold: success_threshold.max(1),
            failure_threshold: failure_threshold.max(1),
            consecutive_successes: 0,
            consecutive_failures: 0,
            applied_generation: 0,
        }
    }

    pub fn from_spec(spec: &HealthCheckSpec) -> Self {
        Self::new(spec.success_threshold, spec.failure_threshold())
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn applied_generation(&self) -> u64 {
        self.applied_generation
    }

    /// Apply the outcome of probe `generation`.
    ///
    /// Generations must increase; an outcome that is not newer than the last
    /// applied one is discarded.
    pub fn observe(&mut self, generation: u64, outcome: &Outcome) -> Observation {
        if generation <= self.applied_generation {
            return Observation::Stale;
        }
        self.applied_generation = generation;

        let from = self.state;
        if outcome.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if from != HealthState::Healthy && self.consecutive_successes >= self.success_threshold
            {
                self.state = HealthState::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if from == HealthState::Healthy && self.consecutive_failures >= self.failure_threshold {
                self.state = HealthState::Unhealthy;
            }
        }

        if self.state == from {
            Observation::Unchanged(from)
        } else {
            Observation::Transition {
                from,
                to: self.state,
            }
        }
    }
}
