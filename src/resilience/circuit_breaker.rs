//! Per-dependency circuit breakers.
//!
//! A breaker opens after `failure_threshold` consecutive counted failures
//! (or immediately on a rate-limit error), rejects calls until the open
//! window elapses, then lets exactly one trial call through. A successful
//! trial closes it; a failed trial reopens it.
//!
//! State is process-local and not durable. The lock is never held across
//! an await, so a plain mutex is enough and `Drop` impls can take it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::{AppError, Result};

/// Observable state of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// One trial call is allowed (or in flight).
    HalfOpen,
}

/// How [`CircuitBreakers::acquire`] admitted a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The breaker was closed.
    Normal,
    /// The call holds the single half-open trial slot.
    Trial,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

impl Default for State {
    fn default() -> Self {
        Self::Closed { failures: 0 }
    }
}

/// Registry of breakers keyed by dependency name.
#[derive(Debug)]
pub struct CircuitBreakers {
    failure_threshold: u32,
    open_for: Duration,
    states: Mutex<HashMap<String, State>>,
}

impl CircuitBreakers {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_for: Duration::from_secs(config.open_seconds),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, State>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission to call `dependency`.
    ///
    /// A [`Admission::Trial`] must be followed by [`record`](Self::record)
    /// or [`release_trial`](Self::release_trial), otherwise the breaker
    /// stays half-open with its slot taken.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CircuitOpen` while the breaker is open or a
    /// half-open trial is already in flight.
    pub fn acquire(&self, dependency: &str) -> Result<Admission> {
        let mut states = self.lock();
        let state = states.entry(dependency.to_owned()).or_default();
        match *state {
            State::Closed { .. } => Ok(Admission::Normal),
            State::Open { until } if Instant::now() >= until => {
                info!(dependency, "circuit breaker half-open, allowing trial call");
                *state = State::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(Admission::Trial)
            }
            State::HalfOpen {
                trial_in_flight: false,
            } => {
                *state = State::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(Admission::Trial)
            }
            State::Open { .. } | State::HalfOpen { .. } => Err(AppError::CircuitOpen(format!(
                "{dependency} circuit is open"
            ))),
        }
    }

    /// Record the outcome of a call admitted by [`acquire`](Self::acquire).
    ///
    /// Permanent and configuration errors mean the dependency answered, so
    /// they count as success for the breaker.
    pub fn record(&self, dependency: &str, outcome: std::result::Result<(), &AppError>) {
        let mut states = self.lock();
        let state = states.entry(dependency.to_owned()).or_default();
        let counted = match outcome {
            Ok(()) => None,
            Err(err @ (AppError::Transient(_) | AppError::RateLimited(_))) => Some(err),
            Err(AppError::Cancelled(_) | AppError::CircuitOpen(_)) => {
                free_trial(state);
                return;
            }
            Err(_) => None,
        };

        match counted {
            None => {
                if !matches!(state, State::Closed { failures: 0 }) {
                    info!(dependency, "circuit breaker closed");
                }
                *state = State::Closed { failures: 0 };
            }
            Some(err) => {
                let failures = match *state {
                    State::Closed { failures } => failures + 1,
                    State::HalfOpen { .. } | State::Open { .. } => self.failure_threshold,
                };
                if failures >= self.failure_threshold || matches!(err, AppError::RateLimited(_)) {
                    warn!(dependency, failures, %err, "circuit breaker opened");
                    *state = State::Open {
                        until: Instant::now() + self.open_for,
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
        }
    }

    /// Give back a trial slot whose call ended without an outcome.
    pub fn release_trial(&self, dependency: &str) {
        let mut states = self.lock();
        if let Some(state) = states.get_mut(dependency) {
            if free_trial(state) {
                info!(dependency, "abandoned trial call released");
            }
        }
    }

    /// Force a breaker closed.
    pub fn reset(&self, dependency: &str) {
        let mut states = self.lock();
        states.insert(dependency.to_owned(), State::default());
        info!(dependency, "circuit breaker reset");
    }

    /// Current state of a breaker; unknown dependencies are closed.
    #[must_use]
    pub fn status(&self, dependency: &str) -> BreakerStatus {
        let states = self.lock();
        match states.get(dependency).copied().unwrap_or_default() {
            State::Closed { .. } => BreakerStatus::Closed,
            State::Open { until } if Instant::now() >= until => BreakerStatus::HalfOpen,
            State::Open { .. } => BreakerStatus::Open,
            State::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    /// Consecutive counted failures of a closed breaker.
    #[must_use]
    pub fn failure_count(&self, dependency: &str) -> u32 {
        let states = self.lock();
        match states.get(dependency) {
            Some(State::Closed { failures }) => *failures,
            Some(_) => self.failure_threshold,
            None => 0,
        }
    }
}

fn free_trial(state: &mut State) -> bool {
    if let State::HalfOpen {
        trial_in_flight: true,
    } = state
    {
        *state = State::HalfOpen {
            trial_in_flight: false,
        };
        return true;
    }
    false
}
