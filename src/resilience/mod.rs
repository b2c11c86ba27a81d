//! Guards around every external collaborator call.
//!
//! [`CallGuard`] combines the dependency's circuit breaker, the single
//! process-wide concurrency semaphore and the retry policy. Construct one
//! at startup and clone it into every component that calls out.

pub mod circuit_breaker;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::GlobalConfig;
use crate::{AppError, Result};

pub use self::circuit_breaker::{Admission, BreakerStatus, CircuitBreakers};
pub use self::retry::RetryPolicy;

/// Breaker + global semaphore + retry around one collaborator call.
#[derive(Clone)]
pub struct CallGuard {
    breakers: Arc<CircuitBreakers>,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl CallGuard {
    /// Assemble a guard from shared parts.
    #[must_use]
    pub fn new(breakers: Arc<CircuitBreakers>, limiter: Arc<Semaphore>, retry: RetryPolicy) -> Self {
        Self {
            breakers,
            limiter,
            retry,
        }
    }

    /// Build fresh breakers, semaphore and retry policy from config.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            Arc::new(CircuitBreakers::new(&config.circuit_breaker)),
            Arc::new(Semaphore::new(config.concurrency.global_limit)),
            RetryPolicy::from_config(&config.retry),
        )
    }

    /// Shared breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Shared global concurrency limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<Semaphore> {
        &self.limiter
    }

    /// Run `call` against `dependency`.
    ///
    /// Each attempt first passes the breaker, then holds one global permit
    /// for the duration of the call. Transient failures are retried with
    /// backoff; `skip_delays` retries immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CircuitOpen` when the breaker rejects the call,
    /// `AppError::Cancelled` if the limiter was closed, or the last error
    /// returned by `call`.
    pub async fn call<T, F, Fut>(&self, dependency: &str, skip_delays: bool, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let mut pending = PendingOutcome::new(
                &self.breakers,
                dependency,
                self.breakers.acquire(dependency)?,
            );
            let outcome = {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| AppError::Cancelled("concurrency limiter closed".into()))?;
                call().await
            };

            match outcome {
                Ok(value) => {
                    pending.record(Ok(()));
                    return Ok(value);
                }
                Err(err) => {
                    pending.record(Err(&err));
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(dependency, attempt, ?delay, %err, "retrying transient failure");
                    if !skip_delays {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// One admitted attempt awaiting its outcome. Dropping it unrecorded, when
/// the caller's future is cancelled or the limiter is closed, gives a
/// half-open trial slot back to the breaker.
struct PendingOutcome<'a> {
    breakers: &'a CircuitBreakers,
    dependency: &'a str,
    admission: Option<Admission>,
}

impl<'a> PendingOutcome<'a> {
    fn new(breakers: &'a CircuitBreakers, dependency: &'a str, admission: Admission) -> Self {
        Self {
            breakers,
            dependency,
            admission: Some(admission),
        }
    }

    fn record(&mut self, outcome: std::result::Result<(), &AppError>) {
        if self.admission.take().is_some() {
            self.breakers.record(self.dependency, outcome);
        }
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if self.admission.take() == Some(Admission::Trial) {
            self.breakers.release_trial(self.dependency);
        }
    }
}
