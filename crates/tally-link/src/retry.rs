//! Retry policy for upstream failures.
//!
//! Three failure classes, three behaviors: rate-limited calls back off
//! exponentially (minutes-scale ceiling, three attempts), not-ready calls
//! follow a fixed escalating schedule (five attempts), fatal errors surface
//! immediately.
//!
//! Rate-limit pressure is tracked in one global counter shared by every call
//! site: being limited repeatedly inside a short window raises the starting
//! exponent of the next backoff instead of starting over. The counter decays
//! only on [`RetryPolicy::reset`] (after a successful fetch) or after a long
//! quiet period.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::aggregator::{AggregatorError, FailureKind};
use crate::config::RetryConfig;
use crate::error::LinkError;

struct RateLimitState {
    hits: u32,
    last_hit: Option<Instant>,
}

/// Decides whether and how long to wait before retrying an upstream call.
pub struct RetryPolicy {
    config: RetryConfig,
    state: Mutex<RateLimitState>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RateLimitState {
                hits: 0,
                last_hit: None,
            }),
        }
    }

    /// Classification is pure: the same error always yields the same class.
    pub fn classify(err: &AggregatorError) -> FailureKind {
        err.kind
    }

    /// Backoff before rate-limited retry number `attempt` (1-based).
    ///
    /// Read-only: calling this twice for the same attempt yields the same
    /// delay. The global hit counter only moves in [`Self::note_rate_limited`].
    pub fn rate_limit_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.config.rate_limit_max_attempts {
            return None;
        }
        let hits = self.state.lock().hits;
        let exponent = attempt
            .saturating_sub(1)
            .saturating_add(hits.saturating_sub(1))
            .min(16);
        let delay = self
            .config
            .rate_limit_base
            .saturating_mul(2u32.saturating_pow(exponent));
        Some(delay.min(self.config.rate_limit_ceiling))
    }

    /// Delay before not-ready retry number `attempt` (1-based), `None` once
    /// the schedule is exhausted.
    pub fn not_ready_delay(&self, attempt: u32) -> Option<Duration> {
        self.config
            .not_ready_schedule
            .get(attempt.saturating_sub(1) as usize)
            .copied()
    }

    /// Record one rate-limited failure in the global counter, decaying it
    /// first if the quiet period has elapsed since the previous hit.
    pub fn note_rate_limited(&self) {
        let mut state = self.state.lock();
        if let Some(last) = state.last_hit {
            if last.elapsed() > self.config.rate_limit_quiet_period {
                state.hits = 0;
            }
        }
        state.hits += 1;
        state.last_hit = Some(Instant::now());
        tracing::warn!(hits = state.hits, "upstream rate limit hit");
    }

    /// Clear the global rate-limit counter. Called after a successful fetch.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.hits = 0;
        state.last_hit = None;
    }

    /// Drive `op` to success under this policy.
    ///
    /// `is_complete` guards the not-ready short-circuit: a successful result
    /// it rejects is treated like upstream staging delay and retried on the
    /// not-ready schedule, but the last successful value is returned once
    /// attempts run out. Retrying exists only to wait out staging, not to
    /// demand more data than upstream has.
    pub async fn run<T, F, Fut, C>(&self, mut op: F, is_complete: C) -> Result<T, LinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LinkError>>,
        C: Fn(&T) -> bool,
    {
        let mut rate_attempts = 0u32;
        let mut ready_attempts = 0u32;

        loop {
            match op().await {
                Ok(value) => {
                    if is_complete(&value) {
                        self.reset();
                        return Ok(value);
                    }
                    ready_attempts += 1;
                    match self.not_ready_delay(ready_attempts) {
                        Some(delay) => {
                            tracing::debug!(
                                attempt = ready_attempts,
                                "fetch succeeded but incomplete, waiting out staging delay"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            self.reset();
                            return Ok(value);
                        }
                    }
                }
                Err(LinkError::RateLimited(detail)) => {
                    self.note_rate_limited();
                    rate_attempts += 1;
                    match self.rate_limit_delay(rate_attempts) {
                        Some(delay) => {
                            tracing::warn!(
                                attempt = rate_attempts,
                                delay_secs = delay.as_secs(),
                                "rate limited, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(LinkError::RateLimited(detail)),
                    }
                }
                Err(LinkError::NotReady(detail)) => {
                    ready_attempts += 1;
                    match self.not_ready_delay(ready_attempts) {
                        Some(delay) => {
                            tracing::debug!(
                                attempt = ready_attempts,
                                delay_secs = delay.as_secs(),
                                "data not ready upstream, waiting"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(LinkError::NotReady(detail)),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }
}
