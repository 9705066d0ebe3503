//! Retrying fetcher: resend the same request whenever response headers
//! fail to arrive within the attempt timeout.
//!
//! The default policy never gives up on timeouts and never waits between
//! attempts. Any other failure ends the fetch immediately.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Request, Response};
use tokio::time::Instant;

use crate::error::{ChatStreamError, CoreResult};
use crate::telemetry::{AttemptOutcome, AttemptTrace, TelemetrySink};

/// Delay between a timed-out attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Backoff {
    /// Retry immediately.
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
        }
    }

    /// Doubling delay starting at `initial`, capped at `max`.
    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max,
        }
    }

    /// Delay to wait after the `attempt`-th (1-based) attempt timed out.
    /// A multiplier that yields a negative or NaN delay means no delay.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.initial.is_zero() || self.max.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        if secs.is_infinite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// How long to wait for response headers before abandoning an attempt.
    pub attempt_timeout: Duration,
    /// `None` retries without limit.
    pub max_attempts: Option<u32>,
    /// `None` retries without limit.
    pub max_elapsed: Option<Duration>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever(Duration::from_millis(1_000))
    }
}

impl RetryPolicy {
    pub fn forever(attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            max_attempts: None,
            max_elapsed: None,
            backoff: Backoff::none(),
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn with_max_elapsed(mut self, d: Duration) -> Self {
        self.max_elapsed = Some(d);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Clone)]
pub struct RetryingFetcher {
    http: Client,
    policy: RetryPolicy,
    sink: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for RetryingFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingFetcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryingFetcher {
    pub fn new(http: Client, policy: RetryPolicy, sink: Arc<dyn TelemetrySink>) -> Self {
        Self { http, policy, sink }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Send `request`, resending an identical copy after every attempt that
    /// times out. Resolves with the first response whose headers arrive,
    /// whatever its status.
    pub async fn fetch(&self, request: Request) -> CoreResult<Response> {
        let started = Instant::now();
        let url = request.url().to_string();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let req = request.try_clone().ok_or_else(|| {
                ChatStreamError::Validation("request body cannot be replayed".into())
            })?;
            // An attempt never outlives the overall budget.
            let attempt_timeout = match self.policy.max_elapsed {
                Some(max_elapsed) => {
                    let left = max_elapsed.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        return Err(ChatStreamError::RetriesExhausted {
                            attempts: attempt - 1,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    left.min(self.policy.attempt_timeout)
                }
                None => self.policy.attempt_timeout,
            };
            let attempt_started = Instant::now();
            let result = tokio::time::timeout(attempt_timeout, self.http.execute(req)).await;
            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;

            match result {
                Ok(Ok(resp)) => {
                    let status = resp.status().as_u16();
                    self.sink.record_attempt(
                        AttemptTrace::new(attempt, &url, AttemptOutcome::Responded { status })
                            .elapsed_ms(elapsed_ms),
                    );
                    return Ok(resp);
                }
                Ok(Err(e)) if !e.is_timeout() => {
                    self.sink.record_attempt(
                        AttemptTrace::new(
                            attempt,
                            &url,
                            AttemptOutcome::Failed {
                                message: e.to_string(),
                            },
                        )
                        .elapsed_ms(elapsed_ms),
                    );
                    return Err(e.into());
                }
                // Our timer or the connect timeout: either way nothing came back in time.
                Ok(Err(_)) | Err(_) => {
                    self.sink.record_attempt(
                        AttemptTrace::new(attempt, &url, AttemptOutcome::TimedOut).elapsed_ms(elapsed_ms),
                    );
                }
            }

            let exhausted = || ChatStreamError::RetriesExhausted {
                attempts: attempt,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            if let Some(max) = self.policy.max_attempts
                && attempt >= max
            {
                return Err(exhausted());
            }
            let delay = self.policy.backoff.delay_after(attempt);
            if let Some(max_elapsed) = self.policy.max_elapsed
                && started.elapsed() + delay >= max_elapsed
            {
                return Err(exhausted());
            }
            if !delay.is_zero() {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
