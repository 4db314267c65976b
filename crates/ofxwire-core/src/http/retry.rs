//! Retry orchestration with backoff, jitter and per-host rate limiting
//!
//! A call runs as a loop: wait for the host's rate limit, run one attempt,
//! and on failure either sleep for a backoff delay or give up. Attempt
//! numbers are 1-based; after attempt `n` fails the next delay is computed
//! for retry index `n - 1`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::cancel::CancellationSignal;
use super::operation::OperationClass;
use super::rate_limit::{HostRateLimiter, RateLimitConfig};
use crate::error::{is_non_retryable_ofx_code, Error, FailureKind, Result};

/// How the delay grows between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * 2^retry`
    Exponential,
    /// `base * (retry + 1)`
    Linear,
    /// `base`
    Fixed,
}

/// Randomization applied after the cap
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JitterStrategy {
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay/2 + uniform(0, delay/2)`
    Equal,
    /// Uniform in `[0, min(max, base * 3 * 2^retry)]`
    Decorrelated,
    /// `delay * (1 + uniform(-factor, factor))`
    Factor { factor: f64 },
}

/// Retry budget for one operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Upper bound on attempts made for one call
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub quick: RetryPolicy,
    pub standard: RetryPolicy,
    pub heavy: RetryPolicy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            quick: RetryPolicy::new(4),
            standard: RetryPolicy::new(3),
            heavy: RetryPolicy::new(2),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    pub fn policy_for(&self, class: OperationClass) -> &RetryPolicy {
        match class {
            OperationClass::Quick => &self.quick,
            OperationClass::Standard => &self.standard,
            OperationClass::Heavy => &self.heavy,
        }
    }

    /// Backoff delay for a retry index, capped at `max_delay`, before jitter
    pub fn capped_delay(&self, retry: u32) -> Duration {
        let raw = match self.backoff {
            BackoffStrategy::Exponential => self.base_delay.saturating_mul(2u32.saturating_pow(retry)),
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry.saturating_add(1)),
            BackoffStrategy::Fixed => self.base_delay,
        };
        raw.min(self.max_delay)
    }

    /// Delay for a retry index with jitter applied
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        apply_jitter(
            self.jitter,
            self.capped_delay(retry),
            self.base_delay,
            self.max_delay,
            retry,
            rng,
        )
    }

    /// Validate retry configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(Error::configuration("max_delay must be >= base_delay"));
        }
        if let JitterStrategy::Factor { factor } = self.jitter {
            if !(0.0..=1.0).contains(&factor) {
                return Err(Error::configuration("jitter factor must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

/// Apply a jitter strategy to an already capped delay
pub fn apply_jitter<R: Rng + ?Sized>(
    strategy: JitterStrategy,
    capped: Duration,
    base: Duration,
    max: Duration,
    retry: u32,
    rng: &mut R,
) -> Duration {
    match strategy {
        JitterStrategy::None => capped,
        JitterStrategy::Full => capped.mul_f64(rng.gen::<f64>()),
        JitterStrategy::Equal => {
            let half = capped / 2;
            half + half.mul_f64(rng.gen::<f64>())
        }
        JitterStrategy::Decorrelated => {
            let upper = base
                .saturating_mul(3)
                .saturating_mul(2u32.saturating_pow(retry))
                .min(max);
            upper.mul_f64(rng.gen::<f64>())
        }
        JitterStrategy::Factor { factor } => {
            let factor = factor.clamp(0.0, 1.0);
            let scale = 1.0 + rng.gen_range(-factor..=factor);
            capped.mul_f64(scale.max(0.0)).min(max)
        }
    }
}

/// Partial retry settings merged over a base configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverrides {
    pub quick: Option<u32>,
    pub standard: Option<u32>,
    pub heavy: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff: Option<BackoffStrategy>,
    pub jitter: Option<JitterStrategy>,
}

impl RetryOverrides {
    /// Apply overrides to a base configuration
    pub fn apply_to(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            quick: self.quick.map(RetryPolicy::new).unwrap_or(base.quick),
            standard: self.standard.map(RetryPolicy::new).unwrap_or(base.standard),
            heavy: self.heavy.map(RetryPolicy::new).unwrap_or(base.heavy),
            base_delay: self.base_delay.unwrap_or(base.base_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            backoff: self.backoff.unwrap_or(base.backoff),
            jitter: self.jitter.unwrap_or(base.jitter),
        }
    }
}

/// Decision on whether to retry a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the request after the specified delay
    Retry { delay: Duration },
    /// Do not retry the request
    NoRetry,
}

/// Counters accumulated across calls
#[derive(Debug, Default)]
pub struct RetryMetrics {
    total_attempts: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
    retries_scheduled: AtomicU64,
    total_delay_ms: AtomicU64,
    network_errors: AtomicU64,
    http_errors: AtomicU64,
    ssl_errors: AtomicU64,
    timeout_errors: AtomicU64,
    ofx_errors: AtomicU64,
    other_errors: AtomicU64,
}

impl RetryMetrics {
    fn record_attempt(&self) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &Error) {
        let counter = match error.code().failure_kind() {
            FailureKind::Network => &self.network_errors,
            FailureKind::Http => &self.http_errors,
            FailureKind::Ssl => &self.ssl_errors,
            FailureKind::Timeout => &self.timeout_errors,
            FailureKind::Ofx => &self.ofx_errors,
            FailureKind::Other => &self.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_scheduled(&self, delay: Duration) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        self.total_delay_ms
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// A call that needed retries finished, successfully or not
    fn record_outcome(&self, attempts: u32, success: bool) {
        if attempts <= 1 {
            return;
        }
        if success {
            self.successful_retries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let scheduled = load(&self.retries_scheduled);
        let total_delay_ms = load(&self.total_delay_ms);
        let successful = load(&self.successful_retries);
        let failed = load(&self.failed_retries);

        RetryMetricsSnapshot {
            total_attempts: load(&self.total_attempts),
            successful_retries: successful,
            failed_retries: failed,
            retries_scheduled: scheduled,
            total_delay_ms,
            network_errors: load(&self.network_errors),
            http_errors: load(&self.http_errors),
            ssl_errors: load(&self.ssl_errors),
            timeout_errors: load(&self.timeout_errors),
            ofx_errors: load(&self.ofx_errors),
            other_errors: load(&self.other_errors),
            average_delay_ms: if scheduled == 0 {
                0.0
            } else {
                total_delay_ms as f64 / scheduled as f64
            },
            success_rate: if successful + failed == 0 {
                0.0
            } else {
                successful as f64 / (successful + failed) as f64
            },
        }
    }
}

/// Point-in-time retry metrics
///
/// `success_rate` is the share of calls that needed at least one retry and
/// still succeeded; it is 0 until such a call exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryMetricsSnapshot {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub retries_scheduled: u64,
    pub total_delay_ms: u64,
    pub network_errors: u64,
    pub http_errors: u64,
    pub ssl_errors: u64,
    pub timeout_errors: u64,
    pub ofx_errors: u64,
    pub other_errors: u64,
    pub average_delay_ms: f64,
    pub success_rate: f64,
}

/// Drives attempts for a call until success or a terminal failure
#[derive(Debug)]
pub struct RetryOrchestrator {
    config: RetryConfig,
    limiter: HostRateLimiter,
    metrics: Arc<RetryMetrics>,
    cancel: Arc<CancellationSignal>,
}

impl RetryOrchestrator {
    pub fn new(config: RetryConfig, rate_limit: RateLimitConfig) -> Self {
        Self {
            config,
            limiter: HostRateLimiter::new(rate_limit),
            metrics: Arc::new(RetryMetrics::default()),
            cancel: Arc::new(CancellationSignal::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn limiter(&self) -> &HostRateLimiter {
        &self.limiter
    }

    /// Whether a failure after `attempt` attempts may be retried
    pub fn should_retry(&self, error: &Error, attempt: u32, class: OperationClass) -> bool {
        if attempt >= self.config.policy_for(class).max_retries {
            return false;
        }
        if let Some(code) = error.technical_details().ofx_status {
            if is_non_retryable_ofx_code(code) {
                return false;
            }
        }
        error.is_retryable() && attempt <= error.max_retries()
    }

    /// Decide what to do after attempt `attempt` failed with `error`
    pub fn decide(&self, error: &Error, attempt: u32, class: OperationClass) -> RetryDecision {
        if !self.should_retry(error, attempt, class) {
            return RetryDecision::NoRetry;
        }

        // server hints replace backoff but stay under the same cap
        if let Some(seconds) = error.retry_after() {
            let hint = Duration::from_secs(seconds);
            if hint > self.config.max_delay {
                debug!(
                    retry_after_secs = seconds,
                    max_delay_ms = self.config.max_delay.as_millis() as u64,
                    "retry-after hint clamped to max delay"
                );
            }
            return RetryDecision::Retry {
                delay: hint.min(self.config.max_delay),
            };
        }

        let retry = attempt.saturating_sub(1);
        RetryDecision::Retry {
            delay: self.config.delay_for(retry, &mut rand::thread_rng()),
        }
    }

    /// Run `attempt_fn` until it succeeds or the failure is terminal
    ///
    /// `attempt_fn` receives the 1-based attempt number. Each attempt holds a
    /// rate-limit slot for `host` while it runs.
    pub async fn execute<F, Fut, T>(
        &self,
        host: &str,
        class: OperationClass,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            self.cancel.check()?;
            let permit = self.limiter.acquire(host, &self.cancel).await?;

            attempt += 1;
            self.metrics.record_attempt();
            let outcome = attempt_fn(attempt).await;
            drop(permit);

            let error = match outcome {
                Ok(value) => {
                    self.metrics.record_outcome(attempt, true);
                    return Ok(value);
                }
                Err(error) => error,
            };
            self.metrics.record_failure(&error);

            match self.decide(&error, attempt, class) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        host,
                        attempt,
                        class = %class,
                        delay_ms = delay.as_millis() as u64,
                        code = %error.code(),
                        correlation_id = error.correlation_id(),
                        "attempt failed, retrying"
                    );
                    self.metrics.record_scheduled(delay);
                    if let Err(cancelled) = self.cancel.sleep(delay).await {
                        self.metrics.record_outcome(attempt, false);
                        return Err(cancelled);
                    }
                }
                RetryDecision::NoRetry => {
                    error!(
                        host,
                        attempts = attempt,
                        class = %class,
                        code = %error.code(),
                        category = %error.category(),
                        correlation_id = error.correlation_id(),
                        "request failed, not retrying"
                    );
                    self.metrics.record_outcome(attempt, false);
                    return Err(error);
                }
            }
        }
    }

    pub fn metrics(&self) -> RetryMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_handle(&self) -> Arc<RetryMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel pending waits and discard host state
    pub fn destroy(&self) {
        self.cancel.cancel();
        self.limiter.clear();
    }
}
