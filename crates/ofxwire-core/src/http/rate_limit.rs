//! Per-host rate limiting
//!
//! Each hostname has a cap on concurrent in-flight requests and a minimum
//! interval between request starts. Callers are delayed until both hold;
//! nothing is queued or rejected.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use super::cancel::CancellationSignal;
use crate::error::{Error, Result};

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum concurrent requests per host
    pub max_concurrent: u32,
    /// Minimum time between two request starts on the same host
    pub min_interval: Duration,
    /// Recheck interval while a host is at its concurrency cap
    pub poll_interval: Duration,
    /// Custom limits per hostname
    pub host_limits: HashMap<String, HostLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            min_interval: Duration::from_millis(250),
            poll_interval: Duration::from_millis(50),
            host_limits: HashMap::new(),
        }
    }
}

/// Host-specific rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLimit {
    pub max_concurrent: u32,
    pub min_interval: Duration,
}

impl RateLimitConfig {
    /// No interval and a generous concurrency cap
    pub fn unrestricted() -> Self {
        Self {
            max_concurrent: u32::MAX,
            min_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_host_limit(mut self, host: impl Into<String>, limit: HostLimit) -> Self {
        self.host_limits.insert(host.into(), limit);
        self
    }

    fn limit_for(&self, host: &str) -> HostLimit {
        self.host_limits.get(host).copied().unwrap_or(HostLimit {
            max_concurrent: self.max_concurrent,
            min_interval: self.min_interval,
        })
    }

    /// Validate the rate limit configuration
    pub fn validate(&self) -> std::result::Result<(), RateLimitError> {
        if self.max_concurrent == 0 {
            return Err(RateLimitError::ConfigError(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(RateLimitError::ConfigError(
                "poll_interval cannot be zero".to_string(),
            ));
        }
        for (host, limit) in &self.host_limits {
            if limit.max_concurrent == 0 {
                return Err(RateLimitError::ConfigError(format!(
                    "max_concurrent for {} must be at least 1",
                    host
                )));
            }
        }
        Ok(())
    }
}

/// Rate limit error types
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded, wait required: {0:?}")]
    WaitRequired(Duration),

    #[error("Rate limit configuration error: {0}")]
    ConfigError(String),
}

impl From<RateLimitError> for Error {
    fn from(err: RateLimitError) -> Self {
        Error::configuration(err.to_string())
    }
}

/// Per-host bookkeeping
#[derive(Debug, Default)]
struct HostState {
    last_request: Option<Instant>,
    in_flight: u32,
}

type HostMap = Arc<Mutex<HashMap<String, HostState>>>;

fn lock(hosts: &HostMap) -> MutexGuard<'_, HashMap<String, HostState>> {
    hosts.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rate limiter keyed by hostname
#[derive(Debug)]
pub struct HostRateLimiter {
    config: RateLimitConfig,
    hosts: HostMap,
}

impl HostRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait needed before a request to `host` may start; zero when under both limits
    pub fn required_wait(&self, host: &str) -> Duration {
        let hosts = lock(&self.hosts);
        match hosts.get(host) {
            Some(state) => self.wait_for(host, state, Instant::now()),
            None => Duration::ZERO,
        }
    }

    fn wait_for(&self, host: &str, state: &HostState, now: Instant) -> Duration {
        let limit = self.config.limit_for(host);
        let concurrency = if state.in_flight >= limit.max_concurrent {
            self.config.poll_interval
        } else {
            Duration::ZERO
        };
        let interval = state
            .last_request
            .map(|last| (last + limit.min_interval).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        concurrency.max(interval)
    }

    /// Take a slot for `host` if both limits allow it right now
    ///
    /// Check and increment happen under one lock.
    pub fn try_acquire(&self, host: &str) -> std::result::Result<HostPermit, RateLimitError> {
        let mut hosts = lock(&self.hosts);
        let now = Instant::now();
        let state = hosts.entry(host.to_string()).or_default();

        let wait = self.wait_for(host, state, now);
        if !wait.is_zero() {
            return Err(RateLimitError::WaitRequired(wait));
        }

        state.in_flight += 1;
        state.last_request = Some(now);
        Ok(HostPermit {
            hosts: Arc::clone(&self.hosts),
            host: host.to_string(),
        })
    }

    /// Wait until a slot for `host` is free, then take it
    pub async fn acquire(&self, host: &str, cancel: &CancellationSignal) -> Result<HostPermit> {
        loop {
            cancel.check()?;
            match self.try_acquire(host) {
                Ok(permit) => return Ok(permit),
                Err(RateLimitError::WaitRequired(wait)) => {
                    debug!(host, wait_ms = wait.as_millis() as u64, "rate limit wait");
                    cancel.sleep(wait).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Requests currently in flight to `host`
    pub fn in_flight(&self, host: &str) -> u32 {
        lock(&self.hosts).get(host).map(|s| s.in_flight).unwrap_or(0)
    }

    /// Number of hosts with state
    pub fn tracked_hosts(&self) -> usize {
        lock(&self.hosts).len()
    }

    /// Discard all host state; outstanding permits become no-ops
    pub fn clear(&self) {
        lock(&self.hosts).clear();
    }
}

/// Held while a request to a host is in flight
#[derive(Debug)]
pub struct HostPermit {
    hosts: HostMap,
    host: String,
}

impl Drop for HostPermit {
    fn drop(&mut self) {
        let mut hosts = lock(&self.hosts);
        if let Some(state) = hosts.get_mut(&self.host) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}
