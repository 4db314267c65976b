//! Connection dispatcher
//!
//! Classifies each call, picks the keep-alive agent for its scheme, host and
//! class, and runs single HTTP attempts under the retry orchestrator. Three
//! timeouts guard an attempt:
//!
//! - connection: `connect_timeout` on the agent's client
//! - socket: the wait for response headers and every body read
//! - request: the whole attempt
//!
//! When a timeout fires the attempt future is dropped, which closes its socket.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::classify::{classify_transport, error_for_status};
use super::operation::{ClassificationRules, OperationClass, OperationClassifier};
use super::pool::{AgentKey, AgentPool, PoolConfig};
use super::rate_limit::RateLimitConfig;
use super::retry::{RetryConfig, RetryMetrics, RetryMetricsSnapshot, RetryOrchestrator};
use super::timeout::{with_phase_timeout, TimeoutProfile, TimeoutProfiles};
use super::tls::TlsConfig;
use crate::error::{sanitize_url, BankingContext, Error, ErrorCode, Result, TimeoutPhase};
use crate::logging::redaction::redact_ofx;

/// One entry of the request header list, applied in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeaderSpec {
    Static { name: String, value: String },
    /// Byte length of the payload
    ContentLength,
    /// Host (and non-default port) of the target URL
    Host,
}

impl HeaderSpec {
    pub fn fixed(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderSpec::Static {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Headers OFX servers expect
pub fn default_headers() -> Vec<HeaderSpec> {
    vec![
        HeaderSpec::Host,
        HeaderSpec::fixed("Content-Type", "application/x-ofx"),
        HeaderSpec::fixed("Accept", "*/*, application/x-ofx"),
        HeaderSpec::ContentLength,
        HeaderSpec::fixed("Connection", "keep-alive"),
    ]
}

/// Everything the dispatcher, pool and orchestrator need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub pool: PoolConfig,
    pub tls: TlsConfig,
    pub timeouts: TimeoutProfiles,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub classification: ClassificationRules,
    pub headers: Vec<HeaderSpec>,
    /// Larger bodies fail with `RESPONSE_TOO_LARGE`
    pub max_response_bytes: usize,
    /// Samples kept for the rolling average response time
    pub metrics_window: usize,
    /// Log pool and retry metrics at this period
    pub metrics_interval: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            tls: TlsConfig::default(),
            timeouts: TimeoutProfiles::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            classification: ClassificationRules::default(),
            headers: default_headers(),
            max_response_bytes: 32 * 1024 * 1024,
            metrics_window: 100,
            metrics_interval: None,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.tls.validate()?;
        self.timeouts.validate()?;
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.classification.validate()?;
        if self.max_response_bytes == 0 {
            return Err(Error::configuration("max_response_bytes cannot be zero"));
        }
        if self.metrics_window == 0 {
            return Err(Error::configuration("metrics_window must be at least 1"));
        }
        if matches!(self.metrics_interval, Some(interval) if interval.is_zero()) {
            return Err(Error::configuration("metrics_interval cannot be zero"));
        }
        for spec in &self.headers {
            if let HeaderSpec::Static { name, value } = spec {
                header_pair(name, value)?;
            }
        }
        Ok(())
    }
}

/// A call to dispatch
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub url: String,
    pub payload: String,
    pub context: BankingContext,
    pub ofx_version: Option<String>,
    pub request_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(url: impl Into<String>, payload: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            context: BankingContext::new().with_url(&url),
            url,
            payload: payload.into(),
            ofx_version: None,
            request_id: None,
        }
    }

    pub fn with_context(mut self, context: BankingContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_ofx_version(mut self, version: impl Into<String>) -> Self {
        self.ofx_version = Some(version.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// A successful (HTTP 200) response
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: u16,
    pub body: String,
    pub class: OperationClass,
    /// Attempt number that succeeded
    pub attempt: u32,
    /// Duration of the successful attempt
    pub elapsed: Duration,
}

/// Dispatch counters
#[derive(Debug)]
pub struct DispatchMetrics {
    total_requests: AtomicU64,
    active_connections: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    response_times: Mutex<VecDeque<Duration>>,
    window: usize,
}

impl DispatchMetrics {
    fn new(window: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            response_times: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(1),
        }
    }

    fn record_response_time(&self, elapsed: Duration) {
        let mut samples = self
            .response_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    fn record_error(&self, error: &Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if error.code().is_timeout() {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        let (samples, average_response_ms) = {
            let times = self
                .response_times
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let total: Duration = times.iter().sum();
            let average = if times.is_empty() {
                0.0
            } else {
                total.as_secs_f64() * 1000.0 / times.len() as f64
            };
            (times.len(), average)
        };

        DispatchMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_response_ms,
            samples,
        }
    }
}

/// Point-in-time dispatch metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchMetricsSnapshot {
    pub total_requests: u64,
    pub active_connections: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Rolling average over the last `metrics_window` responses
    pub average_response_ms: f64,
    pub samples: usize,
}

/// Counts an attempt as an active connection until dropped
struct ActiveConnection<'a>(&'a DispatchMetrics);

impl<'a> ActiveConnection<'a> {
    fn open(metrics: &'a DispatchMetrics) -> Self {
        metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(metrics)
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

struct RawResponse {
    status: u16,
    retry_after: Option<u64>,
    body: String,
}

/// Shared dispatcher handle
///
/// Create one per process (or per institution set) and share it; agents,
/// host state and metrics live as long as the dispatcher.
#[derive(Debug)]
pub struct ConnectionDispatcher {
    config: DispatcherConfig,
    classifier: OperationClassifier,
    pool: AgentPool,
    orchestrator: RetryOrchestrator,
    metrics: Arc<DispatchMetrics>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionDispatcher {
    /// Validate `config` and build a dispatcher
    ///
    /// When `metrics_interval` is set and a Tokio runtime is running, a task
    /// logging metrics at that period is spawned.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let classifier = OperationClassifier::new(config.classification.clone())?;
        let pool = AgentPool::new(config.pool.clone(), config.tls.clone(), config.timeouts);
        let orchestrator = RetryOrchestrator::new(config.retry.clone(), config.rate_limit.clone());
        let metrics = Arc::new(DispatchMetrics::new(config.metrics_window));

        let reporter = match (config.metrics_interval, Handle::try_current()) {
            (Some(period), Ok(handle)) => Some(handle.spawn(report_metrics(
                period,
                Arc::clone(&metrics),
                orchestrator.metrics_handle(),
            ))),
            (Some(_), Err(_)) => {
                warn!("metrics_interval set outside a Tokio runtime, periodic reporting disabled");
                None
            }
            (None, _) => None,
        };

        Ok(Self {
            config,
            classifier,
            pool,
            orchestrator,
            metrics,
            reporter: Mutex::new(reporter),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Operation class a call would get
    pub fn classify(&self, url: &str, payload: &str) -> OperationClass {
        self.classifier.classify(url, payload)
    }

    /// Send a request, retrying per its operation class
    ///
    /// Only HTTP 200 counts as success. The returned error carries the
    /// request's banking context.
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse> {
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let result = self.dispatch_inner(request, &request_id).await;
        result.map_err(|e| {
            e.with_banking_context(request.context.clone()).with_request_meta(
                Some(request_id.clone()),
                Some(self.config.pool.user_agent.clone()),
                request.ofx_version.clone(),
            )
        })
    }

    async fn dispatch_inner(
        &self,
        request: &DispatchRequest,
        request_id: &str,
    ) -> Result<DispatchResponse> {
        let url = Url::parse(&request.url)
            .map_err(|e| Error::configuration(format!("invalid OFX URL: {}", e)))?;
        let class = self.classifier.classify(url.as_str(), &request.payload);
        let key = AgentKey::from_url(&url, class)?;

        debug!(
            request_id,
            url = %sanitize_url(&request.url),
            class = %class,
            bytes = request.payload.len(),
            "dispatching OFX request"
        );
        trace!(request_id, payload = %redact_ofx(&request.payload), "request payload");

        let url = &url;
        self.orchestrator
            .execute(&key.host, class, move |attempt| {
                self.attempt(url, request, class, attempt)
            })
            .await
    }

    /// Exactly one HTTP attempt
    async fn attempt(
        &self,
        url: &Url,
        request: &DispatchRequest,
        class: OperationClass,
        attempt: u32,
    ) -> Result<DispatchResponse> {
        let started = Instant::now();
        let (agent, hit) = self.pool.agent_for(url, class)?;
        let counter = if hit {
            &self.metrics.pool_hits
        } else {
            &self.metrics.pool_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let _socket = agent.acquire_socket().await?;
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveConnection::open(&self.metrics);

        let profile = *self.config.timeouts.for_class(class);
        let headers = self.build_headers(url, &request.payload)?;
        debug!(attempt, class = %class, agent = %agent.key(), "sending attempt");

        let outcome = with_phase_timeout(
            TimeoutPhase::Request,
            profile.request,
            self.send(agent.client(), url, headers, &request.payload, &profile),
        )
        .await;

        let raw = match outcome {
            Ok(raw) => raw,
            Err(error) => {
                self.metrics.record_error(&error);
                return Err(error);
            }
        };

        let elapsed = started.elapsed();
        self.metrics.record_response_time(elapsed);

        if raw.status != 200 {
            let error = error_for_status(raw.status, &raw.body, raw.retry_after);
            self.metrics.record_error(&error);
            return Err(error);
        }

        debug!(attempt, status = raw.status, elapsed_ms = elapsed.as_millis() as u64, "attempt succeeded");
        Ok(DispatchResponse {
            status: raw.status,
            body: raw.body,
            class,
            attempt,
            elapsed,
        })
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        url: &Url,
        headers: HeaderMap,
        payload: &str,
        profile: &TimeoutProfile,
    ) -> Result<RawResponse> {
        let pending = client
            .post(url.clone())
            .headers(headers)
            .body(payload.to_owned())
            .send();

        let response = match tokio::time::timeout(header_wait(profile), pending).await {
            Err(_) => return Err(Error::timeout(TimeoutPhase::Socket, profile.socket)),
            Ok(Err(err)) => return Err(connect_phase(classify_transport(err), profile)),
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = read_body(response, profile.socket, self.config.max_response_bytes).await?;

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }

    /// Build headers from the configured list
    pub fn build_headers(&self, url: &Url, payload: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(self.config.headers.len());
        for spec in &self.config.headers {
            match spec {
                HeaderSpec::Static { name, value } => {
                    let (name, value) = header_pair(name, value)?;
                    headers.insert(name, value);
                }
                HeaderSpec::ContentLength => {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(payload.len()));
                }
                HeaderSpec::Host => {
                    headers.insert(HOST, host_header(url)?);
                }
            }
        }
        Ok(headers)
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn retry_metrics(&self) -> RetryMetricsSnapshot {
        self.orchestrator.metrics()
    }

    pub fn agent_count(&self) -> usize {
        self.pool.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.orchestrator.is_destroyed()
    }

    /// Stop metrics reporting, close all agents and discard host state
    ///
    /// In-flight attempts are not drained; pending retry delays and
    /// rate-limit waits fail with `CANCELLED`.
    pub fn destroy(&self) {
        self.stop_reporter();
        self.orchestrator.destroy();
        self.pool.destroy();
        info!("connection dispatcher destroyed");
    }

    fn stop_reporter(&self) {
        let handle = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for ConnectionDispatcher {
    fn drop(&mut self) {
        self.stop_reporter();
    }
}

/// Budget for the response head
///
/// `send` also covers connection setup, which reqwest bounds with
/// `connect_timeout`, so the socket idle window starts after it.
fn header_wait(profile: &TimeoutProfile) -> Duration {
    profile.connection.saturating_add(profile.socket)
}

/// Report reqwest's connect timeout with the profile's connection budget
fn connect_phase(error: Error, profile: &TimeoutProfile) -> Error {
    if error.code() != ErrorCode::ConnectionTimeout {
        return error;
    }
    Error::timeout(TimeoutPhase::Connection, profile.connection).with_original_error(error.message())
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::configuration(format!("invalid header name '{}'", name)))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| Error::configuration(format!("invalid value for header '{}'", name)))?;
    Ok((header_name, header_value))
}

fn host_header(url: &Url) -> Result<HeaderValue> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::configuration("OFX URL has no host"))?;
    let value = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).map_err(|_| Error::configuration("invalid Host header"))
}

/// Read the body chunk by chunk, each read bounded by the socket timeout
async fn read_body(
    mut response: reqwest::Response,
    socket_timeout: Duration,
    max_bytes: usize,
) -> Result<String> {
    let mut body = Vec::new();
    loop {
        let chunk = match tokio::time::timeout(socket_timeout, response.chunk()).await {
            Err(_) => return Err(Error::timeout(TimeoutPhase::Socket, socket_timeout)),
            Ok(Err(err)) => return Err(classify_transport(err)),
            Ok(Ok(None)) => break,
            Ok(Ok(Some(chunk))) => chunk,
        };
        if body.len() + chunk.len() > max_bytes {
            return Err(Error::new(
                ErrorCode::ResponseTooLarge,
                format!("response exceeds {} bytes", max_bytes),
            ));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

async fn report_metrics(
    period: Duration,
    dispatch: Arc<DispatchMetrics>,
    retry: Arc<RetryMetrics>,
) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let pool = dispatch.snapshot();
        let retries = retry.snapshot();
        info!(
            total_requests = pool.total_requests,
            active_connections = pool.active_connections,
            pool_hits = pool.pool_hits,
            pool_misses = pool.pool_misses,
            errors = pool.errors,
            timeouts = pool.timeouts,
            average_response_ms = pool.average_response_ms,
            retry_attempts = retries.total_attempts,
            retries_scheduled = retries.retries_scheduled,
            retry_success_rate = retries.success_rate,
            "connection pool metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(config: DispatcherConfig) -> ConnectionDispatcher {
        ConnectionDispatcher::new(config).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(DispatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let config = DispatcherConfig {
            headers: vec![HeaderSpec::fixed("Bad Header", "x")],
            ..Default::default()
        };
        assert!(ConnectionDispatcher::new(config).is_err());
    }

    #[test]
    fn test_connect_stall_reported_as_connection_timeout() {
        let profile = TimeoutProfile {
            connection: Duration::from_secs(5),
            request: Duration::from_secs(30),
            socket: Duration::from_secs(1),
            idle: Duration::from_secs(60),
        };
        // head budget outlasts reqwest's connect timeout
        assert!(header_wait(&profile) > profile.connection);
        assert_eq!(header_wait(&profile), Duration::from_secs(6));

        let stalled = Error::new(ErrorCode::ConnectionTimeout, "operation timed out");
        let error = connect_phase(stalled, &profile);
        assert_eq!(error.code(), ErrorCode::ConnectionTimeout);
        assert_eq!(error.technical_details().timeout_phase, Some(TimeoutPhase::Connection));
        assert_eq!(error.technical_details().timeout_ms, Some(5000));

        let refused = Error::new(ErrorCode::ConnectionRefused, "refused");
        assert_eq!(connect_phase(refused, &profile).code(), ErrorCode::ConnectionRefused);
    }

    #[test]
    fn test_build_headers() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let url = Url::parse("https://ofx.bank.example:8443/ofx").unwrap();
        let headers = dispatcher.build_headers(&url, "<OFX></OFX>").unwrap();

        assert_eq!(headers.get(HOST).unwrap(), "ofx.bank.example:8443");
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "11");
        assert_eq!(headers.get("content-type").unwrap(), "application/x-ofx");
        assert_eq!(headers.len(), default_headers().len());
    }

    #[test]
    fn test_host_header_omits_default_port() {
        let url = Url::parse("https://ofx.bank.example:443/ofx").unwrap();
        assert_eq!(host_header(&url).unwrap(), "ofx.bank.example");
    }

    #[test]
    fn test_rolling_average_window() {
        let metrics = DispatchMetrics::new(2);
        metrics.record_response_time(Duration::from_millis(100));
        metrics.record_response_time(Duration::from_millis(200));
        metrics.record_response_time(Duration::from_millis(400));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.samples, 2);
        assert!((snapshot.average_response_ms - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_timeouts_counted_as_errors() {
        let metrics = DispatchMetrics::new(10);
        metrics.record_error(&Error::timeout(TimeoutPhase::Socket, Duration::from_secs(1)));
        metrics.record_error(&Error::new(ErrorCode::ServerError, "boom"));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.timeouts, 1);
    }

    #[tokio::test]
    async fn test_destroyed_dispatcher_rejects_calls() {
        let dispatcher = dispatcher(DispatcherConfig {
            metrics_interval: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        dispatcher.destroy();
        assert!(dispatcher.is_destroyed());

        let err = dispatcher
            .dispatch(&DispatchRequest::new("https://ofx.bank.example/ofx", "<OFX></OFX>"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert_eq!(err.banking_context().url(), Some("https://ofx.bank.example/ofx"));
        assert!(err.technical_details().request_id.is_some());
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let err = dispatcher
            .dispatch(&DispatchRequest::new("not a url", "<OFX></OFX>"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }
}
