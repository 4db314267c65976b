//! HTTP transport for OFX servers
//!
//! This module provides:
//! - Operation classification (quick, standard, heavy)
//! - Per-class timeout profiles
//! - Error classification from status codes, bodies and transport failures
//! - Retry orchestration with backoff, jitter and per-host rate limiting
//! - Keep-alive agent pooling and the connection dispatcher

pub mod cancel;
pub mod classify;
pub mod dispatcher;
pub mod operation;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod timeout;
pub mod tls;

pub use cancel::CancellationSignal;
pub use classify::{classify_status, classify_transport, error_for_status, extract_embedded_status};
pub use dispatcher::{
    default_headers, ConnectionDispatcher, DispatchMetricsSnapshot, DispatchRequest,
    DispatchResponse, DispatcherConfig, HeaderSpec,
};
pub use operation::{ClassificationRules, OperationClass, OperationClassifier};
pub use pool::{AgentKey, AgentPool, PoolConfig, PoolOverrides};
pub use rate_limit::{HostLimit, HostRateLimiter, RateLimitConfig, RateLimitError};
pub use retry::{
    BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryMetricsSnapshot,
    RetryOrchestrator, RetryOverrides, RetryPolicy,
};
pub use timeout::{TimeoutOverrides, TimeoutProfile, TimeoutProfiles};
pub use tls::{TlsConfig, TlsConfigError, TlsVersion};
