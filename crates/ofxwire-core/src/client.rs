//! High-level client: encode, dispatch, decode
//!
//! [`OfxClient`] wires the request encoder, the connection dispatcher and the
//! response decoder together for one OFX endpoint. Responses can be served
//! from a [`ResponseCache`]; the default [`NoCache`] stores nothing.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::ClientConfig;
use crate::decoder::{Decoder, ParsedResponse};
use crate::encoder::encode_request;
use crate::error::{sanitize_url, BankingContext, Error, Result};
use crate::http::{
    ConnectionDispatcher, DispatchMetricsSnapshot, DispatchRequest, RetryMetricsSnapshot,
};
use crate::logging::redaction::mask_account;
use crate::types::{Operation, OperationType, RequestContext};

/// Cache lookup key
///
/// Parameters never contain credentials; the account id is masked to its
/// last four characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub operation: OperationType,
    pub params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn for_request(ctx: &RequestContext) -> Self {
        let mut params = BTreeMap::new();
        params.insert("fid".to_string(), ctx.fid.clone());
        params.insert("org".to_string(), ctx.org.clone());
        params.insert("version".to_string(), ctx.version.header_value().to_string());

        if let Operation::Statement(range) = ctx.operation {
            params.insert("account".to_string(), mask_account(&ctx.account_id));
            params.insert("account_type".to_string(), ctx.account_type.as_ofx().to_string());
            params.insert("start".to_string(), range.start.format("%Y%m%d").to_string());
            if let Some(end) = range.end {
                params.insert("end".to_string(), end.format("%Y%m%d").to_string());
            }
        }

        Self {
            operation: ctx.operation.kind(),
            params,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        for (key, value) in &self.params {
            write!(f, ":{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Storage for decoded responses
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<ParsedResponse>;
    fn set(&self, key: &CacheKey, response: &ParsedResponse, ttl: Duration);
    fn invalidate(&self, key: &CacheKey);
}

/// Cache that never stores anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ResponseCache for NoCache {
    fn get(&self, _key: &CacheKey) -> Option<ParsedResponse> {
        None
    }

    fn set(&self, _key: &CacheKey, _response: &ParsedResponse, _ttl: Duration) {}

    fn invalidate(&self, _key: &CacheKey) {}
}

/// Client for a single OFX endpoint
pub struct OfxClient {
    url: String,
    config: ClientConfig,
    dispatcher: ConnectionDispatcher,
    decoder: Decoder,
    cache: Arc<dyn ResponseCache>,
}

impl fmt::Debug for OfxClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfxClient")
            .field("url", &sanitize_url(&self.url))
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl OfxClient {
    /// Validate the endpoint and configuration and build the client
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let url = url.into();
        let parsed = Url::parse(&url)
            .map_err(|e| Error::configuration(format!("invalid OFX URL: {}", e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::configuration(format!(
                "OFX URL must use http or https, got '{}'",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(Error::configuration("OFX URL has no host"));
        }
        config.validate()?;

        let dispatcher = ConnectionDispatcher::new(config.dispatcher.clone())?;
        let decoder = Decoder::new(config.decoder.clone());
        info!(url = %sanitize_url(&url), "OFX client ready");

        Ok(Self {
            url,
            config,
            dispatcher,
            decoder,
            cache: Arc::new(NoCache),
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &ConnectionDispatcher {
        &self.dispatcher
    }

    /// Download a statement for the account in `ctx`
    pub async fn get_statement(&self, ctx: &RequestContext) -> Result<ParsedResponse> {
        if !matches!(ctx.operation, Operation::Statement(_)) {
            return Err(Error::configuration(
                "get_statement needs a statement request context",
            ));
        }
        self.execute(ctx).await
    }

    /// List the accounts visible to the credentials in `ctx`
    pub async fn get_accounts(&self, ctx: &RequestContext) -> Result<ParsedResponse> {
        if ctx.operation != Operation::AccountList {
            return Err(Error::configuration(
                "get_accounts needs an account list request context",
            ));
        }
        self.execute(ctx).await
    }

    async fn execute(&self, ctx: &RequestContext) -> Result<ParsedResponse> {
        let key = CacheKey::for_request(ctx);
        if let Some(cached) = self.cache.get(&key) {
            debug!(key = %key, "serving OFX response from cache");
            return Ok(cached);
        }

        let context = self.banking_context(ctx);
        let message = encode_request(ctx).map_err(|e| e.with_banking_context(context.clone()))?;
        let request = DispatchRequest::new(self.url.as_str(), message.to_wire())
            .with_context(context.clone())
            .with_ofx_version(ctx.version.header_value());

        let response = self.dispatcher.dispatch(&request).await?;
        let parsed = self
            .decoder
            .decode(&response.body)
            .map_err(|e| e.with_banking_context(context))?;

        // responses carrying an OFX error status are returned but not cached
        if parsed.status_error().is_none() {
            self.cache.set(&key, &parsed, self.config.cache_ttl);
        }
        Ok(parsed)
    }

    fn banking_context(&self, ctx: &RequestContext) -> BankingContext {
        let context = BankingContext::new()
            .with_fid(ctx.fid.as_str(), ctx.org.as_str())
            .with_operation(ctx.operation.kind().as_str())
            .with_url(&self.url);
        match ctx.operation {
            Operation::Statement(_) => context.with_account_type(ctx.account_type.as_ofx()),
            Operation::AccountList => context,
        }
    }

    /// Drop any cached response for `ctx`
    pub fn invalidate(&self, ctx: &RequestContext) {
        self.cache.invalidate(&CacheKey::for_request(ctx));
    }

    /// Decode an OFX document already in memory
    pub fn parse_str(&self, raw: &str) -> Result<ParsedResponse> {
        self.decoder.decode(raw)
    }

    /// Decode an OFX file from disk
    pub async fn parse_file(&self, path: impl AsRef<Path>) -> Result<ParsedResponse> {
        self.decoder.decode_file(path).await
    }

    pub fn pool_metrics(&self) -> DispatchMetricsSnapshot {
        self.dispatcher.metrics()
    }

    pub fn retry_metrics(&self) -> RetryMetricsSnapshot {
        self.dispatcher.retry_metrics()
    }

    /// Tear down agents, host state and metrics reporting
    pub fn destroy(&self) {
        self.dispatcher.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::types::{AccountType, Credentials, DateRange};
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryCache {
        entries: Mutex<HashMap<CacheKey, ParsedResponse>>,
    }

    impl ResponseCache for MemoryCache {
        fn get(&self, key: &CacheKey) -> Option<ParsedResponse> {
            self.entries.lock().unwrap().get(key).cloned()
        }

        fn set(&self, key: &CacheKey, response: &ParsedResponse, _ttl: Duration) {
            self.entries
                .lock()
                .unwrap()
                .insert(key.clone(), response.clone());
        }

        fn invalidate(&self, key: &CacheKey) {
            self.entries.lock().unwrap().remove(key);
        }
    }

    fn statement_ctx() -> RequestContext {
        RequestContext::statement(
            "3000",
            "WF",
            Credentials::new("jdoe", "hunter2"),
            "1234567890",
            AccountType::Checking,
            DateRange::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                Some(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()),
            ),
        )
        .with_bank_id("121000248")
    }

    #[test]
    fn test_cache_key_masks_account_and_skips_credentials() {
        let key = CacheKey::for_request(&statement_ctx());
        assert_eq!(key.operation, OperationType::Statement);
        assert_eq!(key.params["account"], "****7890");
        assert_eq!(key.params["start"], "20240101");
        let rendered = key.to_string();
        assert!(!rendered.contains("1234567890"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("jdoe"));
    }

    #[test]
    fn test_rejects_bad_urls() {
        for url in ["ftp://ofx.bank.example/", "not a url", "file:///tmp/ofx"] {
            let err = OfxClient::new(url, ClientConfig::default()).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidConfiguration, "{}", url);
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let cache = Arc::new(MemoryCache::default());
        let client = OfxClient::new("http://127.0.0.1:9/ofx", ClientConfig::default())
            .unwrap()
            .with_cache(cache.clone());

        let cached = client
            .parse_str("OFXHEADER:100\r\n\r\n<OFX><SIGNONMSGSRSV1><SONRS><STATUS><CODE>0</STATUS></SONRS></SIGNONMSGSRSV1></OFX>")
            .unwrap();
        let ctx = statement_ctx();
        cache.set(&CacheKey::for_request(&ctx), &cached, Duration::from_secs(60));

        let response = client.get_statement(&ctx).await.unwrap();
        assert_eq!(response, cached);
        assert_eq!(client.pool_metrics().total_requests, 0);

        client.invalidate(&ctx);
        assert!(cache.get(&CacheKey::for_request(&ctx)).is_none());
    }

    #[tokio::test]
    async fn test_operation_mismatch() {
        let client = OfxClient::new("https://ofx.bank.example/ofx", ClientConfig::default()).unwrap();
        let accounts = RequestContext::account_list("3000", "WF", Credentials::new("u", "p"));

        let err = client.get_statement(&accounts).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        let err = client.get_accounts(&statement_ctx()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_encoding_errors_carry_context() {
        let client = OfxClient::new("https://ofx.bank.example/ofx", ClientConfig::default()).unwrap();
        let mut ctx = statement_ctx();
        ctx.bank_id = None;

        let err = client.get_statement(&ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        assert_eq!(err.banking_context().fid.as_deref(), Some("3000"));
        assert_eq!(err.banking_context().operation_type.as_deref(), Some("statement"));
    }
}
