//! ofxwire-core - OFX client wire-protocol engine
//!
//! This crate talks to financial institutions over OFX: it builds OFX 1.x
//! SGML requests, sends them over pooled HTTP connections with per-class
//! timeouts and retries, and decodes the loosely structured SGML responses
//! into a JSON-style tree.
//!
//! # Main Components
//!
//! - **Request Encoder**: header block plus sign-on and message-set aggregates
//! - **Response Decoder**: SGML normalization (closing leaf elements) and tree building
//! - **Error Taxonomy**: one typed error with category, code, context and recommendations
//! - **Retry Orchestrator**: backoff, jitter and per-host rate limiting
//! - **Connection Dispatcher**: keep-alive agents per host and operation class
//!
//! # Example
//!
//! ```no_run
//! use chrono::NaiveDate;
//! use ofxwire_core::{
//!     AccountType, ClientConfig, Credentials, DateRange, OfxClient, RequestContext, Result,
//! };
//!
//! async fn example() -> Result<()> {
//!     let client = OfxClient::new("https://ofx.bank.example/ofx", ClientConfig::default())?;
//!     let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
//!     let ctx = RequestContext::statement(
//!         "3000",
//!         "WF",
//!         Credentials::new("user", "secret"),
//!         "1234567890",
//!         AccountType::Checking,
//!         DateRange::new(start, None),
//!     )
//!     .with_bank_id("121000248");
//!
//!     let statement = client.get_statement(&ctx).await?;
//!     for txn in statement.list_at("/OFX/BANKMSGSRSV1/STMTTRNRS/STMTRS/BANKTRANLIST/STMTTRN") {
//!         println!("{}", txn["TRNAMT"]);
//!     }
//!     client.destroy();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod http;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use client::{CacheKey, NoCache, OfxClient, ResponseCache};
pub use config::{load_config, ClientConfig, ConfigOverrides};
pub use decoder::{decode, Decoder, DecoderConfig, OfxStatus, ParsedResponse, ResponseStatus};
pub use encoder::{encode_request, encode_request_at};
pub use error::{
    BankingContext, Error, ErrorCategory, ErrorCode, FailureKind, Result, TechnicalDetails,
    TimeoutPhase,
};
pub use http::{
    ConnectionDispatcher, DispatchRequest, DispatchResponse, DispatcherConfig, OperationClass,
    RetryConfig, RetryOrchestrator, TimeoutProfile, TimeoutProfiles,
};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use types::{
    AccountType, AppInfo, Credentials, DateRange, InvestmentOptions, OfxHeaders, OfxMessage,
    OfxVersion, Operation, OperationType, RequestContext,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
