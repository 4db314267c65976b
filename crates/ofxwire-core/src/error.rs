//! Typed error taxonomy for OFX calls
//!
//! Every failure surfaced by this crate is a single [`Error`] value. There is no
//! hierarchy of error types: an [`ErrorCode`] fixes the [`ErrorCategory`], the
//! default retry capabilities and the recommendations shown to the user, and
//! the classification functions in [`crate::http::classify`] pick the code.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Convenience type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Transport failures: DNS, sockets, TLS, timeouts
    Network,
    /// Rejected credentials or access
    Authentication,
    /// The bank understood the request but refused it
    BankingBusiness,
    /// The OFX exchange itself is wrong (version, elements, duplicates)
    OfxProtocol,
    /// The server asked us to slow down
    RateLimit,
    /// Caller supplied configuration is invalid
    Configuration,
    /// Payload could not be decoded or is out of range
    Data,
    /// Anything we could not classify
    Unknown,
}

impl ErrorCategory {
    /// Wire name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::BankingBusiness => "BANKING_BUSINESS",
            ErrorCategory::OfxProtocol => "OFX_PROTOCOL",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Data => "DATA",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which timeout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPhase {
    /// Establishing the TCP/TLS connection
    Connection,
    /// The whole request, from send to last body byte
    Request,
    /// Gap between two reads on an open socket
    Socket,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connection => write!(f, "connection"),
            TimeoutPhase::Request => write!(f, "request"),
            TimeoutPhase::Socket => write!(f, "socket"),
        }
    }
}

/// Bucket used by retry metrics to count failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Network,
    Http,
    Ssl,
    Timeout,
    Ofx,
    Other,
}

/// Specific failure code
///
/// The code determines the category and the default capabilities; see
/// [`ErrorCode::category`] and [`ErrorCode::capabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Transport
    ConnectionReset,
    ConnectionRefused,
    HostUnreachable,
    DnsFailure,
    ConnectionTimeout,
    RequestTimeout,
    SocketTimeout,
    TlsHandshake,
    CertificateInvalid,

    // HTTP status
    Unauthorized,
    Forbidden,
    AccountNotFound,
    Maintenance,
    RateLimited,
    ServerError,
    ClientError,

    // Embedded OFX status codes
    OfxGeneralError,
    OfxInvalidAccount,
    OfxAccountError,
    OfxAccountNotFound,
    OfxAccountClosed,
    OfxAccountNotAuthorized,
    OfxDuplicateRequest,
    OfxInvalidDate,
    OfxUnsupportedVersion,
    OfxInvalidDateRange,
    OfxUnknownElement,
    OfxPasswordChangeRequired,
    OfxSignonInvalid,
    OfxAccountInUse,
    OfxAccountLocked,
    OfxServiceUnavailable,
    OfxNotAuthorized,
    OfxClientUidError,
    OfxMfaRequired,
    OfxMfaFailed,
    /// Non-zero OFX status code absent from the lookup table
    OfxStatus,

    // Local
    DataParsing,
    ResponseTooLarge,
    InvalidConfiguration,
    Cancelled,
    Unknown,
}

/// Retry capabilities attached to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub retryable: bool,
    pub max_retries: u32,
    pub retry_after: Option<u64>,
}

impl Capabilities {
    const fn fatal() -> Self {
        Self {
            retryable: false,
            max_retries: 0,
            retry_after: None,
        }
    }

    const fn retry(max_retries: u32) -> Self {
        Self {
            retryable: true,
            max_retries,
            retry_after: None,
        }
    }

    const fn retry_after(max_retries: u32, seconds: u64) -> Self {
        Self {
            retryable: true,
            max_retries,
            retry_after: Some(seconds),
        }
    }
}

// JSON carries the same wire name as Display
impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl ErrorCode {
    /// Category this code belongs to
    pub fn category(&self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            ConnectionReset | ConnectionRefused | HostUnreachable | DnsFailure
            | ConnectionTimeout | RequestTimeout | SocketTimeout | TlsHandshake
            | CertificateInvalid => ErrorCategory::Network,

            Unauthorized | Forbidden | OfxAccountNotAuthorized | OfxPasswordChangeRequired
            | OfxSignonInvalid | OfxAccountInUse | OfxAccountLocked | OfxNotAuthorized
            | OfxClientUidError | OfxMfaRequired | OfxMfaFailed => ErrorCategory::Authentication,

            AccountNotFound | Maintenance | ServerError | OfxAccountError
            | OfxAccountNotFound | OfxAccountClosed | OfxServiceUnavailable => {
                ErrorCategory::BankingBusiness
            }

            ClientError | OfxGeneralError | OfxDuplicateRequest | OfxUnsupportedVersion
            | OfxUnknownElement | OfxStatus => ErrorCategory::OfxProtocol,

            RateLimited => ErrorCategory::RateLimit,

            OfxInvalidAccount | OfxInvalidDate | OfxInvalidDateRange | DataParsing
            | ResponseTooLarge => ErrorCategory::Data,

            InvalidConfiguration => ErrorCategory::Configuration,

            Cancelled | Unknown => ErrorCategory::Unknown,
        }
    }

    /// Default retry capabilities for this code
    pub fn capabilities(&self) -> Capabilities {
        use ErrorCode::*;
        match self {
            ConnectionReset | ConnectionRefused | HostUnreachable => Capabilities::retry(3),
            ConnectionTimeout | RequestTimeout | SocketTimeout => Capabilities::retry(2),
            TlsHandshake => Capabilities::retry(1),
            RateLimited => Capabilities::retry_after(3, 300),
            Maintenance => Capabilities::retry_after(2, 3600),
            ServerError => Capabilities::retry(2),
            OfxGeneralError | OfxServiceUnavailable => Capabilities::retry(1),
            _ => Capabilities::fatal(),
        }
    }

    /// Metrics bucket for this code
    pub fn failure_kind(&self) -> FailureKind {
        use ErrorCode::*;
        match self {
            ConnectionReset | ConnectionRefused | HostUnreachable | DnsFailure => {
                FailureKind::Network
            }
            ConnectionTimeout | RequestTimeout | SocketTimeout => FailureKind::Timeout,
            TlsHandshake | CertificateInvalid => FailureKind::Ssl,
            Unauthorized | Forbidden | AccountNotFound | Maintenance | RateLimited
            | ServerError | ClientError => FailureKind::Http,
            DataParsing | ResponseTooLarge | InvalidConfiguration | Cancelled | Unknown => {
                FailureKind::Other
            }
            _ => FailureKind::Ofx,
        }
    }

    /// Whether this is one of the timeout codes
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionTimeout | ErrorCode::RequestTimeout | ErrorCode::SocketTimeout
        )
    }

    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            ConnectionReset => "CONNECTION_RESET",
            ConnectionRefused => "CONNECTION_REFUSED",
            HostUnreachable => "HOST_UNREACHABLE",
            DnsFailure => "DNS_FAILURE",
            ConnectionTimeout => "CONNECTION_TIMEOUT",
            RequestTimeout => "REQUEST_TIMEOUT",
            SocketTimeout => "SOCKET_TIMEOUT",
            TlsHandshake => "TLS_HANDSHAKE",
            CertificateInvalid => "CERTIFICATE_INVALID",
            Unauthorized => "UNAUTHORIZED",
            Forbidden => "FORBIDDEN",
            AccountNotFound => "ACCOUNT_NOT_FOUND",
            Maintenance => "MAINTENANCE",
            RateLimited => "RATE_LIMITED",
            ServerError => "SERVER_ERROR",
            ClientError => "CLIENT_ERROR",
            OfxGeneralError => "OFX_GENERAL_ERROR",
            OfxInvalidAccount => "OFX_INVALID_ACCOUNT",
            OfxAccountError => "OFX_ACCOUNT_ERROR",
            OfxAccountNotFound => "OFX_ACCOUNT_NOT_FOUND",
            OfxAccountClosed => "OFX_ACCOUNT_CLOSED",
            OfxAccountNotAuthorized => "OFX_ACCOUNT_NOT_AUTHORIZED",
            OfxDuplicateRequest => "OFX_DUPLICATE_REQUEST",
            OfxInvalidDate => "OFX_INVALID_DATE",
            OfxUnsupportedVersion => "OFX_UNSUPPORTED_VERSION",
            OfxInvalidDateRange => "OFX_INVALID_DATE_RANGE",
            OfxUnknownElement => "OFX_UNKNOWN_ELEMENT",
            OfxPasswordChangeRequired => "OFX_PASSWORD_CHANGE_REQUIRED",
            OfxSignonInvalid => "OFX_SIGNON_INVALID",
            OfxAccountInUse => "OFX_ACCOUNT_IN_USE",
            OfxAccountLocked => "OFX_ACCOUNT_LOCKED",
            OfxServiceUnavailable => "OFX_SERVICE_UNAVAILABLE",
            OfxNotAuthorized => "OFX_NOT_AUTHORIZED",
            OfxClientUidError => "OFX_CLIENTUID_ERROR",
            OfxMfaRequired => "OFX_MFA_REQUIRED",
            OfxMfaFailed => "OFX_MFA_FAILED",
            OfxStatus => "OFX_STATUS",
            DataParsing => "DATA_PARSING_ERROR",
            ResponseTooLarge => "RESPONSE_TOO_LARGE",
            InvalidConfiguration => "INVALID_CONFIGURATION",
            Cancelled => "CANCELLED",
            Unknown => "UNKNOWN",
        }
    }

    /// Suggested actions for the user
    pub fn recommendations(&self) -> &'static [&'static str] {
        use ErrorCode::*;
        match self {
            ConnectionReset | ConnectionRefused | HostUnreachable => &[
                "Check network connectivity to the bank's OFX server",
                "The server may be temporarily down; retry later",
            ],
            DnsFailure => &[
                "Verify the OFX endpoint URL for this institution",
                "Check DNS configuration on this host",
            ],
            ConnectionTimeout | RequestTimeout | SocketTimeout => &[
                "The bank server is responding slowly; retry later",
                "Request a shorter date range to reduce response size",
            ],
            TlsHandshake | CertificateInvalid => &[
                "Verify the OFX endpoint uses a valid TLS certificate",
                "Check that the system clock is correct",
            ],
            Unauthorized | Forbidden | OfxSignonInvalid | OfxNotAuthorized => &[
                "Verify the user id and password for this institution",
                "Some banks require enabling Direct Connect / OFX access first",
            ],
            OfxAccountLocked | OfxAccountInUse => &[
                "The account is locked or suspended; contact the institution",
            ],
            OfxPasswordChangeRequired => &["Log into the bank's website and change the password"],
            OfxMfaRequired | OfxMfaFailed | OfxClientUidError => &[
                "The institution requires additional authentication",
                "Register the CLIENTUID with the bank, then retry",
            ],
            AccountNotFound | OfxAccountNotFound | OfxInvalidAccount | OfxAccountError
            | OfxAccountClosed | OfxAccountNotAuthorized => &[
                "Verify the account id, routing id and account type",
                "List accounts first to find the identifiers the bank expects",
            ],
            Maintenance | OfxServiceUnavailable => &[
                "The institution is under maintenance; retry after the suggested delay",
            ],
            RateLimited => &["Reduce the request rate for this institution"],
            ServerError | OfxGeneralError => &["The bank reported an internal error; retry later"],
            ClientError | OfxUnknownElement | OfxStatus => &[
                "The server rejected the request; check FID, ORG and app id/version",
            ],
            OfxUnsupportedVersion => &["Configure an OFX version supported by this institution"],
            OfxDuplicateRequest => &["Resend the request with a new transaction id"],
            OfxInvalidDate | OfxInvalidDateRange => &[
                "Check the statement date range; many banks limit history length",
            ],
            DataParsing | ResponseTooLarge => &[
                "The response could not be decoded as OFX",
                "Inspect the raw response body for an HTML error page",
            ],
            InvalidConfiguration => &["Fix the reported configuration value"],
            Cancelled => &["The dispatcher was shut down before the call finished"],
            Unknown => &["Retry the request; report the correlation id if it persists"],
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the failing call was going and what it was doing
///
/// The URL is always stored sanitized; see [`sanitize_url`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BankingContext {
    pub fid: Option<String>,
    pub fid_org: Option<String>,
    pub operation_type: Option<String>,
    pub account_type: Option<String>,
    url: Option<String>,
}

impl BankingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fid(mut self, fid: impl Into<String>, org: impl Into<String>) -> Self {
        self.fid = Some(fid.into());
        self.fid_org = Some(org.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation_type = Some(operation.into());
        self
    }

    pub fn with_account_type(mut self, account_type: impl Into<String>) -> Self {
        self.account_type = Some(account_type.into());
        self
    }

    /// Store the endpoint URL with credentials, query and fragment removed
    pub fn with_url(mut self, raw: &str) -> Self {
        self.url = Some(sanitize_url(raw));
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

/// Low-level details for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TechnicalDetails {
    pub http_status: Option<u16>,
    pub ofx_status: Option<u32>,
    pub ofx_message: Option<String>,
    pub original_error: Option<String>,
    pub request_id: Option<String>,
    pub user_agent: Option<String>,
    pub ofx_version: Option<String>,
    pub timeout_phase: Option<TimeoutPhase>,
    pub timeout_ms: Option<u64>,
}

/// A classified failure
///
/// Built once per failure by the classification functions and handed to the
/// caller; the `with_*` methods only apply while the error is being assembled.
#[derive(Error, Debug, Clone, Serialize)]
#[error("[{category}/{code}] {message}")]
pub struct Error {
    category: ErrorCategory,
    code: ErrorCode,
    message: String,
    correlation_id: String,
    timestamp: DateTime<Utc>,
    retryable: bool,
    max_retries: u32,
    retry_after: Option<u64>,
    banking_context: BankingContext,
    technical_details: TechnicalDetails,
    recommendations: Vec<String>,
}

impl Error {
    /// Create an error with the default capabilities of `code`
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let caps = code.capabilities();
        Self {
            category: code.category(),
            code,
            message: message.into(),
            correlation_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            retryable: caps.retryable,
            max_retries: caps.max_retries,
            retry_after: caps.retry_after,
            banking_context: BankingContext::default(),
            technical_details: TechnicalDetails::default(),
            recommendations: code.recommendations().iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A timeout in the given phase
    pub fn timeout(phase: TimeoutPhase, limit: Duration) -> Self {
        let code = match phase {
            TimeoutPhase::Connection => ErrorCode::ConnectionTimeout,
            TimeoutPhase::Request => ErrorCode::RequestTimeout,
            TimeoutPhase::Socket => ErrorCode::SocketTimeout,
        };
        let mut error = Self::new(
            code,
            format!("{} timeout after {}ms", phase, limit.as_millis()),
        );
        error.technical_details.timeout_phase = Some(phase);
        error.technical_details.timeout_ms = Some(limit.as_millis() as u64);
        error
    }

    /// The body could not be decoded as OFX
    pub fn data_parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DataParsing, message)
    }

    /// Invalid caller configuration
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// The dispatcher was destroyed while the call was pending
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "dispatcher destroyed before the call completed")
    }

    pub fn with_banking_context(mut self, context: BankingContext) -> Self {
        self.banking_context = context;
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.technical_details.http_status = Some(status);
        self
    }

    pub fn with_ofx_status(mut self, code: u32, message: Option<String>) -> Self {
        self.technical_details.ofx_status = Some(code);
        self.technical_details.ofx_message = message;
        self
    }

    pub fn with_original_error(mut self, original: impl Into<String>) -> Self {
        self.technical_details.original_error = Some(original.into());
        self
    }

    pub fn with_request_meta(
        mut self,
        request_id: Option<String>,
        user_agent: Option<String>,
        ofx_version: Option<String>,
    ) -> Self {
        self.technical_details.request_id = request_id;
        self.technical_details.user_agent = user_agent;
        self.technical_details.ofx_version = ofx_version;
        self
    }

    /// Override the retry-after hint, e.g. from a `Retry-After` header
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Suggested wait before retrying, in seconds
    pub fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }

    pub fn banking_context(&self) -> &BankingContext {
        &self.banking_context
    }

    pub fn technical_details(&self) -> &TechnicalDetails {
        &self.technical_details
    }

    pub fn recommendations(&self) -> &[String] {
        &self.recommendations
    }

    /// Serialize for structured logs
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// OFX status codes that must never be retried, whatever the transport did
pub const NON_RETRYABLE_OFX_CODES: &[u32] = &[
    2001, 2002, 2003, 2004, 2005, 2019, 2020, 2021, 2027, 2028, 15000, 15500, 15501, 15502,
    15508, 15510, 15511, 15512,
];

/// Whether an OFX status code is on the non-retryable list
pub fn is_non_retryable_ofx_code(code: u32) -> bool {
    NON_RETRYABLE_OFX_CODES.contains(&code)
}

/// Lookup table for OFX `STATUS/CODE` values
pub fn ofx_status_code(code: u32) -> Option<ErrorCode> {
    let mapped = match code {
        2000 => ErrorCode::OfxGeneralError,
        2001 => ErrorCode::OfxInvalidAccount,
        2002 => ErrorCode::OfxAccountError,
        2003 => ErrorCode::OfxAccountNotFound,
        2004 => ErrorCode::OfxAccountClosed,
        2005 => ErrorCode::OfxAccountNotAuthorized,
        2019 => ErrorCode::OfxDuplicateRequest,
        2020 => ErrorCode::OfxInvalidDate,
        2021 => ErrorCode::OfxUnsupportedVersion,
        2027 => ErrorCode::OfxInvalidDateRange,
        2028 => ErrorCode::OfxUnknownElement,
        15000 => ErrorCode::OfxPasswordChangeRequired,
        15500 => ErrorCode::OfxSignonInvalid,
        15501 => ErrorCode::OfxAccountInUse,
        15502 => ErrorCode::OfxAccountLocked,
        15505 => ErrorCode::OfxServiceUnavailable,
        15508 => ErrorCode::OfxNotAuthorized,
        15510 => ErrorCode::OfxClientUidError,
        15511 => ErrorCode::OfxMfaRequired,
        15512 => ErrorCode::OfxMfaFailed,
        _ => return None,
    };
    Some(mapped)
}

impl Error {
    /// Error for a non-zero OFX status code
    ///
    /// Codes missing from the table become `OFX_STATUS`, non-retryable.
    pub fn from_ofx_status(code: u32, message: Option<String>) -> Self {
        let mapped = ofx_status_code(code).unwrap_or(ErrorCode::OfxStatus);
        let text = match &message {
            Some(m) => format!("OFX status {}: {}", code, m),
            None => format!("OFX status {}", code),
        };
        Error::new(mapped, text).with_ofx_status(code, message)
    }
}

/// Strip credentials, query string and fragment, keeping scheme, host, port and path
pub fn sanitize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => {
            let mut out = format!("{}://", url.scheme());
            if let Some(host) = url.host_str() {
                out.push_str(host);
            }
            if let Some(port) = url.port() {
                out.push_str(&format!(":{}", port));
            }
            out.push_str(url.path());
            out
        }
        Err(_) => "[unparseable url]".to_string(),
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::configuration(format!("invalid JSON configuration: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::configuration(format!("invalid TOML configuration: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorCode::DataParsing, format!("IO error: {}", err))
            .with_original_error(err.to_string())
    }
}
