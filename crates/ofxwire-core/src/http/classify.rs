//! Failure classification for dispatch attempts
//!
//! Maps HTTP statuses, transport errors and OFX status codes embedded in
//! error bodies onto [`ErrorCode`]s. All functions here are pure apart from
//! reading the error they are given.

use regex::Regex;
use std::error::Error as StdError;
use std::io;
use std::sync::OnceLock;

use crate::error::{ofx_status_code, Error, ErrorCode};

/// Classify an HTTP status code
pub fn classify_status(status: u16) -> ErrorCode {
    match status {
        401 => ErrorCode::Unauthorized,
        403 => ErrorCode::Forbidden,
        404 => ErrorCode::AccountNotFound,
        429 => ErrorCode::RateLimited,
        503 => ErrorCode::Maintenance,
        500..=599 => ErrorCode::ServerError,
        400..=499 => ErrorCode::ClientError,
        _ => ErrorCode::Unknown,
    }
}

fn status_message(status: u16) -> &'static str {
    match status {
        401 => "authentication failed",
        403 => "access forbidden",
        404 => "account not found",
        429 => "rate limited by server",
        503 => "institution under maintenance",
        500..=599 => "server error",
        400..=499 => "request rejected",
        _ => "unexpected HTTP status",
    }
}

/// OFX `CODE`/`MESSAGE` pair found in an error body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedStatus {
    pub code: u32,
    pub message: Option<String>,
}

/// Scan a body for an OFX status code and message
///
/// Works on partial or malformed bodies; no parsing is attempted.
pub fn extract_embedded_status(body: &str) -> Option<EmbeddedStatus> {
    static CODE_RE: OnceLock<Regex> = OnceLock::new();
    static MESSAGE_RE: OnceLock<Regex> = OnceLock::new();

    let code_re = CODE_RE.get_or_init(|| {
        Regex::new(r"(?i)<CODE>\s*(\d+)").expect("CODE pattern is valid")
    });
    let message_re = MESSAGE_RE.get_or_init(|| {
        Regex::new(r"(?i)<MESSAGE>([^<\r\n]*)").expect("MESSAGE pattern is valid")
    });

    let code = code_re.captures(body)?.get(1)?.as_str().parse().ok()?;
    let message = message_re
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|m| !m.is_empty());
    Some(EmbeddedStatus { code, message })
}

/// Error for a non-200 response
///
/// An OFX status embedded in the body takes over the code when it is in the
/// lookup table; the HTTP status is kept in the technical details either way.
/// A `Retry-After` value replaces the default hint.
pub fn error_for_status(status: u16, body: &str, retry_after: Option<u64>) -> Error {
    let embedded = extract_embedded_status(body);

    let error = match &embedded {
        Some(found) if ofx_status_code(found.code).is_some() => {
            Error::from_ofx_status(found.code, found.message.clone())
        }
        Some(found) => Error::new(
            classify_status(status),
            format!("HTTP {}: {}", status, status_message(status)),
        )
        .with_ofx_status(found.code, found.message.clone()),
        None => Error::new(
            classify_status(status),
            format!("HTTP {}: {}", status, status_message(status)),
        ),
    };

    let error = error.with_http_status(status);
    match retry_after {
        Some(seconds) if error.is_retryable() => error.with_retry_after(seconds),
        _ => error,
    }
}

/// Map an I/O error kind onto a transport code
pub fn classify_io_kind(kind: io::ErrorKind) -> Option<ErrorCode> {
    match kind {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(ErrorCode::ConnectionReset),
        io::ErrorKind::ConnectionRefused => Some(ErrorCode::ConnectionRefused),
        io::ErrorKind::NotConnected | io::ErrorKind::AddrNotAvailable => {
            Some(ErrorCode::HostUnreachable)
        }
        io::ErrorKind::TimedOut => Some(ErrorCode::SocketTimeout),
        _ => None,
    }
}

/// Heuristics over error messages from the resolver and TLS stack
pub fn classify_transport_message(message: &str) -> Option<ErrorCode> {
    let message = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if has(&["dns error", "failed to lookup address", "name or service not known", "no such host", "nodename nor servname"]) {
        Some(ErrorCode::DnsFailure)
    } else if has(&["certificate", "unknownissuer", "invalid peer cert", "self signed", "self-signed"]) {
        Some(ErrorCode::CertificateInvalid)
    } else if has(&["handshake", "tls", "ssl"]) {
        Some(ErrorCode::TlsHandshake)
    } else if has(&["connection reset", "broken pipe", "connection closed before message completed"]) {
        Some(ErrorCode::ConnectionReset)
    } else if has(&["connection refused"]) {
        Some(ErrorCode::ConnectionRefused)
    } else if has(&["unreachable"]) {
        Some(ErrorCode::HostUnreachable)
    } else if has(&["timed out", "timeout"]) {
        Some(ErrorCode::RequestTimeout)
    } else {
        None
    }
}

/// Classify a transport failure reported by reqwest
///
/// The URL is stripped from the error before its text is recorded.
pub fn classify_transport(error: reqwest::Error) -> Error {
    let error = error.without_url();

    if error.is_timeout() && error.is_connect() {
        return Error::new(ErrorCode::ConnectionTimeout, "connection timed out")
            .with_original_error(error.to_string());
    }

    let mut by_message = None;
    let mut by_kind = None;
    let mut source: Option<&(dyn StdError + 'static)> = Some(&error);
    while let Some(current) = source {
        if by_message.is_none() {
            by_message = classify_transport_message(&current.to_string());
        }
        if by_kind.is_none() {
            by_kind = current
                .downcast_ref::<io::Error>()
                .and_then(|io| classify_io_kind(io.kind()));
        }
        source = current.source();
    }

    let code = match (by_message, by_kind) {
        (Some(ErrorCode::DnsFailure), _) => ErrorCode::DnsFailure,
        (Some(ErrorCode::CertificateInvalid), _) => ErrorCode::CertificateInvalid,
        (_, Some(kind)) => kind,
        (Some(message), None) => message,
        (None, None) if error.is_timeout() => ErrorCode::RequestTimeout,
        (None, None) if error.is_connect() => ErrorCode::ConnectionRefused,
        (None, None) => ErrorCode::Unknown,
    };

    Error::new(code, format!("transport error: {}", code.as_str().to_lowercase()))
        .with_original_error(error.to_string())
}
