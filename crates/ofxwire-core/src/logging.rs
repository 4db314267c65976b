//! Logging setup and redaction helpers
//!
//! The library only emits `tracing` events. Host applications that want the
//! stock subscriber call [`init_logging`] once at startup.

use is_terminal::IsTerminal;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter, e.g. `info` or `warn,ofxwire_core=debug`
    pub level: String,
    pub format: LogFormat,
    /// Colour output when stderr is a terminal
    pub ansi: bool,
    pub thread_ids: bool,
    pub file_and_line: bool,
    /// Extra `target=level` directives
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Full,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            ansi: true,
            thread_ids: false,
            file_and_line: false,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// `RUST_LOG` replaces the level, `OFXWIRE_LOG_FORMAT` the format
    pub fn apply_env_overrides(&mut self) {
        if let Ok(filter) = std::env::var("RUST_LOG") {
            self.level = filter;
        }

        if let Ok(format) = std::env::var("OFXWIRE_LOG_FORMAT") {
            match format.to_ascii_lowercase().as_str() {
                "compact" => self.format = LogFormat::Compact,
                "full" => self.format = LogFormat::Full,
                "json" => self.format = LogFormat::Json,
                other => tracing::warn!(format = other, "unknown OFXWIRE_LOG_FORMAT, keeping {:?}", self.format),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.env_filter().map(|_| ())
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| Error::configuration(format!("invalid log level '{}': {}", self.level, e)))?;

        for directive in &self.directives {
            let parsed = directive.parse().map_err(|e| {
                Error::configuration(format!("invalid log directive '{}': {}", directive, e))
            })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install the global subscriber, writing to stderr
///
/// Fails if a global subscriber is already set.
pub fn init_logging(mut config: LoggingConfig) -> Result<()> {
    config.apply_env_overrides();
    let ansi = config.ansi && std::io::stderr().is_terminal();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter()?)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(config.thread_ids)
        .with_file(config.file_and_line)
        .with_line_number(config.file_and_line);

    let installed = match config.format {
        LogFormat::Compact => {
            tracing::subscriber::set_global_default(builder.with_ansi(ansi).compact().finish())
        }
        LogFormat::Full => tracing::subscriber::set_global_default(builder.with_ansi(ansi).finish()),
        LogFormat::Json => {
            tracing::subscriber::set_global_default(builder.with_ansi(false).json().finish())
        }
    };
    installed.map_err(|e| Error::configuration(format!("logging already initialized: {}", e)))?;

    tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}

/// Sensitive data redaction for OFX payloads
pub mod redaction {
    use regex::Regex;
    use std::sync::OnceLock;

    static SENSITIVE_FIELD: OnceLock<Regex> = OnceLock::new();

    fn sensitive_field() -> &'static Regex {
        SENSITIVE_FIELD.get_or_init(|| {
            Regex::new(r"(?i)<(USERID|USERPASS|ACCTID|CLIENTUID|NEWUSERPASS)>([^<\r\n]*)")
                .expect("constant redaction pattern")
        })
    }

    /// Mask credential and account values in SGML or XML markup
    ///
    /// Account ids keep their last four characters.
    pub fn redact_ofx(input: &str) -> String {
        sensitive_field()
            .replace_all(input, |caps: &regex::Captures<'_>| {
                let tag = &caps[1];
                let value = caps[2].trim();
                let masked = if tag.eq_ignore_ascii_case("ACCTID") {
                    mask_account(value)
                } else {
                    "***".to_string()
                };
                format!("<{}>{}", tag, masked)
            })
            .into_owned()
    }

    /// `****1234` style mask keeping the last four characters
    pub fn mask_account(account: &str) -> String {
        let chars: Vec<char> = account.chars().collect();
        if chars.len() <= 4 {
            return "*".repeat(chars.len().max(4));
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{}", tail)
    }
}

#[cfg(test)]
mod tests {
    use super::redaction::{mask_account, redact_ofx};
    use super::*;

    #[test]
    fn test_redacts_credentials() {
        let payload = "<SONRQ><USERID>jdoe\r\n<USERPASS>hunter2\r\n<LANGUAGE>ENG\r\n";
        let redacted = redact_ofx(payload);
        assert!(!redacted.contains("jdoe"));
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.contains("<USERID>***"));
        assert!(redacted.contains("<LANGUAGE>ENG"));
    }

    #[test]
    fn test_account_keeps_last_four() {
        let redacted = redact_ofx("<ACCTID>1234567890</ACCTID>");
        assert_eq!(redacted, "<ACCTID>****7890</ACCTID>");
        assert_eq!(mask_account("12"), "****");
    }

    #[test]
    fn test_client_uid_redacted() {
        let redacted = redact_ofx("<CLIENTUID>ABCDEF0123456789");
        assert_eq!(redacted, "<CLIENTUID>***");
    }

    #[test]
    fn test_filter_validation() {
        assert!(LoggingConfig::default().validate().is_ok());

        let config = LoggingConfig {
            directives: vec!["ofxwire_core::http=debug".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = LoggingConfig {
            directives: vec!["ofxwire_core::http=loud".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_names() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
