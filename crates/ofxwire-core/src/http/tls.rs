//! TLS settings for HTTPS agents
//!
//! Certificate verification is always on. Institutions that sign with a
//! private root are reached by adding that root as an extra trust anchor.

use reqwest::{Certificate, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;

/// Trust and protocol settings shared by every HTTPS agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub min_version: TlsVersion,
    /// PEM files holding extra root certificates
    pub ca_files: Vec<PathBuf>,
    /// Extra root certificates given inline as PEM
    pub ca_pem: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::TLS1_2,
            ca_files: Vec::new(),
            ca_pem: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    TLS1_2,
    TLS1_3,
}

impl From<TlsVersion> for reqwest::tls::Version {
    fn from(version: TlsVersion) -> Self {
        match version {
            TlsVersion::TLS1_2 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::TLS1_3 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("CA file {0:?} does not exist")]
    MissingCaFile(PathBuf),

    #[error("CA file {path:?} could not be read: {source}")]
    UnreadableCaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CA certificate is not PEM: {0}")]
    NotPem(String),

    #[error("CA certificate rejected: {0}")]
    Rejected(String),
}

impl From<TlsConfigError> for Error {
    fn from(err: TlsConfigError) -> Self {
        Error::configuration(err.to_string())
    }
}

impl TlsConfig {
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_files.push(path.into());
        self
    }

    pub fn with_ca_pem(mut self, pem: impl Into<String>) -> Self {
        self.ca_pem.push(pem.into());
        self
    }

    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Check that every extra root exists and is PEM shaped
    pub fn validate(&self) -> Result<(), TlsConfigError> {
        if let Some(missing) = self.ca_files.iter().find(|p| !p.exists()) {
            return Err(TlsConfigError::MissingCaFile(missing.clone()));
        }
        if let Some(bad) = self.ca_pem.iter().find(|pem| !looks_like_pem(pem)) {
            return Err(TlsConfigError::NotPem(bad.chars().take(32).collect()));
        }
        Ok(())
    }

    /// Restrict `builder` to HTTPS with these trust settings
    pub fn apply(&self, builder: ClientBuilder) -> Result<ClientBuilder, TlsConfigError> {
        let mut builder = builder
            .use_rustls_tls()
            .https_only(true)
            .min_tls_version(self.min_version.into());

        for path in &self.ca_files {
            let pem = std::fs::read(path).map_err(|source| TlsConfigError::UnreadableCaFile {
                path: path.clone(),
                source,
            })?;
            builder = builder.add_root_certificate(root_certificate(&pem)?);
        }
        for pem in &self.ca_pem {
            builder = builder.add_root_certificate(root_certificate(pem.as_bytes())?);
        }
        Ok(builder)
    }
}

fn root_certificate(pem: &[u8]) -> Result<Certificate, TlsConfigError> {
    Certificate::from_pem(pem).map_err(|e| TlsConfigError::Rejected(e.to_string()))
}

fn looks_like_pem(content: &str) -> bool {
    content.contains("-----BEGIN CERTIFICATE-----") && content.contains("-----END CERTIFICATE-----")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_defaults_require_tls12() {
        let config = TlsConfig::default();
        assert_eq!(config.min_version, TlsVersion::TLS1_2);
        assert!(config.ca_files.is_empty());
        assert!(config.validate().is_ok());
        assert!(TlsVersion::TLS1_2 < TlsVersion::TLS1_3);
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig::default().with_ca_file("/nonexistent/bank-root.pem");
        assert!(matches!(
            config.validate(),
            Err(TlsConfigError::MissingCaFile(_))
        ));
    }

    #[test]
    fn test_inline_ca_must_be_pem() {
        let config = TlsConfig::default().with_ca_pem("MIIBszCCAVmgAwIBAgIU");
        assert!(matches!(config.validate(), Err(TlsConfigError::NotPem(_))));

        let err: Error = TlsConfigError::NotPem("x".into()).into();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_apply_builds_client() {
        let builder = TlsConfig::default()
            .with_min_version(TlsVersion::TLS1_3)
            .apply(reqwest::Client::builder())
            .unwrap();
        assert!(builder.build().is_ok());
    }
}
