//! Tiered timeout profiles
//!
//! Every operation class gets its own connection, request, socket and idle
//! timeouts, with an explicit override merge for partial configuration.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::operation::OperationClass;
use crate::error::{Error, Result, TimeoutPhase};

/// Timeouts for one operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutProfile {
    /// Time to establish the TCP/TLS connection
    pub connection: Duration,
    /// Total time for the request, from send to last body byte
    pub request: Duration,
    /// Longest gap allowed between two body reads
    pub socket: Duration,
    /// How long an idle pooled connection is kept
    pub idle: Duration,
}

impl TimeoutProfile {
    /// Account lists and short statements
    pub fn quick() -> Self {
        Self {
            connection: Duration::from_secs(5),
            request: Duration::from_secs(15),
            socket: Duration::from_secs(10),
            idle: Duration::from_secs(30),
        }
    }

    pub fn standard() -> Self {
        Self {
            connection: Duration::from_secs(10),
            request: Duration::from_secs(30),
            socket: Duration::from_secs(25),
            idle: Duration::from_secs(60),
        }
    }

    /// Long statement ranges and investment positions
    pub fn heavy() -> Self {
        Self {
            connection: Duration::from_secs(15),
            request: Duration::from_secs(120),
            socket: Duration::from_secs(90),
            idle: Duration::from_secs(120),
        }
    }

    /// Validate timeout configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.is_zero() {
            return Err(Error::configuration("connection timeout cannot be zero"));
        }
        if self.request.is_zero() {
            return Err(Error::configuration("request timeout cannot be zero"));
        }
        if self.socket.is_zero() {
            return Err(Error::configuration("socket timeout cannot be zero"));
        }
        if self.request < self.connection {
            return Err(Error::configuration(
                "request timeout should be >= connection timeout",
            ));
        }
        if self.socket > self.request {
            return Err(Error::configuration(
                "socket timeout should be <= request timeout",
            ));
        }
        Ok(())
    }
}

/// Profiles for all three operation classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutProfiles {
    pub quick: TimeoutProfile,
    pub standard: TimeoutProfile,
    pub heavy: TimeoutProfile,
}

impl Default for TimeoutProfiles {
    fn default() -> Self {
        Self {
            quick: TimeoutProfile::quick(),
            standard: TimeoutProfile::standard(),
            heavy: TimeoutProfile::heavy(),
        }
    }
}

impl TimeoutProfiles {
    pub fn for_class(&self, class: OperationClass) -> &TimeoutProfile {
        match class {
            OperationClass::Quick => &self.quick,
            OperationClass::Standard => &self.standard,
            OperationClass::Heavy => &self.heavy,
        }
    }

    /// Same profile for every class
    pub fn uniform(profile: TimeoutProfile) -> Self {
        Self {
            quick: profile,
            standard: profile,
            heavy: profile,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.quick.validate()?;
        self.standard.validate()?;
        self.heavy.validate()
    }
}

/// Partial timeout settings merged over a base profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOverrides {
    pub connection: Option<Duration>,
    pub request: Option<Duration>,
    pub socket: Option<Duration>,
    pub idle: Option<Duration>,
}

impl TimeoutOverrides {
    /// Override just the total request timeout
    pub fn request_only(timeout: Duration) -> Self {
        Self {
            request: Some(timeout),
            ..Default::default()
        }
    }

    /// Apply overrides to a base profile
    pub fn apply_to(&self, base: &TimeoutProfile) -> TimeoutProfile {
        TimeoutProfile {
            connection: self.connection.unwrap_or(base.connection),
            request: self.request.unwrap_or(base.request),
            socket: self.socket.unwrap_or(base.socket),
            idle: self.idle.unwrap_or(base.idle),
        }
    }

    /// Apply to every class
    pub fn apply_to_all(&self, base: &TimeoutProfiles) -> TimeoutProfiles {
        TimeoutProfiles {
            quick: self.apply_to(&base.quick),
            standard: self.apply_to(&base.standard),
            heavy: self.apply_to(&base.heavy),
        }
    }
}

/// Run `future` under a timeout, mapping expiry to a phase-tagged error
///
/// The future is dropped on expiry, which closes any socket it owns.
pub async fn with_phase_timeout<F, T>(phase: TimeoutPhase, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(phase, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_default_profiles_are_valid_and_ordered() {
        let profiles = TimeoutProfiles::default();
        assert!(profiles.validate().is_ok());
        assert!(profiles.quick.request < profiles.standard.request);
        assert!(profiles.standard.request < profiles.heavy.request);
        assert_eq!(profiles.for_class(OperationClass::Heavy), &TimeoutProfile::heavy());
    }

    #[test]
    fn test_validation_rejects_bad_profiles() {
        let mut profile = TimeoutProfile::standard();
        profile.connection = Duration::ZERO;
        assert!(profile.validate().is_err());

        let mut profile = TimeoutProfile::standard();
        profile.request = Duration::from_secs(1);
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_overrides_merge() {
        let overrides = TimeoutOverrides::request_only(Duration::from_secs(45));
        let merged = overrides.apply_to(&TimeoutProfile::standard());
        assert_eq!(merged.request, Duration::from_secs(45));
        assert_eq!(merged.connection, TimeoutProfile::standard().connection);

        let all = TimeoutOverrides {
            idle: Some(Duration::from_secs(5)),
            ..Default::default()
        }
        .apply_to_all(&TimeoutProfiles::default());
        assert_eq!(all.quick.idle, Duration::from_secs(5));
        assert_eq!(all.heavy.idle, Duration::from_secs(5));
        assert_eq!(all.heavy.request, TimeoutProfile::heavy().request);
    }

    #[tokio::test]
    async fn test_phase_timeout_expires() {
        let result: Result<()> = with_phase_timeout(
            TimeoutPhase::Request,
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RequestTimeout);
        assert_eq!(err.technical_details().timeout_phase, Some(TimeoutPhase::Request));
    }

    #[tokio::test]
    async fn test_phase_timeout_passes_result_through() {
        let result = with_phase_timeout(TimeoutPhase::Socket, Duration::from_secs(1), async {
            Ok::<_, Error>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
