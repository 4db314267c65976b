//! Keep-alive agents keyed by scheme, host and operation class
//!
//! An agent wraps one `reqwest::Client` (which owns the keep-alive
//! connections) plus a semaphore bounding concurrent sockets. Agents are
//! created on first use and live until the pool is destroyed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

use super::operation::OperationClass;
use super::timeout::{TimeoutProfile, TimeoutProfiles};
use super::tls::TlsConfig;
use crate::error::{Error, Result};

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent sockets per agent
    pub max_sockets: usize,
    /// Idle keep-alive connections kept per host
    pub max_idle_sockets: usize,
    /// TCP keep-alive interval
    pub keep_alive: Duration,
    pub user_agent: String,
    /// Honour `HTTP(S)_PROXY` from the environment
    pub use_system_proxy: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: 10,
            max_idle_sockets: 5,
            keep_alive: Duration::from_secs(60),
            user_agent: format!("ofxwire/{}", env!("CARGO_PKG_VERSION")),
            use_system_proxy: true,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_sockets == 0 {
            return Err(Error::configuration("max_sockets must be at least 1"));
        }
        if self.max_idle_sockets > self.max_sockets {
            return Err(Error::configuration(
                "max_idle_sockets cannot exceed max_sockets",
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(Error::configuration("user_agent cannot be empty"));
        }
        Ok(())
    }
}

/// Partial pool settings merged over a base configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOverrides {
    pub max_sockets: Option<usize>,
    pub max_idle_sockets: Option<usize>,
    pub keep_alive: Option<Duration>,
    pub user_agent: Option<String>,
    pub use_system_proxy: Option<bool>,
}

impl PoolOverrides {
    /// Apply overrides to a base configuration
    pub fn apply_to(&self, base: &PoolConfig) -> PoolConfig {
        PoolConfig {
            max_sockets: self.max_sockets.unwrap_or(base.max_sockets),
            max_idle_sockets: self.max_idle_sockets.unwrap_or(base.max_idle_sockets),
            keep_alive: self.keep_alive.unwrap_or(base.keep_alive),
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or_else(|| base.user_agent.clone()),
            use_system_proxy: self.use_system_proxy.unwrap_or(base.use_system_proxy),
        }
    }
}

/// Pool lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub scheme: String,
    pub host: String,
    pub class: OperationClass,
}

impl AgentKey {
    pub fn from_url(url: &Url, class: OperationClass) -> Result<Self> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(Error::configuration(format!(
                "unsupported URL scheme '{}'",
                scheme
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::configuration("OFX URL has no host"))?;
        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_ascii_lowercase(),
            class,
        })
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}#{}", self.scheme, self.host, self.class)
    }
}

/// Keep-alive transport for one key
#[derive(Debug)]
pub struct Agent {
    key: AgentKey,
    client: reqwest::Client,
    sockets: Arc<Semaphore>,
    max_sockets: usize,
    created_at: Instant,
}

impl Agent {
    pub fn key(&self) -> &AgentKey {
        &self.key
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Wait for a free socket slot; fails once the pool is destroyed
    pub async fn acquire_socket(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.sockets)
            .acquire_owned()
            .await
            .map_err(|_| Error::cancelled())
    }

    /// Sockets currently checked out
    pub fn active_sockets(&self) -> usize {
        self.max_sockets
            .saturating_sub(self.sockets.available_permits())
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn close(&self) {
        self.sockets.close();
    }
}

/// Lazily populated map of agents
#[derive(Debug)]
pub struct AgentPool {
    config: PoolConfig,
    tls: TlsConfig,
    timeouts: TimeoutProfiles,
    agents: Mutex<HashMap<AgentKey, Arc<Agent>>>,
}

impl AgentPool {
    pub fn new(config: PoolConfig, tls: TlsConfig, timeouts: TimeoutProfiles) -> Self {
        Self {
            config,
            tls,
            timeouts,
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<AgentKey, Arc<Agent>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Agent for `url` and `class`; the flag is true on a pool hit
    pub fn agent_for(&self, url: &Url, class: OperationClass) -> Result<(Arc<Agent>, bool)> {
        let key = AgentKey::from_url(url, class)?;
        let mut agents = self.agents();

        if let Some(agent) = agents.get(&key) {
            return Ok((Arc::clone(agent), true));
        }

        let agent = Arc::new(self.build_agent(key.clone())?);
        debug!(agent = %key, "created agent");
        agents.insert(key, Arc::clone(&agent));
        Ok((agent, false))
    }

    fn build_agent(&self, key: AgentKey) -> Result<Agent> {
        let profile = self.timeouts.for_class(key.class);
        let client = build_client(&key, profile, &self.config, &self.tls)?;
        Ok(Agent {
            key,
            client,
            sockets: Arc::new(Semaphore::new(self.config.max_sockets)),
            max_sockets: self.config.max_sockets,
            created_at: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.agents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents().is_empty()
    }

    /// Sockets checked out across all agents
    pub fn active_sockets(&self) -> usize {
        self.agents().values().map(|a| a.active_sockets()).sum()
    }

    /// Close and drop every agent; waiters for a socket fail with `CANCELLED`
    pub fn destroy(&self) {
        let drained: Vec<_> = self.agents().drain().map(|(_, agent)| agent).collect();
        for agent in &drained {
            agent.close();
        }
        debug!(agents = drained.len(), "agent pool destroyed");
    }
}

fn build_client(
    key: &AgentKey,
    profile: &TimeoutProfile,
    config: &PoolConfig,
    tls: &TlsConfig,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(profile.connection)
        .pool_idle_timeout(profile.idle)
        .pool_max_idle_per_host(config.max_idle_sockets)
        .tcp_keepalive(config.keep_alive)
        .tcp_nodelay(true)
        // a followed redirect turns the POST into a body-less GET
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(config.user_agent.as_str());

    if !config.use_system_proxy {
        builder = builder.no_proxy();
    }
    if key.scheme == "https" {
        builder = tls.apply(builder)?;
    }

    builder
        .build()
        .map_err(|e| Error::configuration(format!("failed to build HTTP agent for {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn pool() -> AgentPool {
        AgentPool::new(
            PoolConfig {
                max_sockets: 2,
                max_idle_sockets: 1,
                use_system_proxy: false,
                ..Default::default()
            },
            TlsConfig::default(),
            TimeoutProfiles::default(),
        )
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_hit_and_miss() {
        let pool = pool();
        let (first, hit) = pool
            .agent_for(&url("https://ofx.bank.example/a"), OperationClass::Quick)
            .unwrap();
        assert!(!hit);
        let (second, hit) = pool
            .agent_for(&url("https://OFX.bank.example/b?x=1"), OperationClass::Quick)
            .unwrap();
        assert!(hit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_agents_are_keyed_by_class_and_scheme() {
        let pool = pool();
        pool.agent_for(&url("https://h.example/"), OperationClass::Quick).unwrap();
        pool.agent_for(&url("https://h.example/"), OperationClass::Heavy).unwrap();
        pool.agent_for(&url("http://h.example/"), OperationClass::Quick).unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = pool()
            .agent_for(&url("ftp://h.example/"), OperationClass::Quick)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[tokio::test]
    async fn test_socket_limit_and_destroy() {
        let pool = pool();
        let (agent, _) = pool
            .agent_for(&url("http://h.example/"), OperationClass::Standard)
            .unwrap();

        let a = agent.acquire_socket().await.unwrap();
        let _b = agent.acquire_socket().await.unwrap();
        assert_eq!(agent.active_sockets(), 2);
        assert_eq!(pool.active_sockets(), 2);
        drop(a);
        assert_eq!(agent.active_sockets(), 1);

        pool.destroy();
        assert!(pool.is_empty());
        let err = agent.acquire_socket().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[test]
    fn test_config_validation_and_overrides() {
        assert!(PoolConfig::default().validate().is_ok());
        let merged = PoolOverrides {
            max_sockets: Some(0),
            ..Default::default()
        }
        .apply_to(&PoolConfig::default());
        assert!(merged.validate().is_err());

        let merged = PoolOverrides {
            user_agent: Some("Quicken/2700".into()),
            ..Default::default()
        }
        .apply_to(&PoolConfig::default());
        assert_eq!(merged.user_agent, "Quicken/2700");
        assert_eq!(merged.max_sockets, 10);
    }
}
