//! pool.toml configuration parser.
//!
//! ```toml
//! host = "cache.internal:11210"
//! username = "sessions"
//! password = "s3cret"
//!
//! [pool]
//! pool_size = 16
//! pool_overflow = 8
//! acquire_timeout_ms = 2500
//!
//! [transport]
//! connect_timeout_ms = 1000
//! recv_timeout_ms = 10000
//! tls = true
//! ```
//!
//! Every section and field except `host` is optional. A timeout of `0`
//! disables that timeout.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthHandler, BasicAuth, DEFAULT_USER};
use crate::client::TcpConnectionFactory;
use crate::client::transport::{TlsConfig, TransportOptions};
use crate::error::ClientError;
use crate::pool::{ConnectionPool, PoolConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFileConfig {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool: Option<PoolSection>,
    pub transport: Option<TransportSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSection {
    pub pool_size: Option<usize>,
    pub pool_overflow: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSection {
    pub connect_timeout_ms: Option<u64>,
    pub recv_timeout_ms: Option<u64>,
    pub tls: Option<bool>,
}

impl PoolFileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        let s = toml::to_string_pretty(self)?;
        Ok(s)
    }

    /// Pool sizing, with defaults for anything left unset.
    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        let Some(section) = &self.pool else {
            return defaults;
        };
        PoolConfig {
            pool_size: section.pool_size.unwrap_or(defaults.pool_size),
            pool_overflow: section.pool_overflow.unwrap_or(defaults.pool_overflow),
            acquire_timeout: section
                .acquire_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
        }
    }

    /// Transport options. Fails only if TLS is requested and the root store
    /// cannot be built.
    pub fn transport_options(&self) -> Result<TransportOptions, ClientError> {
        let mut options = TransportOptions::default();
        let Some(section) = &self.transport else {
            return Ok(options);
        };
        if let Some(ms) = section.connect_timeout_ms {
            options.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = section.recv_timeout_ms {
            options.recv_timeout = Duration::from_millis(ms);
        }
        if section.tls.unwrap_or(false) {
            options.tls = Some(TlsConfig::with_system_roots()?);
        }
        Ok(options)
    }

    /// Credentials from the file; the anonymous user when no username is set.
    pub fn credentials(&self) -> BasicAuth {
        BasicAuth::new(
            self.username.as_deref().unwrap_or(DEFAULT_USER),
            self.password.as_deref().unwrap_or_default(),
        )
    }

    /// Build a memcached pool from this configuration.
    pub fn build_pool(&self) -> Result<ConnectionPool, ClientError> {
        let auth: Arc<dyn AuthHandler> = Arc::new(self.credentials());
        let factory = TcpConnectionFactory::new(self.transport_options()?);
        Ok(ConnectionPool::with_factory(
            self.host.clone(),
            auth,
            self.pool_config(),
            Arc::new(factory),
        ))
    }
}
