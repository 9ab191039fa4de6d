//! Preview configuration.
//!
//! Every field has a default matching the reference system, so an empty
//! TOML file (or no file at all) yields a working setup against a relay on
//! `127.0.0.1:1984`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PreviewError, Result};
use crate::ice::IceServerConfig;
use crate::peer::MAX_POOL_SIZE;

/// Top-level configuration for a [`crate::PreviewManager`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Base URL of the local relay
    pub relay_url: String,
    /// How long a relay availability answer stays valid
    pub probe_ttl_ms: u64,
    /// Upper bound on a single availability probe
    pub probe_timeout_ms: u64,
    /// Upper bound on relay HTTP requests other than the probe
    pub request_timeout_ms: u64,
    /// Grace period for local ICE gathering before the offer is sent anyway
    pub ice_gather_grace_ms: u64,
    /// How long to wait for the first inbound track (request/response negotiation)
    pub track_timeout_ms: u64,
    /// Overall bound on a message-based negotiation
    pub signaling_timeout_ms: u64,
    pub pool: PoolConfig,
    pub retry: BackoffConfig,
    pub ice_servers: Vec<IceServerConfig>,
}

/// Transport pool sizing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Sessions created ahead of time by [`crate::PreviewManager::pre_warm`]
    pub pre_warm: usize,
}

/// Exponential backoff parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:1984".to_string(),
            probe_ttl_ms: 2_000,
            probe_timeout_ms: 1_500,
            request_timeout_ms: 5_000,
            ice_gather_grace_ms: 50,
            track_timeout_ms: 10_000,
            signaling_timeout_ms: 15_000,
            pool: PoolConfig::default(),
            retry: BackoffConfig::default(),
            ice_servers: Vec::new(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: MAX_POOL_SIZE,
            pre_warm: 2,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            factor: 2.0,
        }
    }
}

impl PreviewConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PreviewConfig =
            toml::from_str(text).map_err(|e| PreviewError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PreviewError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.relay_url)
            .map_err(|e| PreviewError::Config(format!("relay_url: {}", e)))?;

        let timeouts = [
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("ice_gather_grace_ms", self.ice_gather_grace_ms),
            ("track_timeout_ms", self.track_timeout_ms),
            ("signaling_timeout_ms", self.signaling_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(PreviewError::Config(format!("{} must be greater than zero", name)));
        }

        if self.pool.max_size == 0 {
            return Err(PreviewError::Config("pool.max_size must be at least 1".into()));
        }
        if self.retry.factor < 1.0 {
            return Err(PreviewError::Config("retry.factor must be >= 1.0".into()));
        }
        if self.retry.initial_ms == 0 || self.retry.max_ms < self.retry.initial_ms {
            return Err(PreviewError::Config(
                "retry.initial_ms must be non-zero and not exceed retry.max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_ttl(&self) -> Duration {
        Duration::from_millis(self.probe_ttl_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ice_gather_grace(&self) -> Duration {
        Duration::from_millis(self.ice_gather_grace_ms)
    }

    pub fn track_timeout(&self) -> Duration {
        Duration::from_millis(self.track_timeout_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }
}
