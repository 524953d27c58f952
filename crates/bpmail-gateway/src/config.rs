//! Runtime configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Top-level gateway configuration shared by both binaries.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    /// Root directory of the transport spool.
    pub spool_dir: PathBuf,
    /// Endpoint identifier of this node (`ipn:<node>.<service>`).
    pub local_eid: String,
    /// Receive timeout; `None` blocks until a delivery or an interrupt.
    #[serde(default)]
    pub receive_timeout_secs: Option<u64>,
    /// Transmission profiles accepted by the transport.
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileConfig>,
    /// Naming-system resolver settings.
    #[serde(default)]
    pub resolver: ResolverSettings,
}

impl GatewayConfig {
    /// Loads configuration from TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_owned(),
            source: err,
        })?;
        Self::from_toml_str(&data)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let cfg = toml::from_str::<Self>(data).map_err(ConfigError::Toml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Returns the profile with `id`, if configured.
    #[must_use]
    pub fn profile(&self, id: u32) -> Option<&ProfileConfig> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.spool_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("spool_dir is empty".to_owned()));
        }
        if !self.local_eid.starts_with(bpmail_core::IPN_SCHEME) {
            return Err(ConfigError::Invalid(format!(
                "local_eid `{}` does not use the ipn scheme",
                self.local_eid
            )));
        }
        if self.resolver.attempts == 0 {
            return Err(ConfigError::Invalid(
                "resolver.attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Transmission profile.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    /// Profile identifier used on the command line.
    pub id: u32,
    /// Seconds a queued payload stays deliverable.
    #[serde(default = "default_lifespan_secs")]
    pub lifespan_secs: u64,
}

/// Naming-system resolver settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ResolverSettings {
    /// Comma-separated `host[:port]` list overriding the system resolvers.
    #[serde(default)]
    pub servers: Option<String>,
    /// Per-query timeout.
    #[serde(default = "default_resolver_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per server.
    #[serde(default = "default_resolver_attempts")]
    pub attempts: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            servers: None,
            timeout_secs: default_resolver_timeout_secs(),
            attempts: default_resolver_attempts(),
        }
    }
}

/// Embedded example configuration template.
pub const EXAMPLE_CONFIG_TOML: &str = include_str!("../bpmail.example.toml");

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File read error.
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// TOML parse error.
    #[error("failed to parse config toml: {0}")]
    Toml(toml::de::Error),
    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_profiles() -> Vec<ProfileConfig> {
    vec![ProfileConfig {
        id: 1,
        lifespan_secs: default_lifespan_secs(),
    }]
}

fn default_lifespan_secs() -> u64 {
    86_400
}

fn default_resolver_timeout_secs() -> u64 {
    5
}

fn default_resolver_attempts() -> usize {
    2
}
