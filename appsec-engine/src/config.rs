use crate::engine::rules::PolicySource;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7422";
pub const DEFAULT_LAPI_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed engine config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("engine name must not be empty")]
    MissingName,
    #[error("invalid listen_addr '{addr}': {source}")]
    InvalidListenAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("no listener configured: listen_addr and listen_socket are both empty")]
    NoListener,
    #[error("cert_file and key_file must be configured together")]
    PartialTls,
    #[error("path must start with '/': got '{0}'")]
    InvalidPathPrefix(String),
    #[error("one of appsec_config or appsec_config_path is required")]
    MissingRuleConfig,
    #[error("auth_cache_duration must be positive")]
    InvalidAuthCacheDuration,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_lapi_url() -> String {
    DEFAULT_LAPI_URL.to_string()
}

fn default_auth_cache_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_max_body_size() -> usize {
    64 * 1024
}

/// Engine configuration, parsed strictly from YAML. Unknown keys are
/// rejected so that typos surface at startup rather than as silently
/// ignored settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Engine name stamped on requests, metrics and emitted events.
    pub name: String,
    #[serde(default)]
    pub listen_addr: Option<String>,
    #[serde(default)]
    pub listen_socket: Option<PathBuf>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// URL prefix the handler is mounted under.
    #[serde(default = "default_path")]
    pub path: String,
    /// Runner count; 0 is coerced to 1.
    #[serde(default)]
    pub routines: usize,
    #[serde(default)]
    pub appsec_config: Option<String>,
    #[serde(default)]
    pub appsec_config_path: Option<PathBuf>,
    /// Base URL of the upstream decision service used for API-key probes.
    #[serde(default = "default_lapi_url")]
    pub lapi_url: String,
    #[serde(default = "default_auth_cache_duration", with = "humantime_serde")]
    pub auth_cache_duration: Duration,
    /// Directory handed to rule primitives that reference external resources.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Free-form labels copied onto every emitted security event.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(skip)]
    resolved_addr: Option<SocketAddr>,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: EngineConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// TCP bind address, if the TCP listener is enabled.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.resolved_addr
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Rule configuration reference handed to the external compiler. The
    /// filesystem path wins when both forms are set.
    pub fn policy_source(&self) -> Option<PolicySource> {
        if let Some(path) = &self.appsec_config_path {
            return Some(PolicySource::File(path.clone()));
        }
        self.appsec_config
            .as_ref()
            .map(|name| PolicySource::Named(name.clone()))
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }

        // An explicitly empty listen_addr disables the TCP listener; the
        // default address only applies when nothing is configured at all.
        let addr = match self.listen_addr.as_deref().map(str::trim) {
            None => {
                if self.listen_socket.is_none() {
                    Some(DEFAULT_LISTEN_ADDR.to_string())
                } else {
                    None
                }
            }
            Some("") => None,
            Some(addr) => Some(addr.to_string()),
        };
        self.resolved_addr = match addr {
            Some(addr) => Some(addr.parse().map_err(|source| {
                ConfigError::InvalidListenAddr { addr, source }
            })?),
            None => None,
        };
        if self.resolved_addr.is_none() && self.listen_socket.is_none() {
            return Err(ConfigError::NoListener);
        }

        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::PartialTls);
        }

        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPathPrefix(self.path.clone()));
        }

        if self.routines == 0 {
            self.routines = 1;
        }

        if self.appsec_config.is_none() && self.appsec_config_path.is_none() {
            return Err(ConfigError::MissingRuleConfig);
        }

        if self.auth_cache_duration.is_zero() {
            return Err(ConfigError::InvalidAuthCacheDuration);
        }

        Ok(())
    }
}
