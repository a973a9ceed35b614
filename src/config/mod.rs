//! Startup configuration loaded from a TOML file.
//!
//! Every key is optional and falls back to its default. A missing file yields
//! the defaults; a file that exists but cannot be read or parsed is fatal.
//!
//! ```toml
//! [proxy]
//! host = "0.0.0.0"
//! port = 8000
//! max_connections = 0
//! timeout = 30
//!
//! [apache]
//! host = "127.0.0.1"
//! port = 80
//! timeout = 30
//!
//! [cache]
//! expiration_time = 60
//! sweep_interval = 0
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::warn;

/// Errors produced while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub proxy: ListenerConfig,
    pub apache: BackendConfig,
    pub cache: CacheConfig,
}

/// The `[proxy]` section: where clients connect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of connections handled at once; `0` means unbounded.
    pub max_connections: usize,
    /// Seconds a client has to send its request; `0` disables the bound.
    pub timeout: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 8000,
            max_connections: 0,
            timeout: 30,
        }
    }
}

/// The `[apache]` section: the single backend every miss is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Seconds allowed for connect, write and each read; `0` disables the bound.
    pub timeout: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 80,
            timeout: 30,
        }
    }
}

/// The `[cache]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Seconds an entry stays fresh.
    pub expiration_time: u64,
    /// Seconds between background purges; `0` keeps eviction lazy.
    pub sweep_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration_time: 60,
            sweep_interval: 0,
        }
    }
}

impl Config {
    /// Loads the configuration at `path`, falling back to defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Read`] if the file exists but cannot be read.
    /// - [`ConfigError::Parse`] if the contents are not valid TOML for this schema,
    ///   e.g. a negative `expiration_time`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "configuration file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source: e,
                });
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Returns the `host:port` the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    /// Returns the `host:port` of the backend.
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.apache.host, self.apache.port)
    }

    /// Returns how long cached responses stay fresh.
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.cache.expiration_time)
    }

    /// Returns the backend I/O bound, if enabled.
    pub fn backend_timeout(&self) -> Option<Duration> {
        (self.apache.timeout > 0).then(|| Duration::from_secs(self.apache.timeout))
    }

    /// Returns the bound on waiting for a client's request, if enabled.
    pub fn client_timeout(&self) -> Option<Duration> {
        (self.proxy.timeout > 0).then(|| Duration::from_secs(self.proxy.timeout))
    }

    /// Returns the connection limit, if enabled, capped at [`Semaphore::MAX_PERMITS`].
    pub fn max_connections(&self) -> Option<usize> {
        (self.proxy.max_connections > 0)
            .then(|| self.proxy.max_connections.min(Semaphore::MAX_PERMITS))
    }

    /// Returns the sweeper period, if enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.cache.sweep_interval > 0).then(|| Duration::from_secs(self.cache.sweep_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8000");
        assert_eq!(config.backend_addr(), "127.0.0.1:80");
        assert_eq!(config.expiration(), Duration::from_secs(60));
        assert_eq!(config.backend_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.client_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_connections(), None);
        assert_eq!(config.sweep_interval(), None);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            port = 9000

            [cache]
            expiration_time = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
        assert_eq!(config.backend_addr(), "127.0.0.1:80");
        assert_eq!(config.expiration(), Duration::from_secs(5));
    }

    #[test]
    fn huge_connection_limit_is_capped() {
        let config: Config =
            toml::from_str("[proxy]\nmax_connections = 9223372036854775807\ntimeout = 0\n").unwrap();
        assert_eq!(config.max_connections(), Some(Semaphore::MAX_PERMITS));
        assert_eq!(config.client_timeout(), None);
    }

    #[test]
    fn negative_expiration_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[cache]\nexpiration_time = -1\n");
        assert!(result.is_err());
    }

    #[test]
    fn non_integer_expiration_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[cache]\nexpiration_time = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[apache]\nhost = \"10.0.0.2\"\nport = 8080\ntimeout = 0\n\n[proxy]\nmax_connections = 64"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backend_addr(), "10.0.0.2:8080");
        assert_eq!(config.backend_timeout(), None);
        assert_eq!(config.max_connections(), Some(64));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache\nexpiration_time = 60").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn directory_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
