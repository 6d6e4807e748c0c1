//! Relay configuration
//!
//! Values come from, in increasing priority:
//! - built-in defaults (port 5000, all interfaces, `./public`)
//! - an optional TOML file passed with `--config`
//! - command line flags and the `PORT`, `BIND` and `PUBLIC_DIR` environment
//!   variables

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::{DEFAULT_PORT, DEFAULT_PUBLIC_DIR};

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listening port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Directory served to plain HTTP requests
    pub public_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_dir: PathBuf::from(DEFAULT_PUBLIC_DIR),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: RelayConfig = toml::from_str(&content)?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply values given on the command line or through the environment
    pub fn with_overrides(
        mut self,
        port: Option<u16>,
        bind: Option<IpAddr>,
        public_dir: Option<PathBuf>,
    ) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(bind) = bind {
            self.bind = bind;
        }
        if let Some(dir) = public_dir {
            self.public_dir = dir;
        }
        self
    }

    /// Socket address to listen on
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.addr().to_string(), "0.0.0.0:5000");
        assert_eq!(config.public_dir, PathBuf::from("public"));
    }

    #[test]
    fn test_partial_config() {
        let config: RelayConfig = toml::from_str("port = 7000").unwrap();
        assert_eq!(config.port, 7000);
        // Other values should be defaults
        assert_eq!(config.public_dir, PathBuf::from("public"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = RelayConfig::load_from(Path::new("/nonexistent/filebeam.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 6100\nbind = \"127.0.0.1\"\npublic_dir = \"/srv/www\"").unwrap();

        let config = tokio_test::assert_ok!(RelayConfig::load_from(file.path()));
        assert_eq!(config.addr().to_string(), "127.0.0.1:6100");
        assert_eq!(config.public_dir, PathBuf::from("/srv/www"));
    }

    #[test]
    fn test_config_load_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();

        let err = tokio_test::assert_err!(RelayConfig::load_from(file.path()));
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overrides_win() {
        let config = RelayConfig::default().with_overrides(
            Some(8123),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            None,
        );
        assert_eq!(config.addr().to_string(), "127.0.0.1:8123");
        assert_eq!(config.public_dir, PathBuf::from("public"));
    }

    #[test]
    fn test_sample_config() {
        let sample = RelayConfig::sample();
        assert!(sample.contains("port = 5000"));
        assert!(sample.contains("public_dir"));
    }
}
