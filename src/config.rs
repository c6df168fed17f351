//! Runtime configuration read from environment variables.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";

pub const PORT_VAR: &str = "SPOTIT_PORT";
pub const HOST_VAR: &str = "SPOTIT_HOST";
pub const DOWNLOADS_DIR_VAR: &str = "SPOTIT_DOWNLOADS_DIR";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub downloads_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var(PORT_VAR).ok(),
            env::var(HOST_VAR).ok(),
            env::var(DOWNLOADS_DIR_VAR).ok(),
        )
    }

    /// Unparsable or empty values fall back to the defaults instead of
    /// failing startup.
    fn from_vars(port: Option<String>, host: Option<String>, downloads_dir: Option<String>) -> Self {
        let port = port
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let host = host
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_owned());
        let downloads_dir = downloads_dir
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_DIR));

        Self {
            host,
            port,
            downloads_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ServerConfig::from_vars(None, None, None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.downloads_dir, PathBuf::from(DEFAULT_DOWNLOADS_DIR));
    }

    #[test]
    fn values_override_defaults() {
        let config = ServerConfig::from_vars(
            Some("4242".into()),
            Some("127.0.0.1".into()),
            Some("/srv/music".into()),
        );
        assert_eq!(config.port, 4242);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.downloads_dir, PathBuf::from("/srv/music"));
    }

    #[test]
    fn bad_port_and_empty_values_fall_back() {
        let config =
            ServerConfig::from_vars(Some("not-a-port".into()), Some(String::new()), Some(String::new()));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.downloads_dir, PathBuf::from(DEFAULT_DOWNLOADS_DIR));
    }
}
