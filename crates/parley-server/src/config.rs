//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_PORT, MAX_CHUNK_SIZE, MAX_TRANSFER_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the chat listener binds to.
    /// Env: `PARLEY_BIND_ADDR`
    /// Default: `0.0.0.0`
    pub bind_addr: IpAddr,

    /// TCP port of the chat listener.
    /// Env: `PARLEY_PORT`
    /// Default: `4444`
    pub port: u16,

    /// Maximum number of concurrent connections, authenticated or not
    /// (0 = unlimited).
    /// Env: `PARLEY_MAX_CONNECTIONS`
    /// Default: `64`
    pub max_connections: usize,

    /// Time a new connection has to authenticate.
    /// Env: `PARLEY_LOGIN_TIMEOUT_SECS`
    /// Default: `30`
    pub login_timeout: Duration,

    /// Largest file-transfer chunk the relay forwards.
    /// Env: `PARLEY_MAX_CHUNK_SIZE`
    /// Default: 512 KiB
    pub max_chunk_size: usize,

    /// Largest file a manifest may announce.
    /// Env: `PARLEY_MAX_TRANSFER_BYTES`
    /// Default: 50 MiB
    pub max_transfer_bytes: u64,

    /// Credential store file.
    /// Env: `PARLEY_CREDENTIALS_PATH`
    /// Default: `./accounts.db`
    pub credentials_path: PathBuf,

    /// Blacklist file (one IP per line).
    /// Env: `PARLEY_BLACKLIST_PATH`
    /// Default: `./blacklist.txt`
    pub blacklist_path: PathBuf,

    /// Blacklist the source address of a session caught forging its
    /// sender ID.
    /// Env: `PARLEY_BLACKLIST_ON_TAMPER` (true/false)
    /// Default: `false`
    pub blacklist_on_tamper: bool,

    /// Socket address for the admin HTTP API.
    /// Env: `PARLEY_HTTP_ADDR`
    /// Default: `127.0.0.1:8081`
    pub http_addr: SocketAddr,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `PARLEY_ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Human-readable name for this relay.
    /// Env: `PARLEY_SERVER_NAME`
    /// Default: `"Parley Relay"`
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            max_connections: 64,
            login_timeout: Duration::from_secs(30),
            max_chunk_size: MAX_CHUNK_SIZE,
            max_transfer_bytes: MAX_TRANSFER_SIZE,
            credentials_path: PathBuf::from("./accounts.db"),
            blacklist_path: PathBuf::from("./blacklist.txt"),
            blacklist_on_tamper: false,
            http_addr: ([127, 0, 0, 1], DEFAULT_HTTP_PORT).into(),
            admin_token: None,
            server_name: "Parley Relay".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "PARLEY_BIND_ADDR", &mut config.bind_addr);
        parse_into(&lookup, "PARLEY_PORT", &mut config.port);
        parse_into(&lookup, "PARLEY_MAX_CONNECTIONS", &mut config.max_connections);
        parse_into(&lookup, "PARLEY_MAX_TRANSFER_BYTES", &mut config.max_transfer_bytes);
        parse_into(&lookup, "PARLEY_HTTP_ADDR", &mut config.http_addr);

        let mut login_secs = config.login_timeout.as_secs();
        parse_into(&lookup, "PARLEY_LOGIN_TIMEOUT_SECS", &mut login_secs);
        config.login_timeout = Duration::from_secs(login_secs.max(1));

        parse_into(&lookup, "PARLEY_MAX_CHUNK_SIZE", &mut config.max_chunk_size);
        if config.max_chunk_size == 0 || config.max_chunk_size > MAX_CHUNK_SIZE {
            tracing::warn!(
                value = config.max_chunk_size,
                "PARLEY_MAX_CHUNK_SIZE out of range, using default"
            );
            config.max_chunk_size = MAX_CHUNK_SIZE;
        }

        if let Some(path) = lookup("PARLEY_CREDENTIALS_PATH") {
            config.credentials_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("PARLEY_BLACKLIST_PATH") {
            config.blacklist_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("PARLEY_BLACKLIST_ON_TAMPER") {
            config.blacklist_on_tamper = val == "true" || val == "1";
        }

        if let Some(token) = lookup("PARLEY_ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(name) = lookup("PARLEY_SERVER_NAME") {
            config.server_name = name;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr(), SocketAddr::from(([0, 0, 0, 0], 4444)));
        assert_eq!(config.max_connections, 64);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PARLEY_PORT", "5555"),
            ("PARLEY_MAX_CONNECTIONS", "2"),
            ("PARLEY_LOGIN_TIMEOUT_SECS", "5"),
            ("PARLEY_BLACKLIST_ON_TAMPER", "true"),
            ("PARLEY_ADMIN_TOKEN", "s3cret"),
        ]);
        assert_eq!(config.port, 5555);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.login_timeout, Duration::from_secs(5));
        assert!(config.blacklist_on_tamper);
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("PARLEY_PORT", "not-a-port"),
            ("PARLEY_MAX_CHUNK_SIZE", "0"),
            ("PARLEY_ADMIN_TOKEN", ""),
        ]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_chunk_size, MAX_CHUNK_SIZE);
        assert!(config.admin_token.is_none());
    }
}
