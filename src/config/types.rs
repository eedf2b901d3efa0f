//! Configuration types for wgveil
//!
//! Configuration is loaded from JSON and validated at startup. A config
//! describes one or more relay server instances that run side by side,
//! each with its own listen address, obfuscation mode, and WireGuard
//! endpoint.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::io::MAX_BATCH_SIZE;
use crate::packet::handler_for_mode;
use crate::relay::MINIMUM_MTU;

/// Default packets per batch on the session relay paths
pub const DEFAULT_RELAY_BATCH_SIZE: usize = 64;

/// Default packets per batch on the main ingress receive path
pub const DEFAULT_MAIN_RECV_BATCH_SIZE: usize = 64;

/// Default per-session send queue capacity
pub const DEFAULT_SEND_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound for the per-session send queue capacity
const MAX_SEND_CHANNEL_CAPACITY: usize = 65536;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Relay server instances
    pub servers: Vec<ServerConfig>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any server is invalid or names collide.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::validation(
                "at least one server must be configured",
            ));
        }

        let mut names = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::validation(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            servers: vec![ServerConfig {
                name: "server".into(),
                proxy_listen: "0.0.0.0:20220".into(),
                proxy_mode: "zero-overhead".into(),
                proxy_psk: String::new(),
                proxy_fwmark: 0,
                wg_endpoint: "127.0.0.1:51820".into(),
                wg_fwmark: 0,
                mtu: 1500,
                perf: PerfConfig::default(),
            }],
            log: LogConfig::default(),
        }
    }
}

/// Configuration for one relay server instance
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Instance name, used in log events
    pub name: String,

    /// Proxy-side listen address (`host:port`)
    pub proxy_listen: String,

    /// Packet handler selection: `zero-overhead` or `paranoid`
    pub proxy_mode: String,

    /// Base64-encoded preshared key; required by `paranoid` mode
    #[serde(default)]
    pub proxy_psk: String,

    /// fwmark for the proxy socket (0 = unset)
    #[serde(default)]
    pub proxy_fwmark: u32,

    /// WireGuard endpoint address (`host:port`), resolved at start
    pub wg_endpoint: String,

    /// fwmark for per-session upstream sockets (0 = unset)
    #[serde(default)]
    pub wg_fwmark: u32,

    /// Interface MTU on the proxy side; minimum 1280
    pub mtu: usize,

    /// Performance tuning knobs
    #[serde(flatten)]
    pub perf: PerfConfig,
}

impl ServerConfig {
    /// Validate this server's configuration without building it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on an empty name or listen address, an MTU
    /// below 1280, invalid perf values, an unknown proxy mode, or a PSK
    /// the mode cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::validation("server name must not be empty"));
        }
        if self.proxy_listen.is_empty() {
            return Err(ConfigError::validation(format!(
                "server {}: proxy_listen must not be empty",
                self.name
            )));
        }
        if self.wg_endpoint.is_empty() {
            return Err(ConfigError::validation(format!(
                "server {}: wg_endpoint must not be empty",
                self.name
            )));
        }
        if self.mtu < MINIMUM_MTU {
            return Err(ConfigError::MtuTooSmall { mtu: self.mtu });
        }

        self.perf.clone().check_and_apply_defaults()?;

        let psk = self.decode_psk()?;
        handler_for_mode(&self.proxy_mode, &psk).map(drop)
    }

    /// Decode the base64 PSK field.
    ///
    /// An empty field decodes to an empty key, which the passthrough mode
    /// accepts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPsk`] on malformed base64.
    pub fn decode_psk(&self) -> Result<Vec<u8>, ConfigError> {
        if self.proxy_psk.is_empty() {
            return Ok(Vec::new());
        }
        BASE64_STANDARD
            .decode(&self.proxy_psk)
            .map_err(|e| ConfigError::invalid_psk(format!("invalid base64: {e}")))
    }
}

/// Performance tuning for one server instance
///
/// A zero value selects the default; explicit values are range-checked.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PerfConfig {
    /// Relay implementation: `""` (auto), `"no"` (generic), or
    /// `"sendmmsg"` (batched)
    #[serde(default)]
    pub batch_mode: String,

    /// Packets per batch on the session relay paths (0 = default 64)
    #[serde(default)]
    pub relay_batch_size: usize,

    /// Packets per batch on the main ingress receive path (0 = default 64)
    #[serde(default)]
    pub main_recv_batch_size: usize,

    /// Per-session send queue capacity (0 = default 1024)
    #[serde(default)]
    pub send_channel_capacity: usize,
}

impl PerfConfig {
    /// Validate values and replace zeros with defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an unknown batch mode or
    /// out-of-range sizes.
    pub fn check_and_apply_defaults(&mut self) -> Result<(), ConfigError> {
        match self.batch_mode.as_str() {
            "" | "no" | "sendmmsg" => {}
            mode => {
                return Err(ConfigError::validation(format!(
                    "unknown batch_mode: {mode} (expected \"\", \"no\", or \"sendmmsg\")"
                )));
            }
        }

        match self.relay_batch_size {
            0 => self.relay_batch_size = DEFAULT_RELAY_BATCH_SIZE,
            1..=MAX_BATCH_SIZE => {}
            n => {
                return Err(ConfigError::validation(format!(
                    "relay_batch_size {n} out of range [1, {MAX_BATCH_SIZE}]"
                )));
            }
        }

        match self.main_recv_batch_size {
            0 => self.main_recv_batch_size = DEFAULT_MAIN_RECV_BATCH_SIZE,
            1..=MAX_BATCH_SIZE => {}
            n => {
                return Err(ConfigError::validation(format!(
                    "main_recv_batch_size {n} out of range [1, {MAX_BATCH_SIZE}]"
                )));
            }
        }

        match self.send_channel_capacity {
            0 => self.send_channel_capacity = DEFAULT_SEND_CHANNEL_CAPACITY,
            1..=MAX_SEND_CHANNEL_CAPACITY => {}
            n => {
                return Err(ConfigError::validation(format!(
                    "send_channel_capacity {n} out of range [1, {MAX_SEND_CHANNEL_CAPACITY}]"
                )));
            }
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_server() -> ServerConfig {
        ServerConfig {
            name: "test".into(),
            proxy_listen: "127.0.0.1:20220".into(),
            proxy_mode: "zero-overhead".into(),
            proxy_psk: String::new(),
            proxy_fwmark: 0,
            wg_endpoint: "127.0.0.1:51820".into(),
            wg_fwmark: 0,
            mtu: 1500,
            perf: PerfConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default_config().validate().unwrap();
    }

    #[test]
    fn test_mtu_boundary() {
        let mut server = base_server();
        server.mtu = 1280;
        server.validate().unwrap();

        server.mtu = 1279;
        assert!(matches!(
            server.validate(),
            Err(ConfigError::MtuTooSmall { mtu: 1279 })
        ));
    }

    #[test]
    fn test_unknown_proxy_mode() {
        let mut server = base_server();
        server.proxy_mode = "rot13".into();
        assert!(matches!(
            server.validate(),
            Err(ConfigError::UnknownProxyMode { .. })
        ));
    }

    #[test]
    fn test_paranoid_requires_psk() {
        let mut server = base_server();
        server.proxy_mode = "paranoid".into();
        assert!(matches!(
            server.validate(),
            Err(ConfigError::InvalidPsk { .. })
        ));

        server.proxy_psk = BASE64_STANDARD.encode([0x42u8; 32]);
        server.validate().unwrap();

        server.proxy_psk = "not base64!!!".into();
        assert!(matches!(
            server.validate(),
            Err(ConfigError::InvalidPsk { .. })
        ));

        server.proxy_psk = BASE64_STANDARD.encode([0x42u8; 16]);
        assert!(matches!(
            server.validate(),
            Err(ConfigError::InvalidPsk { .. })
        ));
    }

    #[test]
    fn test_perf_defaults_applied() {
        let mut perf = PerfConfig::default();
        perf.check_and_apply_defaults().unwrap();
        assert_eq!(perf.relay_batch_size, DEFAULT_RELAY_BATCH_SIZE);
        assert_eq!(perf.main_recv_batch_size, DEFAULT_MAIN_RECV_BATCH_SIZE);
        assert_eq!(perf.send_channel_capacity, DEFAULT_SEND_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_perf_validation() {
        let mut perf = PerfConfig {
            batch_mode: "dpdk".into(),
            ..PerfConfig::default()
        };
        assert!(perf.check_and_apply_defaults().is_err());

        let mut perf = PerfConfig {
            relay_batch_size: MAX_BATCH_SIZE + 1,
            ..PerfConfig::default()
        };
        assert!(perf.check_and_apply_defaults().is_err());

        // A capacity of 1 is legal; overflow policy handles the rest.
        let mut perf = PerfConfig {
            send_channel_capacity: 1,
            ..PerfConfig::default()
        };
        perf.check_and_apply_defaults().unwrap();
        assert_eq!(perf.send_channel_capacity, 1);
    }

    #[test]
    fn test_duplicate_server_names() {
        let mut config = Config {
            servers: vec![base_server(), base_server()],
            log: LogConfig::default(),
        };
        assert!(config.validate().is_err());

        config.servers[1].name = "other".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_server_list() {
        let config = Config {
            servers: Vec::new(),
            log: LogConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
