//! Configuration: a fixed set of listeners loaded once at process startup.
//!
//! Hot-reloading (present in the teacher crate this one descends from) is deliberately dropped —
//! this proxy's listener set is fixed for the process lifetime, matching the "no persistent state
//! across process restarts" boundary: there is no live reconfiguration to persist or reload.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration: every listener the process should bind, plus observability knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// One listener: where it binds, what it forwards to (if fixed), and which protocol wraps it.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub mode: ProxyMode,
    pub listen_addr: SocketAddr,
    /// Required unless `mode == SocksClient`, where the target is learned per-connection.
    pub target_addr: Option<SocketAddr>,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyMode {
    SimpleClient,
    SimpleServer,
    SocksClient,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProtocolConfig {
    Identity,
    Xor { key: String },
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig::Identity
    }
}

impl ProtocolConfig {
    pub fn to_kind(&self) -> crate::protocol::ProtocolKind {
        match self {
            ProtocolConfig::Identity => crate::protocol::ProtocolKind::Identity,
            ProtocolConfig::Xor { key } => crate::protocol::ProtocolKind::Xor { key: key.as_bytes().to_vec() },
        }
    }
}

/// Metrics are a non-goal, but the log level passthrough is ambient stack, not a feature — kept
/// even though nothing else in this struct survived the trim from the teacher's richer
/// `ObservabilityConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        let config: ProxyConfig = toml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(Error::config("configuration defines no listeners"));
        }
        for listener in &self.listeners {
            if listener.mode != ProxyMode::SocksClient && listener.target_addr.is_none() {
                return Err(Error::config(format!(
                    "listener on {} requires target_addr unless mode is socks-client",
                    listener.listen_addr
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let toml = r#"
            [[listeners]]
            mode = "simple-client"
            listen_addr = "127.0.0.1:9000"
            target_addr = "127.0.0.1:9001"

            [listeners.protocol]
            kind = "identity"
        "#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].mode, ProxyMode::SimpleClient);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn socks_client_listener_needs_no_target() {
        let toml = r#"
            [[listeners]]
            mode = "socks-client"
            listen_addr = "127.0.0.1:9050"
        "#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn simple_client_without_target_is_rejected() {
        let toml = r#"
            [[listeners]]
            mode = "simple-client"
            listen_addr = "127.0.0.1:9000"
        "#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn xor_protocol_config_round_trips_into_a_kind() {
        let toml = r#"
            [[listeners]]
            mode = "simple-server"
            listen_addr = "127.0.0.1:9500"
            target_addr = "127.0.0.1:9001"

            [listeners.protocol]
            kind = "xor"
            key = "secret"
        "#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        match config.listeners[0].protocol.to_kind() {
            crate::protocol::ProtocolKind::Xor { key } => assert_eq!(key, b"secret"),
            _ => panic!("expected xor kind"),
        }
    }
}
