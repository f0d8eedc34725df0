//! TOML configuration for the host agent.
//!
//! ```toml
//! [agent]
//! device_id = "dev-1"
//! knock_secret_hex = "00112233445566778899aabbccddeeff"
//!
//! [network]
//! controller = "203.0.113.10:62201"   # omit for gateway-direct deployments
//! gateway_knock = "203.0.113.20:62202"
//! gateway_tls = "203.0.113.20:8443"
//!
//! [tls]
//! cert_path = "/etc/sdp/dev-1.crt"
//! key_path = "/etc/sdp/dev-1.key"
//! server_name = "gateway.example.com"
//! server_ca_path = "/etc/sdp/gateway-ca.crt"
//! # server_fingerprint = "<hex SHA-256 of the gateway certificate>"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sdp_core::{DeviceId, KnockBuilder, KnockSecret};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::sequencer::{Flow, GatewayEndpoints, SequencerSettings};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub knock_secret_hex: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Controller knock port.  `None` selects the gateway-direct flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<SocketAddr>,
    #[serde(default = "default_gateway_knock")]
    pub gateway_knock: SocketAddr,
    #[serde(default = "default_gateway_tls")]
    pub gateway_tls: SocketAddr,
    /// Local address knocks are sent from.
    #[serde(default = "default_knock_bind")]
    pub knock_bind: SocketAddr,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_path: PathBuf,
    #[serde(default)]
    pub key_path: PathBuf,
    /// Name checked against the gateway certificate when `server_ca_path`
    /// is used.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ca_path: Option<PathBuf>,
    /// Hex SHA-256 of the gateway's DER certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_fingerprint: Option<String>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_gateway_knock() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 62202))
}
fn default_gateway_tls() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8443))
}
fn default_knock_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}
fn default_reply_timeout_ms() -> u64 {
    2_000
}
fn default_settle_ms() -> u64 {
    50
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_server_name() -> String {
    "localhost".to_string()
}
fn default_handshake_timeout_secs() -> u64 {
    10
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            knock_secret_hex: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            controller: None,
            gateway_knock: default_gateway_knock(),
            gateway_tls: default_gateway_tls(),
            knock_bind: default_knock_bind(),
            reply_timeout_ms: default_reply_timeout_ms(),
            settle_ms: default_settle_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            server_name: default_server_name(),
            server_ca_path: None,
            server_fingerprint: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn flow(&self) -> Flow {
        match self.controller {
            Some(controller) => Flow::ViaController { controller },
            None => Flow::GatewayDirect,
        }
    }

    pub fn gateway(&self) -> GatewayEndpoints {
        GatewayEndpoints {
            knock: self.gateway_knock,
            tls: self.gateway_tls,
        }
    }

    pub fn sequencer_settings(&self) -> SequencerSettings {
        SequencerSettings {
            reply_timeout: Duration::from_millis(self.reply_timeout_ms.max(1)),
            settle: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// Decodes `server_fingerprint`, if set.
    pub fn server_fingerprint(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(hex_str) = &self.server_fingerprint else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| ConfigError::Invalid(format!("tls.server_fingerprint: {e}")))?;
        let fingerprint: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            ConfigError::Invalid(format!(
                "tls.server_fingerprint must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Some(fingerprint))
    }
}

impl AgentConfig {
    /// The knock builder for this device.
    pub fn knock_builder(&self) -> Result<KnockBuilder, ConfigError> {
        let device_id = DeviceId::new(self.agent.device_id.trim())
            .map_err(|e| ConfigError::Invalid(format!("agent.device_id: {e}")))?;
        let secret = KnockSecret::from_hex(self.agent.knock_secret_hex.trim())
            .map_err(|e| ConfigError::Invalid(format!("agent.knock_secret_hex: {e}")))?;
        Ok(KnockBuilder::new(device_id, secret))
    }

    /// Checks the settings that have no safe default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.knock_builder()?;
        if self.tls.cert_path.as_os_str().is_empty() || self.tls.key_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "tls.cert_path and tls.key_path are required".to_string(),
            ));
        }
        match (&self.tls.server_ca_path, self.tls.server_fingerprint()?) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ConfigError::Invalid(
                "set exactly one of tls.server_ca_path and tls.server_fingerprint".to_string(),
            )),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`.
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Writes `config` to `path`, creating parent directories.
pub fn save_config(config: &AgentConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn valid() -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.agent.device_id = "dev-1".to_string();
        cfg.agent.knock_secret_hex = "11".repeat(16);
        cfg.tls.cert_path = PathBuf::from("dev-1.crt");
        cfg.tls.key_path = PathBuf::from("dev-1.key");
        cfg.tls.server_ca_path = Some(PathBuf::from("ca.crt"));
        cfg
    }

    #[test]
    fn test_minimal_toml_fills_in_defaults() {
        // Arrange
        let toml_str = r#"
            [agent]
            device_id = "dev-1"
            knock_secret_hex = "00112233445566778899aabbccddeeff"

            [network]
            controller = "10.0.0.1:62201"
            gateway_knock = "10.0.0.2:62202"
            gateway_tls = "10.0.0.2:8443"
        "#;

        // Act
        let cfg: AgentConfig = toml::from_str(toml_str).unwrap();

        // Assert
        assert_eq!(
            cfg.network.flow(),
            Flow::ViaController {
                controller: "10.0.0.1:62201".parse().unwrap()
            }
        );
        assert_eq!(cfg.network.sequencer_settings().reply_timeout, Duration::from_secs(2));
        assert_eq!(cfg.tls.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.agent.log_level, "info");
    }

    #[test]
    fn test_missing_controller_selects_gateway_direct_flow() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.network.flow(), Flow::GatewayDirect);
    }

    #[test]
    fn test_valid_config_passes_validation() {
        assert_ok!(valid().validate());
    }

    #[test]
    fn test_short_knock_secret_is_rejected() {
        // Arrange
        let mut cfg = valid();
        cfg.agent.knock_secret_hex = "11".repeat(8);

        // Act / Assert
        assert_err!(cfg.validate());
    }

    #[test]
    fn test_server_trust_must_be_exactly_one_source() {
        // Arrange
        let mut both = valid();
        both.tls.server_fingerprint = Some("ab".repeat(32));
        let mut neither = valid();
        neither.tls.server_ca_path = None;

        // Act / Assert
        assert!(matches!(both.validate(), Err(ConfigError::Invalid(_))));
        assert!(matches!(neither.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_fingerprint_must_decode_to_32_bytes() {
        // Arrange
        let mut cfg = AgentConfig::default();
        cfg.tls.server_fingerprint = Some("ab".repeat(20));

        // Act / Assert
        assert_err!(cfg.tls.server_fingerprint());
        cfg.tls.server_fingerprint = Some("ab".repeat(32));
        assert_eq!(cfg.tls.server_fingerprint().unwrap(), Some([0xab; 32]));
    }

    #[test]
    fn test_save_then_load_preserves_config() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("sdp-agent-config-{}", std::process::id()));
        let path = dir.join("agent.toml");
        let cfg = valid();

        // Act
        save_config(&cfg, &path).unwrap();
        let loaded = load_config(&path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);

        // Assert
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let result = load_config(Path::new("/nonexistent/sdp/agent.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
