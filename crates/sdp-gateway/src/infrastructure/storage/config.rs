//! TOML configuration for the gateway.
//!
//! ```toml
//! [gateway]
//! service = "ssh"
//!
//! [network]
//! knock_listen = "0.0.0.0:62202"
//! tls_listen = "0.0.0.0:8443"
//! upstream = "127.0.0.1:22"
//!
//! [admission]
//! ttl_secs = 30
//!
//! [security]
//! require_token = true
//! token_secret_hex = "<same secret as the controller>"
//!
//! [tls]
//! cert_path = "/etc/sdp/gateway.crt"
//! key_path = "/etc/sdp/gateway.key"
//! # client_ca_path = "/etc/sdp/devices-ca.crt"
//!
//! [[devices]]
//! device_id = "dev-1"
//! knock_secret_hex = "00112233445566778899aabbccddeeff"
//! cert_fingerprint = "…"
//! services = ["ssh"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sdp_core::token::MIN_TOKEN_SECRET_LEN;
use sdp_core::DeviceEntry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

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

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Service tag of the protected service.  Devices and tokens must name it.
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_knock_listen")]
    pub knock_listen: SocketAddr,
    #[serde(default = "default_tls_listen")]
    pub tls_listen: SocketAddr,
    /// Address of the protected TCP service.
    #[serde(default = "default_upstream")]
    pub upstream: SocketAddr,
    #[serde(default = "default_upstream_connect_timeout_secs")]
    pub upstream_connect_timeout_secs: u64,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    #[serde(default = "default_admission_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_admission_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Require a controller token inside every knock.
    #[serde(default = "default_require_token")]
    pub require_token: bool,
    #[serde(default)]
    pub token_secret_hex: String,
    /// Expected `iss` claim.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    #[serde(default = "default_used_token_capacity")]
    pub used_token_capacity: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_path: PathBuf,
    #[serde(default)]
    pub key_path: PathBuf,
    /// CA bundle for devices bound by certificate common name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_path: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_service() -> String {
    "ssh".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_knock_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 62202))
}
fn default_tls_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8443))
}
fn default_upstream() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 22))
}
fn default_upstream_connect_timeout_secs() -> u64 {
    5
}
fn default_max_inflight() -> usize {
    256
}
fn default_max_connections() -> usize {
    1024
}
fn default_admission_ttl_secs() -> u64 {
    30
}
fn default_admission_capacity() -> usize {
    10_000
}
fn default_require_token() -> bool {
    true
}
fn default_issuer() -> String {
    "sdp-controller".to_string()
}
fn default_max_clock_skew_secs() -> u64 {
    30
}
fn default_replay_capacity() -> usize {
    100_000
}
fn default_used_token_capacity() -> usize {
    100_000
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_handshake_timeout_secs() -> u64 {
    10
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            knock_listen: default_knock_listen(),
            tls_listen: default_tls_listen(),
            upstream: default_upstream(),
            upstream_connect_timeout_secs: default_upstream_connect_timeout_secs(),
            max_inflight: default_max_inflight(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_admission_ttl_secs(),
            capacity: default_admission_capacity(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_token: default_require_token(),
            token_secret_hex: String::new(),
            issuer: default_issuer(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
            replay_capacity: default_replay_capacity(),
            used_token_capacity: default_used_token_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            client_ca_path: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_secs.max(1))
    }
}

impl AdmissionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl SecurityConfig {
    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Decodes the token secret shared with the controller.
    pub fn token_secret(&self) -> Result<Vec<u8>, ConfigError> {
        let secret = hex::decode(self.token_secret_hex.trim())
            .map_err(|e| ConfigError::Invalid(format!("security.token_secret_hex: {e}")))?;
        if secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "security.token_secret_hex must decode to at least {MIN_TOKEN_SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }
        Ok(secret)
    }
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

impl GatewayConfig {
    /// Checks the settings that have no safe default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.service.trim().is_empty() {
            return Err(ConfigError::Invalid("gateway.service must not be empty".to_string()));
        }
        if self.security.require_token {
            self.security.token_secret()?;
        }
        if self.security.max_clock_skew_secs == 0 {
            return Err(ConfigError::Invalid(
                "security.max_clock_skew_secs must be positive".to_string(),
            ));
        }
        if self.admission.ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "admission.ttl_secs must be positive".to_string(),
            ));
        }
        let needs_ca = self.devices.iter().any(|d| d.common_name.is_some());
        if needs_ca && self.tls.client_ca_path.is_none() {
            return Err(ConfigError::Invalid(
                "devices bound by common_name need tls.client_ca_path".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning defaults if the file does
/// not exist.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GatewayConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories.
pub fn save_config(config: &GatewayConfig, path: &Path) -> Result<(), ConfigError> {
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
    use tokio_test::assert_ok;

    fn valid() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.security.token_secret_hex = "01".repeat(32);
        cfg
    }

    #[test]
    fn test_default_config_uses_documented_ports_and_timeouts() {
        // Arrange / Act
        let cfg = GatewayConfig::default();

        // Assert
        assert_eq!(cfg.network.knock_listen.port(), 62202);
        assert_eq!(cfg.network.tls_listen.port(), 8443);
        assert_eq!(cfg.admission.ttl(), Duration::from_secs(30));
        assert_eq!(cfg.tls.handshake_timeout(), Duration::from_secs(10));
        assert!(cfg.security.require_token);
    }

    #[test]
    fn test_required_token_needs_a_secret() {
        let cfg = GatewayConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_optional_token_needs_no_secret() {
        let mut cfg = GatewayConfig::default();
        cfg.security.require_token = false;
        assert_ok!(cfg.validate());
    }

    #[test]
    fn test_common_name_device_requires_client_ca() {
        // Arrange
        let mut cfg = valid();
        cfg.devices.push(DeviceEntry {
            device_id: "dev-1".to_string(),
            knock_secret_hex: "00".repeat(16),
            cert_fingerprint: None,
            common_name: Some("dev-1".to_string()),
            services: vec!["ssh".to_string()],
        });

        // Act / Assert
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.tls.client_ca_path = Some(PathBuf::from("/etc/sdp/ca.pem"));
        assert_ok!(cfg.validate());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        // Arrange
        let text = r#"
            [gateway]
            service = "postgres"

            [network]
            upstream = "10.0.0.5:5432"

            [tls]
            cert_path = "/etc/sdp/gateway.crt"
            key_path = "/etc/sdp/gateway.key"
        "#;

        // Act
        let cfg: GatewayConfig = toml::from_str(text).unwrap();

        // Assert
        assert_eq!(cfg.gateway.service, "postgres");
        assert_eq!(cfg.network.upstream.port(), 5432);
        assert_eq!(cfg.network.tls_listen.port(), 8443);
        assert_eq!(cfg.admission.ttl_secs, 30);
        assert_eq!(cfg.tls.key_path, PathBuf::from("/etc/sdp/gateway.key"));
    }

    #[test]
    fn test_save_then_load_round_trips() {
        // Arrange
        let path = std::env::temp_dir()
            .join(format!("sdp-gateway-{}", std::process::id()))
            .join("gateway.toml");
        let mut cfg = valid();
        cfg.gateway.service = "rdp".to_string();

        // Act
        save_config(&cfg, &path).unwrap();
        let restored = load_config(&path).unwrap();

        // Assert
        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
