//! TOML configuration for the controller.
//!
//! Loaded from the path given with `--config`, or from the platform config
//! directory when no path is given:
//! - Linux:    `~/.config/sdp/controller.toml`
//! - macOS:    `~/Library/Application Support/SDP/controller.toml`
//! - Windows:  `%APPDATA%\SDP\controller.toml`
//!
//! ```toml
//! [controller]
//! log_level = "info"
//! issuer = "sdp-controller"
//!
//! [network]
//! knock_listen = "0.0.0.0:62201"
//! http_listen = "0.0.0.0:8080"
//!
//! [security]
//! token_secret_hex = "<64+ hex characters shared with the gateway>"
//! token_ttl_secs = 120
//! max_clock_skew_secs = 30
//!
//! [[devices]]
//! device_id = "dev-1"
//! knock_secret_hex = "00112233445566778899aabbccddeeff"
//! cert_fingerprint = "…"
//! services = ["ssh"]
//! ```
//!
//! Every field has a default, so a partial file is valid.  The only setting
//! without a usable default is the token secret; [`ControllerConfig::validate`]
//! rejects a configuration that lacks it.

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
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ControllerConfig {
    #[serde(default)]
    pub controller: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// `tracing` log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `iss` claim of every token.
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// UDP address of the SPA port.
    #[serde(default = "default_knock_listen")]
    pub knock_listen: SocketAddr,
    /// TCP address of the token API.
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,
    /// Maximum knocks processed concurrently.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Hex-encoded HS256 signing secret, shared with the gateway.
    #[serde(default)]
    pub token_secret_hex: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
    /// Maximum remembered knock nonces.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    /// Period of the expired-record sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_issuer() -> String {
    "sdp-controller".to_string()
}
fn default_knock_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 62201))
}
fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_max_inflight() -> usize {
    256
}
fn default_token_ttl_secs() -> u64 {
    120
}
fn default_max_clock_skew_secs() -> u64 {
    30
}
fn default_replay_capacity() -> usize {
    100_000
}
fn default_sweep_interval_secs() -> u64 {
    10
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            issuer: default_issuer(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            knock_listen: default_knock_listen(),
            http_listen: default_http_listen(),
            max_inflight: default_max_inflight(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_secret_hex: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
            replay_capacity: default_replay_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SecurityConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Decodes the token secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the secret is missing, not hex,
    /// or shorter than 32 bytes.
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

impl ControllerConfig {
    /// Checks the settings that have no safe default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.security.token_secret()?;
        if self.security.max_clock_skew_secs == 0 {
            return Err(ConfigError::Invalid(
                "security.max_clock_skew_secs must be positive".to_string(),
            ));
        }
        if self.network.max_inflight == 0 {
            return Err(ConfigError::Invalid(
                "network.max_inflight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default path of the controller config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("controller.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the configuration at `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ControllerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ControllerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories.
pub fn save_config(config: &ControllerConfig, path: &Path) -> Result<(), ConfigError> {
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

/// Resolves the platform config base directory with the `SDP` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("SDP"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("sdp"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("SDP"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sdp-controller-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_default_config_uses_documented_ports_and_limits() {
        // Arrange / Act
        let cfg = ControllerConfig::default();

        // Assert
        assert_eq!(cfg.network.knock_listen.port(), 62201);
        assert_eq!(cfg.network.http_listen.port(), 8080);
        assert_eq!(cfg.security.token_ttl(), Duration::from_secs(120));
        assert_eq!(cfg.security.max_clock_skew(), Duration::from_secs(30));
        assert_eq!(cfg.controller.log_level, "info");
    }

    #[test]
    fn test_default_config_fails_validation_without_secret() {
        let cfg = ControllerConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_short_secret_is_invalid() {
        // Arrange
        let mut cfg = ControllerConfig::default();
        cfg.security.token_secret_hex = "ab".repeat(31);

        // Act / Assert
        assert_err!(cfg.security.token_secret());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        // Arrange
        let text = r#"
            [security]
            token_secret_hex = "0000000000000000000000000000000000000000000000000000000000000000"

            [[devices]]
            device_id = "dev-1"
            knock_secret_hex = "000102030405060708090a0b0c0d0e0f"
            cert_fingerprint = "1111111111111111111111111111111111111111111111111111111111111111"
            services = ["ssh"]
        "#;

        // Act
        let cfg: ControllerConfig = toml::from_str(text).unwrap();

        // Assert
        assert_ok!(cfg.validate());
        assert_eq!(cfg.network.knock_listen.port(), 62201);
        assert_eq!(cfg.devices.len(), 1);
        assert_eq!(cfg.security.token_secret().unwrap().len(), 32);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let cfg = load_config(&temp_path("does-not-exist.toml")).unwrap();
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        // Arrange
        let path = temp_path("round-trip/controller.toml");
        let mut cfg = ControllerConfig::default();
        cfg.network.http_listen = "127.0.0.1:9090".parse().unwrap();
        cfg.security.token_secret_hex = "aa".repeat(32);

        // Act
        save_config(&cfg, &path).unwrap();
        let restored = load_config(&path).unwrap();

        // Assert
        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        // Arrange
        let path = temp_path("broken.toml");
        std::fs::write(&path, "[network\nknock_listen = 1").unwrap();

        // Act
        let result = load_config(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));
        let _ = std::fs::remove_file(path);
    }
}
