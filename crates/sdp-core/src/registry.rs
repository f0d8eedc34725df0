//! Device registry.
//!
//! Every knock and every TLS handshake looks a device up, while the set of
//! devices changes rarely.  [`InMemoryRegistry`] is therefore copy-on-write:
//! a lookup clones an `Arc` to the current map under a read lock held for a
//! few instructions, and an update builds a fresh map and swaps it in.  A
//! lookup that is already running keeps its old snapshot and never waits for
//! the writer.
//!
//! Where the devices come from is outside this crate's concern.  The
//! binaries load them from the `[[devices]]` tables of their TOML config via
//! [`DeviceEntry`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::device::{Device, DeviceError, DeviceId, IdentityBinding, KnockSecret};

/// Errors raised while building a registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two entries share the same device identifier.
    #[error("device {0} is registered twice")]
    DuplicateDevice(String),

    /// An entry failed validation.
    #[error("device entry {device_id:?} is invalid: {source}")]
    Invalid {
        device_id: String,
        #[source]
        source: DeviceError,
    },

    /// An entry has neither or both identity bindings.
    #[error("device {0} needs exactly one of cert_fingerprint or common_name")]
    AmbiguousIdentity(String),
}

/// Read access to registered devices.
///
/// A miss means "unknown device".  Implementations must not block for long:
/// the lookup sits on the per-packet path of both SPA listeners.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, device_id: &DeviceId) -> Option<Arc<Device>>;
}

// ── In-memory implementation ──────────────────────────────────────────────────

type Snapshot = Arc<HashMap<DeviceId, Arc<Device>>>;

/// Copy-on-write registry held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    devices: RwLock<Snapshot>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from devices, rejecting duplicate identifiers.
    pub fn from_devices(devices: Vec<Device>) -> Result<Self, RegistryError> {
        let mut map = HashMap::with_capacity(devices.len());
        for device in devices {
            let id = device.device_id.clone();
            if map.insert(id.clone(), Arc::new(device)).is_some() {
                return Err(RegistryError::DuplicateDevice(id.to_string()));
            }
        }
        Ok(Self {
            devices: RwLock::new(Arc::new(map)),
        })
    }

    /// Builds a registry from configuration entries.
    pub fn from_entries(entries: &[DeviceEntry]) -> Result<Self, RegistryError> {
        let devices = entries
            .iter()
            .map(DeviceEntry::to_device)
            .collect::<Result<Vec<_>, _>>()?;
        let registry = Self::from_devices(devices)?;
        info!(devices = registry.len(), "device registry loaded");
        Ok(registry)
    }

    /// Inserts or replaces a device.
    pub fn upsert(&self, device: Device) {
        self.update(|map| {
            map.insert(device.device_id.clone(), Arc::new(device));
        });
    }

    /// Removes a device, returning it if it was present.
    pub fn remove(&self, device_id: &DeviceId) -> Option<Arc<Device>> {
        let mut removed = None;
        self.update(|map| removed = map.remove(device_id));
        removed
    }

    /// Replaces the whole device set atomically.
    pub fn replace_all(&self, devices: Vec<Device>) -> Result<(), RegistryError> {
        let fresh = Self::from_devices(devices)?;
        let snapshot = fresh.snapshot();
        *self.write_guard() = snapshot;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Snapshot {
        match self.devices.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, mutate: impl FnOnce(&mut HashMap<DeviceId, Arc<Device>>)) {
        let mut guard = self.write_guard();
        let mut next = HashMap::clone(&guard);
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}

impl DeviceRegistry for InMemoryRegistry {
    fn lookup(&self, device_id: &DeviceId) -> Option<Arc<Device>> {
        self.snapshot().get(device_id).cloned()
    }
}

// ── Configuration entries ─────────────────────────────────────────────────────

/// One `[[devices]]` table in a TOML configuration file.
///
/// ```toml
/// [[devices]]
/// device_id = "dev-1"
/// knock_secret_hex = "00112233445566778899aabbccddeeff"
/// cert_fingerprint = "3f:a1:..."
/// services = ["ssh"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub knock_secret_hex: String,
    /// Hex SHA-256 of the device's DER certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_fingerprint: Option<String>,
    /// Certificate subject CN, for CA-issued certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl DeviceEntry {
    /// Validates the entry and converts it into a [`Device`].
    pub fn to_device(&self) -> Result<Device, RegistryError> {
        let invalid = |source| RegistryError::Invalid {
            device_id: self.device_id.clone(),
            source,
        };
        let device_id = DeviceId::new(self.device_id.clone()).map_err(invalid)?;
        let knock_secret = KnockSecret::from_hex(&self.knock_secret_hex).map_err(invalid)?;
        let identity = match (&self.cert_fingerprint, &self.common_name) {
            (Some(fp), None) => IdentityBinding::fingerprint_from_hex(fp).map_err(invalid)?,
            (None, Some(cn)) => IdentityBinding::SubjectCommonName(cn.clone()),
            _ => return Err(RegistryError::AmbiguousIdentity(self.device_id.clone())),
        };
        Ok(Device::new(
            device_id,
            knock_secret,
            identity,
            self.services.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> Device {
        Device::new(
            DeviceId::new(id).unwrap(),
            KnockSecret::new(vec![1u8; 32]).unwrap(),
            IdentityBinding::CertFingerprint([0u8; 32]),
            vec!["ssh".to_string()],
        )
    }

    fn entry(id: &str) -> DeviceEntry {
        DeviceEntry {
            device_id: id.to_string(),
            knock_secret_hex: "00".repeat(16),
            cert_fingerprint: Some("ab".repeat(32)),
            common_name: None,
            services: vec!["ssh".to_string()],
        }
    }

    #[test]
    fn test_lookup_returns_registered_device_and_misses_unknown() {
        // Arrange
        let registry = InMemoryRegistry::from_devices(vec![device("dev-1")]).unwrap();

        // Act
        let hit = registry.lookup(&DeviceId::new("dev-1").unwrap());
        let miss = registry.lookup(&DeviceId::new("dev-9").unwrap());

        // Assert
        assert_eq!(hit.unwrap().device_id.as_str(), "dev-1");
        assert!(miss.is_none());
    }

    #[test]
    fn test_duplicate_devices_are_rejected() {
        let result = InMemoryRegistry::from_devices(vec![device("dev-1"), device("dev-1")]);
        assert!(matches!(result, Err(RegistryError::DuplicateDevice(id)) if id == "dev-1"));
    }

    #[test]
    fn test_snapshot_held_by_reader_survives_removal() {
        // Arrange
        let registry = InMemoryRegistry::from_devices(vec![device("dev-1")]).unwrap();
        let id = DeviceId::new("dev-1").unwrap();
        let held = registry.lookup(&id).unwrap();

        // Act
        let removed = registry.remove(&id);

        // Assert
        assert!(removed.is_some());
        assert!(registry.lookup(&id).is_none());
        assert_eq!(held.device_id, id, "reader keeps its copy");
    }

    #[test]
    fn test_upsert_and_replace_all_swap_contents() {
        // Arrange
        let registry = InMemoryRegistry::new();

        // Act
        registry.upsert(device("dev-1"));
        registry.upsert(device("dev-2"));
        let after_upsert = registry.len();
        registry.replace_all(vec![device("dev-3")]).unwrap();

        // Assert
        assert_eq!(after_upsert, 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&DeviceId::new("dev-3").unwrap()).is_some());
    }

    #[test]
    fn test_from_entries_builds_fingerprint_and_common_name_bindings() {
        // Arrange
        let mut by_cn = entry("dev-2");
        by_cn.cert_fingerprint = None;
        by_cn.common_name = Some("dev-2.example".to_string());

        // Act
        let registry = InMemoryRegistry::from_entries(&[entry("dev-1"), by_cn]).unwrap();

        // Assert
        let dev1 = registry.lookup(&DeviceId::new("dev-1").unwrap()).unwrap();
        let dev2 = registry.lookup(&DeviceId::new("dev-2").unwrap()).unwrap();
        assert_eq!(dev1.identity, IdentityBinding::CertFingerprint([0xab; 32]));
        assert_eq!(
            dev2.identity,
            IdentityBinding::SubjectCommonName("dev-2.example".to_string())
        );
    }

    #[test]
    fn test_entry_with_both_bindings_is_ambiguous() {
        let mut both = entry("dev-1");
        both.common_name = Some("dev-1".to_string());
        assert_eq!(
            both.to_device().unwrap_err(),
            RegistryError::AmbiguousIdentity("dev-1".to_string())
        );
    }

    #[test]
    fn test_entry_with_short_secret_is_invalid() {
        // Arrange
        let mut short = entry("dev-1");
        short.knock_secret_hex = "00ff".to_string();

        // Act
        let err = short.to_device().unwrap_err();

        // Assert
        assert_eq!(
            err,
            RegistryError::Invalid {
                device_id: "dev-1".to_string(),
                source: DeviceError::SecretTooShort { len: 2 },
            }
        );
    }

    #[test]
    fn test_entries_parse_from_toml() {
        // Arrange
        let text = r#"
            [[devices]]
            device_id = "dev-1"
            knock_secret_hex = "000102030405060708090a0b0c0d0e0f"
            common_name = "dev-1"
            services = ["ssh", "db"]
        "#;

        #[derive(Deserialize)]
        struct File {
            devices: Vec<DeviceEntry>,
        }

        // Act
        let parsed: File = toml::from_str(text).unwrap();

        // Assert
        assert_eq!(parsed.devices.len(), 1);
        assert_eq!(parsed.devices[0].services, vec!["ssh", "db"]);
    }
}
