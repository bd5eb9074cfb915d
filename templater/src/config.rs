use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

use crate::document::DocumentPath;

/// Host-specific settings applied to every template.
#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Public key injected through cloud-init
    pub ssh_keyfile: PathBuf,

    /// Default cloud-init login user
    #[validate(length(min = 1))]
    pub username: String,

    /// Storage pool for imported disks and the cloud-init drive
    #[validate(length(min = 1))]
    pub storage: String,

    /// Bridge for the first network interface
    #[validate(length(min = 1))]
    pub bridge: String,

    /// Memory in MiB
    #[validate(range(min = 16))]
    pub memory: u32,

    #[validate(range(min = 1, max = 512))]
    pub cores: u32,

    /// Size the primary disk is grown to (e.g. "8G")
    #[validate(custom(function = "validate_disk_size"))]
    pub disk_size: String,

    /// Destroy partially configured VMs when provisioning fails
    pub destroy_on_failure: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ssh_keyfile: PathBuf::from("/root/id_rsa.pub"),
            username: "admin".to_string(),
            storage: "local-zfs".to_string(),
            bridge: "vmbr0".to_string(),
            memory: 1024,
            cores: 4,
            disk_size: "8G".to_string(),
            destroy_on_failure: false,
        }
    }
}

/// A partial config where every field is optional.
#[derive(Clone, Deserialize, Debug, Default)]
pub struct ConfigOverride {
    pub ssh_keyfile: Option<PathBuf>,
    pub username: Option<String>,
    pub storage: Option<String>,
    pub bridge: Option<String>,
    pub memory: Option<u32>,
    pub cores: Option<u32>,
    pub disk_size: Option<String>,
    pub destroy_on_failure: Option<bool>,
}

impl RuntimeConfig {
    /// Load the defaults and apply the given override file, if any. Problems
    /// with the override are reported and the defaults are used instead.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        let document = DocumentPath::new(path);
        if !document.exists() {
            warn!(path = %document, "Config file not found, using defaults");
            return Self::default();
        }

        let config = match document.load::<ConfigOverride>() {
            Ok(config_override) => Self::default().merge(config_override),
            Err(error) => {
                warn!(path = %document, error = ?error, "Could not load config file, using defaults");
                return Self::default();
            }
        };

        match config.validate() {
            Ok(()) => {
                debug!(config = ?config, "Loaded config");
                config
            }
            Err(error) => {
                warn!(path = %document, error = %error, "Invalid config file, using defaults");
                Self::default()
            }
        }
    }

    /// Replace every field present in the override.
    pub fn merge(self, config_override: ConfigOverride) -> Self {
        Self {
            ssh_keyfile: config_override.ssh_keyfile.unwrap_or(self.ssh_keyfile),
            username: config_override.username.unwrap_or(self.username),
            storage: config_override.storage.unwrap_or(self.storage),
            bridge: config_override.bridge.unwrap_or(self.bridge),
            memory: config_override.memory.unwrap_or(self.memory),
            cores: config_override.cores.unwrap_or(self.cores),
            disk_size: config_override.disk_size.unwrap_or(self.disk_size),
            destroy_on_failure: config_override
                .destroy_on_failure
                .unwrap_or(self.destroy_on_failure),
        }
    }
}

fn validate_disk_size(size: &str) -> Result<(), ValidationError> {
    match size.parse::<Byte>() {
        Ok(byte) if byte.as_u64() > 0 => Ok(()),
        Ok(_) => Err(ValidationError::new("Size must be greater than zero")),
        Err(_) => Err(ValidationError::new(
            "Invalid size format. Expected format: number followed by unit (e.g., '8G')",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::load(None);

        assert_eq!(config.ssh_keyfile, PathBuf::from("/root/id_rsa.pub"));
        assert_eq!(config.username, "admin");
        assert_eq!(config.storage, "local-zfs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_override_replaces_only_present_fields() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"username": "ops"}"#)?;

        let config = RuntimeConfig::load(Some(&path));

        assert_eq!(config.ssh_keyfile, PathBuf::from("/root/id_rsa.pub"));
        assert_eq!(config.username, "ops");
        assert_eq!(config.storage, "local-zfs");
        assert_eq!(config.memory, 1024);
        Ok(())
    }

    #[test]
    fn test_override_formats_agree() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let documents = [
            ("config.json", r#"{"storage": "ceph", "cores": 2}"#),
            ("config.toml", "storage = \"ceph\"\ncores = 2\n"),
            ("config.yaml", "storage: ceph\ncores: 2\n"),
        ];

        for (name, content) in documents {
            let path = tmp.path().join(name);
            std::fs::write(&path, content)?;

            let config = RuntimeConfig::load(Some(&path));
            assert_eq!(config.storage, "ceph", "{name}");
            assert_eq!(config.cores, 2, "{name}");
            assert_eq!(config.username, "admin", "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_missing_override_uses_defaults() {
        let config = RuntimeConfig::load(Some(Path::new("/nonexistent/config.json")));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_malformed_override_uses_defaults() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ this is not json")?;

        assert_eq!(RuntimeConfig::load(Some(&path)), RuntimeConfig::default());
        Ok(())
    }

    #[test]
    fn test_invalid_override_uses_defaults() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"disk_size": "huge", "username": "ops"}"#)?;

        assert_eq!(RuntimeConfig::load(Some(&path)), RuntimeConfig::default());
        Ok(())
    }

    #[test]
    fn test_disk_sizes() {
        for size in ["8G", "8GiB", "10240M", "1T"] {
            assert!(validate_disk_size(size).is_ok(), "Expected '{size}' to be valid");
        }
        for size in ["", "0", "0G", "big", "G8"] {
            assert!(validate_disk_size(size).is_err(), "Expected '{size}' to be invalid");
        }
    }
}
