//! Device identity of the coordinator station.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Supplies the id this coordinator uses when talking to stations.
pub trait DeviceIdentityProvider: Send + Sync {
    /// Stable device id.
    fn device_id(&self) -> &str;
}

/// Device id persisted in the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationIdentity {
    device_id: String,
}

impl StationIdentity {
    /// Uses a fixed device id.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    /// Loads the device id stored at `path`, generating and saving one on first run.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read device id file: {}", path.display()))?;
            let device_id = contents.trim();
            if device_id.is_empty() {
                anyhow::bail!("Invalid device id file: {} is empty", path.display());
            }
            return Ok(Self::new(device_id));
        }

        let identity = Self::new(uuid::Uuid::new_v4().to_string());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, &identity.device_id)
            .with_context(|| format!("Failed to write device id file: {}", path.display()))?;

        info!(device_id = %identity.device_id, "Generated new device id and saved to {:?}", path);
        Ok(identity)
    }
}

impl DeviceIdentityProvider for StationIdentity {
    fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_generation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("device_id");

        let first = StationIdentity::load_or_generate(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.device_id().len(), 36);

        let second = StationIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_identity_empty_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("device_id");
        std::fs::write(&path, "  \n").unwrap();

        assert!(StationIdentity::load_or_generate(&path).is_err());
    }
}
