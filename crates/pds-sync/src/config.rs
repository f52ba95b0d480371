use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Frames buffered between the export walk and a slow consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Export configuration.
///
/// ```toml
/// channel_capacity = 16
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub channel_capacity: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ExportConfig {
    pub fn from_toml_str(input: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.channel_capacity == 0 {
            return Err(SyncError::Config("channel_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
