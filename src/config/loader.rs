// Config loading
//
// The configuration subsystem is external; ConfigSource is the seam the core
// uses to fetch a snapshot. JsonConfigFile is the file-backed default.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PackError, Result};
use super::SchedulerConfig;

/// Provider of the current configuration snapshot.
pub trait ConfigSource: Send + Sync {
    fn get_camera_config(&self) -> Result<SchedulerConfig>;
}

/// Reads and validates a JSON config file on every call.
#[derive(Debug, Clone)]
pub struct JsonConfigFile {
    path: PathBuf,
}

impl JsonConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate once. Used at startup, where failure is fatal.
    pub fn load(path: &Path) -> Result<SchedulerConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PackError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: SchedulerConfig = serde_json::from_str(&raw).map_err(|e| {
            PackError::Config(format!("cannot parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl ConfigSource for JsonConfigFile {
    fn get_camera_config(&self) -> Result<SchedulerConfig> {
        Self::load(&self.path)
    }
}

/// Fixed snapshot, for embedding and tests.
#[derive(Debug, Clone)]
pub struct StaticConfig(pub Arc<SchedulerConfig>);

impl StaticConfig {
    pub fn new(config: SchedulerConfig) -> Self {
        Self(Arc::new(config))
    }
}

impl ConfigSource for StaticConfig {
    fn get_camera_config(&self) -> Result<SchedulerConfig> {
        Ok((*self.0).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("packcam.json");
        std::fs::write(
            &path,
            r#"{"cameras": [{"id": "dock-1", "root": "/srv/dock1",
                "packing_zone": {"x": 0, "y": 0, "width": 10, "height": 10}}],
                "min_packing_time_secs": 3, "max_packing_time_secs": 90}"#,
        )
        .unwrap();

        let source = JsonConfigFile::new(&path);
        let config = source.get_camera_config().unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.max_packing_time_secs, 90);
    }

    #[test]
    fn test_load_failures_are_config_errors() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.json");
        assert!(matches!(JsonConfigFile::load(&missing), Err(PackError::Config(_))));

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(JsonConfigFile::load(&bad), Err(PackError::Config(_))));

        let invalid = tmp.path().join("invalid.json");
        std::fs::write(&invalid, r#"{"cameras": [], "frame_interval_ms": 0}"#).unwrap();
        assert!(matches!(JsonConfigFile::load(&invalid), Err(PackError::Config(_))));
    }
}
