//! Residency configuration: manager construction parameters and per-frame policy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Result;

/// Construction parameters of the feedback manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackManagerDesc {
    /// Frames the GPU may lag behind the CPU. Sizes the readback ring and the
    /// deferred heap release ring.
    pub num_frames_in_flight: u32,
    /// Tiles per heap (64KB each)
    pub heap_size_in_tiles: u32,
}

impl Default for FeedbackManagerDesc {
    fn default() -> Self {
        Self {
            num_frames_in_flight: 3,
            heap_size_in_tiles: 256, // 16MB heaps
        }
    }
}

/// Policy for one frame, passed to `begin_frame`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackUpdateConfig {
    /// Monotonic frame counter; only `frame_index % num_frames_in_flight` matters
    pub frame_index: u64,
    /// Feedback captures per frame, 0 = every texture every frame
    pub max_textures_to_update: u32,
    /// Seconds a standby tile stays mapped before it is evicted
    pub tile_timeout_seconds: f32,
    pub defragment_heaps: bool,
    pub trim_standby_tiles: bool,
    pub release_empty_heaps: bool,
    /// Standby tiles kept when trimming
    pub num_extra_standby_tiles: u32,
    /// Tiles moved per frame when defragmenting
    pub defrag_tiles_per_frame: u32,
}

impl Default for FeedbackUpdateConfig {
    fn default() -> Self {
        Self {
            frame_index: 0,
            max_textures_to_update: 0,
            tile_timeout_seconds: 1.0,
            defragment_heaps: true,
            trim_standby_tiles: true,
            release_empty_heaps: true,
            num_extra_standby_tiles: 1000,
            defrag_tiles_per_frame: 16,
        }
    }
}

/// Everything configurable about residency, as stored on disk
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    pub manager: FeedbackManagerDesc,
    pub update: FeedbackUpdateConfig,
}

impl ResidencyConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("residency.json");

        let mut config = ResidencyConfig::default();
        config.manager.heap_size_in_tiles = 64;
        config.update.tile_timeout_seconds = 0.25;
        config.update.defragment_heaps = false;
        config.save(&path).unwrap();

        let loaded = ResidencyConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "update": { "max_textures_to_update": 8 } }"#).unwrap();

        let loaded = ResidencyConfig::load(&path).unwrap();
        assert_eq!(loaded.update.max_textures_to_update, 8);
        assert_eq!(loaded.update.defrag_tiles_per_frame, 16);
        assert_eq!(loaded.manager, FeedbackManagerDesc::default());
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(ResidencyConfig::load(&dir.path().join("absent.json")), Err(Error::Io(_))));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ResidencyConfig::load(&path), Err(Error::Config(_))));
    }
}
