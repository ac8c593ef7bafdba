//! User-facing settings for the tracking layer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Default number of faces the face tracker is sized for.
pub const DEFAULT_CONCURRENT_FACE_TRACKERS: usize = 2;

/// Verbosity forwarded to the native engine's logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineLogLevel {
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

/// Settings shared by the runtime components.
///
/// Loaded once at startup; the face-tracker budget must be final before the
/// first face target initializes because tracker capacity is fixed at
/// creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UarSettings {
    concurrent_face_trackers: usize,
    /// Expose decoded preview images for trained image targets.
    pub image_target_preview: bool,
    pub log_level: EngineLogLevel,
}

impl Default for UarSettings {
    fn default() -> Self {
        Self {
            concurrent_face_trackers: DEFAULT_CONCURRENT_FACE_TRACKERS,
            image_target_preview: false,
            log_level: EngineLogLevel::default(),
        }
    }
}

impl UarSettings {
    /// Read settings from a JSON file, clamping out-of-range values.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut settings: UarSettings = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let count = settings.concurrent_face_trackers;
        settings.set_concurrent_face_trackers(count);
        Ok(settings)
    }

    pub fn concurrent_face_trackers(&self) -> usize {
        self.concurrent_face_trackers
    }

    /// A tracker sized for zero faces is useless; values below 1 clamp to 1.
    pub fn set_concurrent_face_trackers(&mut self, count: usize) {
        if count < 1 {
            warn!(requested = count, "concurrent face tracker count below minimum, clamping to 1");
            self.concurrent_face_trackers = 1;
        } else {
            self.concurrent_face_trackers = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_zero_tracker_count() {
        let mut settings = UarSettings::default();
        settings.set_concurrent_face_trackers(0);
        assert_eq!(settings.concurrent_face_trackers(), 1);
    }

    #[test]
    fn keeps_valid_tracker_count() {
        let mut settings = UarSettings::default();
        settings.set_concurrent_face_trackers(5);
        assert_eq!(settings.concurrent_face_trackers(), 5);
    }

    #[test]
    fn load_clamps_and_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"concurrent_face_trackers": 0}"#).unwrap();

        let settings = UarSettings::load(&path).unwrap();
        assert_eq!(settings.concurrent_face_trackers(), 1);
        assert!(!settings.image_target_preview);
        assert_eq!(settings.log_level, EngineLogLevel::Warning);
    }
}
