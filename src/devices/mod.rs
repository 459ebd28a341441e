// Camera discovery, registry and health monitoring

pub mod enumeration;
pub mod health;
pub mod registry;

pub use enumeration::discover_sources;
pub use health::{StallEvent, StallMonitor};
pub use registry::{ActivationError, CameraRegistry, SourceBackend, StatusChange, SystemBackend};

use serde::{Deserialize, Serialize};

/// How frames are obtained from a source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// V4L2 capture node (`/dev/videoN`)
    V4l2,
    /// Helper program writing MJPEG to stdout (`rpicam:N`)
    ExternalProcess,
}

/// Represents a discovered camera
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceDescriptor {
    /// Stable identifier: device node path or `rpicam:N`
    pub path: String,
    /// Human readable name (V4L2 card name or sensor model)
    pub name: String,
    /// Ordering and number-key selection
    pub index: u32,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    pub fn v4l2(path: impl Into<String>, name: impl Into<String>, index: u32) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            index,
            kind: SourceKind::V4l2,
        }
    }

    pub fn external(camera: u32, name: impl Into<String>, index: u32) -> Self {
        Self {
            path: format!("{}{}", RPICAM_PATH_PREFIX, camera),
            name: name.into(),
            index,
            kind: SourceKind::ExternalProcess,
        }
    }

    /// Camera number of an external-process source (`rpicam:N` -> N)
    pub fn external_camera(&self) -> Option<u32> {
        self.path.strip_prefix(RPICAM_PATH_PREFIX)?.parse().ok()
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} ({})", self.index, self.name, self.path)
    }
}

/// Path prefix of external-process sources
pub const RPICAM_PATH_PREFIX: &str = "rpicam:";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_camera_number_from_path() {
        let desc = SourceDescriptor::external(2, "RPi Camera: imx708", 3);
        assert_eq!(desc.path, "rpicam:2");
        assert_eq!(desc.external_camera(), Some(2));

        let v4l2 = SourceDescriptor::v4l2("/dev/video0", "USB Camera", 0);
        assert_eq!(v4l2.external_camera(), None);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let desc = SourceDescriptor::external(0, "RPi Camera: imx219", 1);
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"kind\":\"external_process\""));
    }
}
