//! Immutable description of the volume being written.
//!
//! [`WriterMetadata`] is validated once when a writer is configured and is
//! read-only afterwards. Range constraints are plain validation functions
//! returning [`VoxError::InvalidMetadata`]; there are no runtime-mutable
//! properties.

use serde::{Deserialize, Serialize};

use crate::data::{FrameShape, PixelType};
use crate::error::VoxError;

/// 3-D float vector used for stage position and voxel size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
}

impl Vec3 {
    /// Create a new vector.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Unit vector `(1, 1, 1)`, the default voxel size.
    #[must_use]
    pub const fn ones() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Description of one volume: its dimensions, placement and naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterMetadata {
    /// Total number of frames in the volume (z depth)
    pub frame_count: u64,
    /// Shape of every frame
    pub frame_shape: FrameShape,
    /// Stage position of the volume origin
    #[serde(default)]
    pub position: Vec3,
    /// Output base name (no directory, no extension)
    pub file_name: String,
    /// Channel label
    #[serde(default)]
    pub channel: String,
    /// Physical voxel size
    #[serde(default = "Vec3::ones")]
    pub voxel_size: Vec3,
    /// Pixel element type
    #[serde(default)]
    pub pixel_type: PixelType,
}

impl WriterMetadata {
    /// Create metadata with default position, channel, voxel size and 16-bit pixels.
    pub fn new(frame_count: u64, frame_shape: FrameShape, file_name: impl Into<String>) -> Self {
        Self {
            frame_count,
            frame_shape,
            position: Vec3::default(),
            file_name: file_name.into(),
            channel: String::new(),
            voxel_size: Vec3::ones(),
            pixel_type: PixelType::U16,
        }
    }

    /// Set the stage position.
    #[must_use]
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Set the channel label.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the voxel size.
    #[must_use]
    pub fn with_voxel_size(mut self, voxel_size: Vec3) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    /// Set the pixel type.
    #[must_use]
    pub fn with_pixel_type(mut self, pixel_type: PixelType) -> Self {
        self.pixel_type = pixel_type;
        self
    }

    /// Validate the metadata.
    ///
    /// Rejects non-positive dimensions, an empty or path-like file name,
    /// non-finite positions and non-positive voxel sizes.
    pub fn validate(&self) -> Result<(), VoxError> {
        if self.frame_count == 0 {
            return Err(VoxError::InvalidMetadata(
                "frame_count must be positive".into(),
            ));
        }
        if !self.frame_shape.is_positive() {
            return Err(VoxError::InvalidMetadata(format!(
                "frame_shape must be positive, got {}",
                self.frame_shape
            )));
        }
        if self.file_name.trim().is_empty() {
            return Err(VoxError::InvalidMetadata("file_name must not be empty".into()));
        }
        if self.file_name.contains(['/', '\\']) {
            return Err(VoxError::InvalidMetadata(format!(
                "file_name '{}' must not contain path separators",
                self.file_name
            )));
        }
        if !self.position.is_finite() {
            return Err(VoxError::InvalidMetadata(format!(
                "position must be finite, got {}",
                self.position
            )));
        }
        let v = &self.voxel_size;
        if !v.is_finite() || v.x <= 0.0 || v.y <= 0.0 || v.z <= 0.0 {
            return Err(VoxError::InvalidMetadata(format!(
                "voxel_size must be positive, got {}",
                self.voxel_size
            )));
        }
        Ok(())
    }

    /// Bytes in one frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.frame_shape.pixel_count() * self.pixel_type.element_size()
    }

    /// Number of batches needed to cover the volume at `batch_depth`.
    #[must_use]
    pub fn batch_count(&self, batch_depth: usize) -> u64 {
        if batch_depth == 0 {
            return 0;
        }
        self.frame_count.div_ceil(batch_depth as u64)
    }

    /// JSON descriptor embedded in sidecars and image descriptions.
    #[must_use]
    pub fn descriptor(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.file_name,
            "channel": self.channel,
            "pixel_type": self.pixel_type,
            "axes": "ZYX",
            "size": {
                "x": self.frame_shape.width,
                "y": self.frame_shape.height,
                "z": self.frame_count,
            },
            "voxel_size_um": self.voxel_size,
            "position_mm": self.position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> WriterMetadata {
        WriterMetadata::new(9, FrameShape::new(4, 4), "stack")
    }

    #[test]
    fn test_valid_metadata() {
        assert!(metadata().validate().is_ok());
    }

    #[test]
    fn test_zero_width_rejected() {
        let meta = WriterMetadata::new(9, FrameShape::new(0, 10), "stack");
        assert!(matches!(meta.validate(), Err(VoxError::InvalidMetadata(_))));
    }

    #[test]
    fn test_zero_frame_count_rejected() {
        let meta = WriterMetadata::new(0, FrameShape::new(4, 4), "stack");
        assert!(matches!(meta.validate(), Err(VoxError::InvalidMetadata(_))));
    }

    #[test]
    fn test_empty_and_path_file_names_rejected() {
        let mut meta = metadata();
        meta.file_name = "  ".into();
        assert!(meta.validate().is_err());
        meta.file_name = "../escape".into();
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_voxel_size_must_be_positive() {
        let meta = metadata().with_voxel_size(Vec3::new(0.1, 0.0, 1.0));
        assert!(meta.validate().is_err());
        let meta = metadata().with_voxel_size(Vec3::new(0.1, f64::NAN, 1.0));
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(metadata().batch_count(4), 3);
        let meta = WriterMetadata::new(100, FrameShape::new(4, 4), "stack");
        assert_eq!(meta.batch_count(64), 2);
        assert_eq!(meta.batch_count(100), 1);
    }

    #[test]
    fn test_descriptor_fields() {
        let meta = metadata().with_channel("488nm");
        let desc = meta.descriptor();
        assert_eq!(desc["channel"], "488nm");
        assert_eq!(desc["size"]["z"], 9);
        assert_eq!(desc["pixel_type"], "uint16");
    }

    #[test]
    fn test_metadata_defaults_from_json() {
        let json = r#"{"frame_count": 3, "frame_shape": {"width": 2, "height": 2}, "file_name": "a"}"#;
        let meta: WriterMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.voxel_size, Vec3::ones());
        assert_eq!(meta.pixel_type, PixelType::U16);
    }
}
