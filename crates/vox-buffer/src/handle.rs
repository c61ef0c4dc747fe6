//! Serializable reference to a shared segment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use vox_core::{FrameShape, PixelType};

/// Dimensions of one region: `depth` frames of `height` rows by `width` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferShape {
    /// Frames per region
    pub depth: usize,
    /// Rows per frame
    pub height: u32,
    /// Columns per frame
    pub width: u32,
}

impl BufferShape {
    /// Shape holding `depth` frames of `frame`.
    #[must_use]
    pub const fn new(depth: usize, frame: FrameShape) -> Self {
        Self {
            depth,
            height: frame.height,
            width: frame.width,
        }
    }

    /// Shape of one frame.
    #[must_use]
    pub const fn frame_shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height)
    }
}

impl std::fmt::Display for BufferShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.depth, self.height, self.width)
    }
}

/// Everything another process needs to map a segment.
///
/// Only the path and layout cross the process boundary, never pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferHandle {
    /// Backing file of the segment
    pub path: PathBuf,
    /// Region dimensions
    pub shape: BufferShape,
    /// Pixel element type
    pub pixel_type: PixelType,
}

impl BufferHandle {
    /// Bytes in one frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.shape.frame_shape().pixel_count() * self.pixel_type.element_size()
    }
}
