use serde::{Deserialize, Serialize};

use crate::error::VoxError;

/// Element type of a frame's pixels.
///
/// Pixel bytes are always stored little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelType {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    #[serde(rename = "uint8")]
    U8,
    /// 16-bit unsigned integer pixels (2 bytes/pixel) - native format of scientific cameras
    #[default]
    #[serde(rename = "uint16")]
    U16,
    /// 32-bit unsigned integer pixels (4 bytes/pixel)
    #[serde(rename = "uint32")]
    U32,
    /// 32-bit floating point pixels (4 bytes/pixel) - for processed data
    #[serde(rename = "float32")]
    F32,
}

impl PixelType {
    /// Bytes per pixel.
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::U32 | PixelType::F32 => 4,
        }
    }

    /// Stable numeric code, stored in shared segment headers.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::U32 => 3,
            PixelType::F32 => 4,
        }
    }

    /// Inverse of [`PixelType::code`].
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PixelType::U8),
            2 => Some(PixelType::U16),
            3 => Some(PixelType::U32),
            4 => Some(PixelType::F32),
            _ => None,
        }
    }

    /// Decode the pixel at `index` from a little-endian byte slice.
    #[must_use]
    pub fn read(self, bytes: &[u8], index: usize) -> Option<f64> {
        let size = self.element_size();
        let start = index.checked_mul(size)?;
        let raw = bytes.get(start..start + size)?;
        let value = match self {
            PixelType::U8 => f64::from(raw[0]),
            PixelType::U16 => f64::from(u16::from_le_bytes([raw[0], raw[1]])),
            PixelType::U32 => f64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            PixelType::F32 => f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        };
        Some(value)
    }

    /// Encode `value` as one little-endian pixel, saturating to the type's range.
    #[must_use]
    pub fn encode(self, value: f64) -> Vec<u8> {
        match self {
            PixelType::U8 => vec![value.clamp(0.0, f64::from(u8::MAX)) as u8],
            PixelType::U16 => (value.clamp(0.0, f64::from(u16::MAX)) as u16)
                .to_le_bytes()
                .to_vec(),
            PixelType::U32 => (value.clamp(0.0, f64::from(u32::MAX)) as u32)
                .to_le_bytes()
                .to_vec(),
            PixelType::F32 => (value as f32).to_le_bytes().to_vec(),
        }
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PixelType::U8 => "uint8",
            PixelType::U16 => "uint16",
            PixelType::U32 => "uint32",
            PixelType::F32 => "float32",
        };
        write!(f, "{}", label)
    }
}

/// 2-D frame dimensions. `width` is the column count, `height` the row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    /// Columns (x)
    pub width: u32,
    /// Rows (y)
    pub height: u32,
}

impl FrameShape {
    /// Create a new shape.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame.
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether both dimensions are positive.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl std::fmt::Display for FrameShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Summary statistics over a run of pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelStats {
    /// Smallest pixel value
    pub min: f64,
    /// Largest pixel value
    pub max: f64,
    /// Arithmetic mean
    pub mean: f64,
}

impl PixelStats {
    /// Compute statistics over little-endian pixel bytes.
    ///
    /// Returns `None` for an empty slice.
    #[must_use]
    pub fn compute(pixel_type: PixelType, bytes: &[u8]) -> Option<Self> {
        let count = bytes.len() / pixel_type.element_size();
        if count == 0 {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for idx in 0..count {
            let value = pixel_type.read(bytes, idx)?;
            min = min.min(value);
            max = max.max(value);
            sum += value;
        }
        Some(Self {
            min,
            max,
            mean: sum / count as f64,
        })
    }
}

/// Represents a single image frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`), row-major, little-endian:
/// - 8-bit images: 1 byte per pixel.
/// - 16-bit images: 2 bytes per pixel.
/// - 32-bit integer and float images: 4 bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Element type
    pub pixel_type: PixelType,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            pixel_type: PixelType::U16,
            data,
        }
    }

    /// Create a frame from raw little-endian bytes with an explicit pixel type.
    ///
    /// The caller must ensure the buffer length matches; see [`Frame::validate`].
    pub fn from_bytes(width: u32, height: u32, pixel_type: PixelType, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixel_type,
            data,
        }
    }

    /// Create a frame with every pixel set to `value`.
    pub fn filled(shape: FrameShape, pixel_type: PixelType, value: f64) -> Self {
        let pixel = pixel_type.encode(value);
        let data = pixel.repeat(shape.pixel_count());
        Self::from_bytes(shape.width, shape.height, pixel_type, data)
    }

    /// Frame dimensions.
    #[must_use]
    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height)
    }

    /// Expected byte length for this frame's shape and pixel type.
    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.shape().pixel_count() * self.pixel_type.element_size()
    }

    /// Check that the data length agrees with shape and pixel type.
    pub fn validate(&self) -> Result<(), VoxError> {
        if self.data.len() != self.expected_len() {
            return Err(VoxError::FrameSizeMismatch {
                expected: self.expected_len(),
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Get pixel value at (x, y).
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y as usize * self.width as usize + x as usize;
        self.pixel_type.read(&self.data, idx)
    }

    /// Min/max/mean over all pixels.
    #[must_use]
    pub fn stats(&self) -> Option<PixelStats> {
        PixelStats::compute(self.pixel_type, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_little_endian() {
        let frame = Frame::from_u16(2, 1, &[0x0102, 0xA0B0]);
        assert_eq!(frame.data, vec![0x02, 0x01, 0xB0, 0xA0]);
        assert_eq!(frame.get(1, 0), Some(f64::from(0xA0B0u16)));
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn test_filled_frame() {
        let frame = Frame::filled(FrameShape::new(4, 3), PixelType::U16, 7.0);
        assert_eq!(frame.data.len(), 24);
        let stats = frame.stats().unwrap();
        assert_eq!(stats.min, 7.0);
        assert_eq!(stats.max, 7.0);
        assert_eq!(stats.mean, 7.0);
    }

    #[test]
    fn test_encode_saturates() {
        assert_eq!(PixelType::U8.encode(300.0), vec![255]);
        assert_eq!(PixelType::U16.encode(-5.0), vec![0, 0]);
    }

    #[test]
    fn test_validate_rejects_short_data() {
        let frame = Frame::from_bytes(4, 4, PixelType::U16, vec![0u8; 10]);
        assert!(matches!(
            frame.validate(),
            Err(VoxError::FrameSizeMismatch {
                expected: 32,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_pixel_type_codes_round_trip() {
        for ty in [PixelType::U8, PixelType::U16, PixelType::U32, PixelType::F32] {
            assert_eq!(PixelType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(PixelType::from_code(0), None);
    }

    #[test]
    fn test_get_out_of_bounds() {
        let frame = Frame::from_bytes(2, 2, PixelType::U8, vec![1, 2, 3, 4]);
        assert_eq!(frame.get(1, 1), Some(4.0));
        assert_eq!(frame.get(2, 0), None);
    }

    #[test]
    fn test_pixel_type_serde_names() {
        let json = serde_json::to_string(&PixelType::U16).unwrap();
        assert_eq!(json, "\"uint16\"");
        let ty: PixelType = serde_json::from_str("\"float32\"").unwrap();
        assert_eq!(ty, PixelType::F32);
    }
}
