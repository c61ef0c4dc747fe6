//! Synthetic frame sources.
//!
//! Any `IntoIterator<Item = Frame>` is a valid frame source for the writer.
//! These generators stand in for a camera when testing or benchmarking:
//!
//! - [`IndexedFrames`]: frame *i* has every pixel set to *i* (modulo the pixel
//!   type's range), which lets a backend verify ordering and completeness.
//! - [`TestPatternFrames`]: a moving gradient over a checkerboard, useful to
//!   eyeball written stacks.

use crate::data::{Frame, FrameShape, PixelType};

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fff_ffff
}

/// Value stored in every pixel of frame `index` by [`IndexedFrames`].
#[must_use]
pub fn indexed_value(pixel_type: PixelType, index: u64) -> f64 {
    match pixel_type {
        PixelType::U8 => (index % (u64::from(u8::MAX) + 1)) as f64,
        PixelType::U16 => (index % (u64::from(u16::MAX) + 1)) as f64,
        PixelType::U32 => (index % (u64::from(u32::MAX) + 1)) as f64,
        PixelType::F32 => index as f64,
    }
}

/// Finite sequence of frames where frame *i* is filled with *i*.
#[derive(Debug, Clone)]
pub struct IndexedFrames {
    shape: FrameShape,
    pixel_type: PixelType,
    next: u64,
    count: u64,
}

impl IndexedFrames {
    /// Create a generator yielding `count` frames.
    #[must_use]
    pub fn new(shape: FrameShape, pixel_type: PixelType, count: u64) -> Self {
        Self {
            shape,
            pixel_type,
            next: 0,
            count,
        }
    }
}

impl Iterator for IndexedFrames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.next >= self.count {
            return None;
        }
        let value = indexed_value(self.pixel_type, self.next);
        self.next += 1;
        Some(Frame::filled(self.shape, self.pixel_type, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.count - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for IndexedFrames {}

/// Generate one 16-bit diagnostic frame.
///
/// A diagonal gradient that drifts with `frame_num`, overlaid on a
/// checkerboard, with low-amplitude per-frame noise.
#[must_use]
pub fn generate_test_pattern(width: u32, height: u32, frame_num: u64) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u16; w * h];

    let checker_size = (width.min(height) / 8).max(1) as usize;
    let span = (w + h).max(1);
    let shift = (frame_num as usize).wrapping_mul(3);
    let frame_seed = frame_num.wrapping_mul(2654435761);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let gradient = ((x + y + shift) % span) * 40_000 / span;
            let checker = if ((x / checker_size) + (y / checker_size)) % 2 == 0 {
                8_000
            } else {
                0
            };
            let noise = (prng(frame_seed ^ idx as u64) & 0x3FF) as usize;
            buffer[idx] = (gradient + checker + noise).min(u16::MAX as usize) as u16;
        }
    }

    buffer
}

/// Finite sequence of 16-bit test pattern frames.
#[derive(Debug, Clone)]
pub struct TestPatternFrames {
    shape: FrameShape,
    next: u64,
    count: u64,
}

impl TestPatternFrames {
    /// Create a generator yielding `count` frames.
    #[must_use]
    pub fn new(shape: FrameShape, count: u64) -> Self {
        Self {
            shape,
            next: 0,
            count,
        }
    }
}

impl Iterator for TestPatternFrames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.next >= self.count {
            return None;
        }
        let pixels = generate_test_pattern(self.shape.width, self.shape.height, self.next);
        self.next += 1;
        Some(Frame::from_u16(self.shape.width, self.shape.height, &pixels))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.count - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TestPatternFrames {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_frames_fill_values() {
        let frames: Vec<Frame> =
            IndexedFrames::new(FrameShape::new(3, 2), PixelType::U16, 5).collect();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            let stats = frame.stats().unwrap();
            assert_eq!(stats.min, i as f64);
            assert_eq!(stats.max, i as f64);
        }
    }

    #[test]
    fn test_indexed_value_wraps_u8() {
        assert_eq!(indexed_value(PixelType::U8, 255), 255.0);
        assert_eq!(indexed_value(PixelType::U8, 256), 0.0);
        assert_eq!(indexed_value(PixelType::U16, 256), 256.0);
    }

    #[test]
    fn test_test_pattern_deterministic_and_moving() {
        let a = generate_test_pattern(32, 16, 0);
        let b = generate_test_pattern(32, 16, 0);
        let c = generate_test_pattern(32, 16, 1);
        assert_eq!(a.len(), 32 * 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_pattern_frames_exact_size() {
        let mut frames = TestPatternFrames::new(FrameShape::new(8, 8), 3);
        assert_eq!(frames.len(), 3);
        let first = frames.next().unwrap();
        assert!(first.validate().is_ok());
        assert_eq!(frames.len(), 2);
    }
}
