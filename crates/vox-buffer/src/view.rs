//! Borrowed, read-only view of one batch.

use parking_lot::MutexGuard;

use vox_core::{Frame, FrameShape, PixelStats, PixelType};

/// The first `valid_depth` frames of the read region.
///
/// The view borrows the reader, so it cannot outlive the `process_batch` call it
/// is handed to, and frames past `valid_depth` are unreachable. While a view is
/// alive the reader's read lock is held.
pub struct BatchView<'a> {
    bytes: &'a [u8],
    region: u32,
    valid_depth: usize,
    depth: usize,
    shape: FrameShape,
    pixel_type: PixelType,
    frame_bytes: usize,
    _read_guard: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for BatchView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchView")
            .field("region", &self.region)
            .field("valid_depth", &self.valid_depth)
            .field("depth", &self.depth)
            .field("shape", &self.shape)
            .field("pixel_type", &self.pixel_type)
            .finish()
    }
}

impl<'a> BatchView<'a> {
    pub(crate) fn new(
        bytes: &'a [u8],
        region: u32,
        depth: usize,
        shape: FrameShape,
        pixel_type: PixelType,
        read_guard: MutexGuard<'a, ()>,
    ) -> Self {
        let frame_bytes = shape.pixel_count() * pixel_type.element_size();
        let valid_depth = if frame_bytes == 0 {
            0
        } else {
            bytes.len() / frame_bytes
        };
        Self {
            bytes,
            region,
            valid_depth,
            depth,
            shape,
            pixel_type,
            frame_bytes,
            _read_guard: read_guard,
        }
    }

    /// Region index this view reads.
    #[must_use]
    pub fn region(&self) -> u32 {
        self.region
    }

    /// Number of meaningful frames.
    #[must_use]
    pub fn valid_depth(&self) -> usize {
        self.valid_depth
    }

    /// Region capacity in frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Shape of every frame.
    #[must_use]
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Pixel element type.
    #[must_use]
    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Bytes per frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// All valid frames as one contiguous little-endian byte run.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Raw bytes of frame `index`, `None` past `valid_depth`.
    #[must_use]
    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        if index >= self.valid_depth {
            return None;
        }
        let start = index * self.frame_bytes;
        self.bytes.get(start..start + self.frame_bytes)
    }

    /// Iterate the valid frames in order.
    pub fn frames(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.bytes.chunks_exact(self.frame_bytes.max(1))
    }

    /// Frame `index` reinterpreted as a typed pixel slice.
    ///
    /// `None` past `valid_depth` or when `T` does not match the pixel layout.
    #[must_use]
    pub fn frame_as<T: bytemuck::Pod>(&self, index: usize) -> Option<&[T]> {
        if std::mem::size_of::<T>() != self.pixel_type.element_size() {
            return None;
        }
        bytemuck::try_cast_slice(self.frame(index)?).ok()
    }

    /// Copy frame `index` out of shared memory.
    #[must_use]
    pub fn to_frame(&self, index: usize) -> Option<Frame> {
        let bytes = self.frame(index)?;
        Some(Frame::from_bytes(
            self.shape.width,
            self.shape.height,
            self.pixel_type,
            bytes.to_vec(),
        ))
    }

    /// Min/max/mean of frame `index`.
    #[must_use]
    pub fn frame_stats(&self, index: usize) -> Option<PixelStats> {
        PixelStats::compute(self.pixel_type, self.frame(index)?)
    }

    /// Min/max/mean over every valid frame.
    #[must_use]
    pub fn stats(&self) -> Option<PixelStats> {
        PixelStats::compute(self.pixel_type, self.bytes)
    }
}
