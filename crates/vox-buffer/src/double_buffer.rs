//! Producer side of the shared double buffer.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vox_core::{limits, Frame, FrameShape, PixelType, VoxError};

use crate::handle::{BufferHandle, BufferShape};
use crate::segment::{default_segment_dir, Segment, SegmentProgress};

/// Record of one role swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapTicket {
    /// Region that just became readable
    pub region: u32,
    /// Frames the region holds
    pub valid_depth: usize,
    /// Zero-based index of this swap (equals the batch index)
    pub swap_index: u64,
}

/// Two equally sized regions in one memory-mapped segment.
///
/// The producer appends frames to the write region with [`add_frame`] and hands
/// the region to the consumer with [`toggle`]. The consumer resolves the
/// segment from [`handle`] with a [`BufferReader`](crate::BufferReader).
///
/// # Thread Safety
/// `add_frame` and `toggle` serialize through an internal write lock. Region
/// roles live in atomics in the segment header so other processes observe them.
///
/// [`add_frame`]: SharedDoubleBuffer::add_frame
/// [`toggle`]: SharedDoubleBuffer::toggle
/// [`handle`]: SharedDoubleBuffer::handle
pub struct SharedDoubleBuffer {
    segment: Option<Segment>,
    handle: BufferHandle,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SharedDoubleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDoubleBuffer")
            .field("path", &self.handle.path)
            .field("shape", &self.handle.shape)
            .field("pixel_type", &self.handle.pixel_type)
            .field("write_region", &self.write_region())
            .field("fill", &self.fill())
            .field("released", &self.is_released())
            .finish()
    }
}

impl SharedDoubleBuffer {
    /// Allocate a segment holding two regions of `depth` frames of `shape`.
    ///
    /// The segment file is created in `dir`, or in [`default_segment_dir`] when
    /// `dir` is `None`, under a unique name.
    ///
    /// # Errors
    /// `Allocation` when any dimension is zero, the byte size overflows, or the
    /// host cannot reserve the segment.
    pub fn allocate(
        shape: FrameShape,
        depth: usize,
        pixel_type: PixelType,
        dir: Option<&Path>,
    ) -> Result<Self, VoxError> {
        limits::validate_batch_depth(depth)?;
        limits::validate_frame_size(shape.width, shape.height, pixel_type)?;

        let dir: PathBuf = dir.map_or_else(default_segment_dir, Path::to_path_buf);
        let path = dir.join(format!("vox-{}.seg", Uuid::new_v4()));
        let buffer_shape = BufferShape::new(depth, shape);

        let segment = Segment::create(&path, buffer_shape, pixel_type)?;
        info!(
            path = %path.display(),
            shape = %buffer_shape,
            %pixel_type,
            region_bytes = segment.layout().region_bytes,
            "Allocated shared double buffer"
        );

        Ok(Self {
            segment: Some(segment),
            handle: BufferHandle {
                path,
                shape: buffer_shape,
                pixel_type,
            },
            write_lock: Mutex::new(()),
        })
    }

    fn segment(&self) -> Result<&Segment, VoxError> {
        self.segment
            .as_ref()
            .ok_or_else(|| VoxError::Allocation("buffer has been released".into()))
    }

    /// Copy `frame` into the next free slot of the write region.
    ///
    /// Returns the slot index the frame landed in.
    ///
    /// # Errors
    /// `PixelTypeMismatch` or `ShapeMismatch` for a foreign frame, `BufferFull`
    /// when the write region has no free slot.
    pub fn add_frame(&self, frame: &Frame) -> Result<usize, VoxError> {
        let segment = self.segment()?;
        let expected_shape = self.handle.shape.frame_shape();

        if frame.pixel_type != self.handle.pixel_type {
            return Err(VoxError::PixelTypeMismatch {
                expected: self.handle.pixel_type,
                actual: frame.pixel_type,
            });
        }
        if frame.shape() != expected_shape {
            return Err(VoxError::ShapeMismatch {
                expected: expected_shape,
                actual: frame.shape(),
            });
        }
        frame.validate()?;

        let _guard = self.write_lock.lock();
        let header = segment.header();
        let slot = header.fill.load(Ordering::Acquire) as usize;
        if slot >= self.handle.shape.depth {
            return Err(VoxError::BufferFull {
                capacity: self.handle.shape.depth,
            });
        }
        let region = header.write_region.load(Ordering::Acquire);

        // SAFETY: write lock held and `region` is the write region
        unsafe { segment.write_slot(region, slot, &frame.data) };
        header.fill.store(slot as u64 + 1, Ordering::Release);

        Ok(slot)
    }

    /// Swap region roles.
    ///
    /// The write region becomes the read region holding the frames written since
    /// the last swap, and the former read region becomes writable with its fill
    /// counter reset. The caller must have observed the consumer release the
    /// former read region.
    pub fn toggle(&self) -> Result<SwapTicket, VoxError> {
        let segment = self.segment()?;
        let _guard = self.write_lock.lock();
        let header = segment.header();

        let old_write = header.write_region.load(Ordering::Acquire);
        let valid_depth = header.fill.load(Ordering::Acquire);

        header.read_valid_depth.store(valid_depth, Ordering::Release);
        header.read_region.store(old_write, Ordering::Release);
        header.write_region.store(1 - old_write, Ordering::Release);
        header.fill.store(0, Ordering::Release);
        let swap_index = header.swaps.fetch_add(1, Ordering::AcqRel);

        debug!(
            swap_index,
            read_region = old_write,
            valid_depth,
            "Toggled buffer regions"
        );

        Ok(SwapTicket {
            region: old_write,
            valid_depth: valid_depth as usize,
            swap_index,
        })
    }

    /// Unmap both regions and unlink the segment file. Idempotent.
    pub fn close_and_release(&mut self) {
        let Some(segment) = self.segment.take() else {
            return;
        };
        let path = segment.path().to_path_buf();
        drop(segment);
        match std::fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "Released shared double buffer"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to unlink segment"),
        }
    }

    /// Whether [`close_and_release`](Self::close_and_release) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.segment.is_none()
    }

    /// Region the producer currently appends to.
    #[must_use]
    pub fn write_region(&self) -> u32 {
        self.segment
            .as_ref()
            .map_or(0, |s| s.header().write_region.load(Ordering::Acquire))
    }

    /// Region the consumer currently owns.
    #[must_use]
    pub fn read_region(&self) -> u32 {
        self.segment
            .as_ref()
            .map_or(1, |s| s.header().read_region.load(Ordering::Acquire))
    }

    /// Frames written to the write region since the last swap.
    #[must_use]
    pub fn fill(&self) -> usize {
        self.segment
            .as_ref()
            .map_or(0, |s| s.header().fill.load(Ordering::Acquire) as usize)
    }

    /// Completed swaps.
    #[must_use]
    pub fn swaps(&self) -> u64 {
        self.segment
            .as_ref()
            .map_or(0, |s| s.header().swaps.load(Ordering::Acquire))
    }

    /// Depth capacity of one region.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.handle.shape.depth
    }

    /// Serializable reference for the consumer.
    #[must_use]
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    /// Progress mirrored by the consumer, if the segment is still mapped.
    #[must_use]
    pub fn progress(&self) -> Option<SegmentProgress> {
        self.segment.as_ref().map(|s| s.header().progress())
    }
}

impl Drop for SharedDoubleBuffer {
    fn drop(&mut self) {
        self.close_and_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocate(depth: usize) -> (tempfile::TempDir, SharedDoubleBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buffer =
            SharedDoubleBuffer::allocate(FrameShape::new(4, 3), depth, PixelType::U16, Some(dir.path()))
                .unwrap();
        (dir, buffer)
    }

    fn frame(value: f64) -> Frame {
        Frame::filled(FrameShape::new(4, 3), PixelType::U16, value)
    }

    #[test]
    fn test_allocate_rejects_zero_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            SharedDoubleBuffer::allocate(FrameShape::new(0, 3), 4, PixelType::U16, Some(dir.path()));
        assert!(matches!(result, Err(VoxError::Allocation(_))));
        let result =
            SharedDoubleBuffer::allocate(FrameShape::new(4, 3), 0, PixelType::U16, Some(dir.path()));
        assert!(matches!(result, Err(VoxError::Allocation(_))));
    }

    #[test]
    fn test_allocate_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result =
            SharedDoubleBuffer::allocate(FrameShape::new(4, 3), 4, PixelType::U16, Some(&missing));
        assert!(matches!(result, Err(VoxError::Allocation(_))));
    }

    #[test]
    fn test_add_frame_advances_fill() {
        let (_dir, buffer) = allocate(3);
        assert_eq!(buffer.add_frame(&frame(1.0)).unwrap(), 0);
        assert_eq!(buffer.add_frame(&frame(2.0)).unwrap(), 1);
        assert_eq!(buffer.fill(), 2);
        assert_eq!(buffer.write_region(), 0);
    }

    #[test]
    fn test_buffer_full() {
        let (_dir, buffer) = allocate(2);
        buffer.add_frame(&frame(1.0)).unwrap();
        buffer.add_frame(&frame(2.0)).unwrap();
        assert!(matches!(
            buffer.add_frame(&frame(3.0)),
            Err(VoxError::BufferFull { capacity: 2 })
        ));
    }

    #[test]
    fn test_shape_and_type_mismatch() {
        let (_dir, buffer) = allocate(2);
        let wrong_shape = Frame::filled(FrameShape::new(3, 4), PixelType::U16, 0.0);
        assert!(matches!(
            buffer.add_frame(&wrong_shape),
            Err(VoxError::ShapeMismatch { .. })
        ));
        let wrong_type = Frame::filled(FrameShape::new(4, 3), PixelType::U8, 0.0);
        assert!(matches!(
            buffer.add_frame(&wrong_type),
            Err(VoxError::PixelTypeMismatch { .. })
        ));
        assert_eq!(buffer.fill(), 0);
    }

    #[test]
    fn test_toggle_swaps_roles() {
        let (_dir, buffer) = allocate(4);
        buffer.add_frame(&frame(1.0)).unwrap();
        buffer.add_frame(&frame(2.0)).unwrap();

        let ticket = buffer.toggle().unwrap();
        assert_eq!(
            ticket,
            SwapTicket {
                region: 0,
                valid_depth: 2,
                swap_index: 0
            }
        );
        assert_eq!(buffer.write_region(), 1);
        assert_eq!(buffer.read_region(), 0);
        assert_eq!(buffer.fill(), 0);

        buffer.add_frame(&frame(3.0)).unwrap();
        let ticket = buffer.toggle().unwrap();
        assert_eq!(ticket.region, 1);
        assert_eq!(ticket.valid_depth, 1);
        assert_eq!(ticket.swap_index, 1);
        assert_eq!(buffer.swaps(), 2);
    }

    #[test]
    fn test_close_and_release_is_idempotent() {
        let (_dir, mut buffer) = allocate(2);
        let path = buffer.handle().path.clone();
        assert!(path.exists());

        buffer.close_and_release();
        assert!(!path.exists());
        assert!(buffer.is_released());
        buffer.close_and_release();

        assert!(matches!(
            buffer.add_frame(&frame(0.0)),
            Err(VoxError::Allocation(_))
        ));
        assert!(buffer.toggle().is_err());
    }

    #[test]
    fn test_drop_unlinks_segment() {
        let (_dir, buffer) = allocate(2);
        let path = buffer.handle().path.clone();
        drop(buffer);
        assert!(!path.exists());
    }
}
