//! Consumer side of the shared double buffer.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use tracing::debug;

use vox_core::VoxError;

use crate::handle::BufferHandle;
use crate::segment::{Segment, SegmentProgress};
use crate::view::BatchView;

/// Read-only attachment to a segment created by a
/// [`SharedDoubleBuffer`](crate::SharedDoubleBuffer), possibly in another process.
pub struct BufferReader {
    segment: Segment,
    read_lock: Mutex<()>,
}

impl std::fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReader")
            .field("segment", &self.segment)
            .field("read_region", &self.read_region())
            .finish()
    }
}

impl BufferReader {
    /// Map the segment named by `handle` and validate its header.
    pub fn open(handle: &BufferHandle) -> Result<Self, VoxError> {
        let segment = Segment::open(handle)?;
        debug!(path = %handle.path.display(), shape = %handle.shape, "Opened buffer reader");
        Ok(Self {
            segment,
            read_lock: Mutex::new(()),
        })
    }

    /// View the first `valid_depth` frames of `region`.
    ///
    /// # Errors
    /// `RegionConflict` unless `region` is the current read region;
    /// `DepthOutOfRange` when `valid_depth` exceeds the region depth.
    pub fn batch(&self, region: u32, valid_depth: usize) -> Result<BatchView<'_>, VoxError> {
        let guard = self.read_lock.lock();
        let header = self.segment.header();
        let read_region = header.read_region.load(Ordering::Acquire);
        if region > 1 || region != read_region {
            return Err(VoxError::RegionConflict {
                region,
                read_region,
            });
        }
        let depth = self.segment.shape().depth;
        if valid_depth > depth {
            return Err(VoxError::DepthOutOfRange { valid_depth, depth });
        }

        // SAFETY: `region` is the read region; the producer does not toggle it back
        // until this consumer publishes a release after the view is dropped
        let bytes = unsafe { self.segment.region_slice(region, valid_depth) };
        Ok(BatchView::new(
            bytes,
            region,
            depth,
            self.segment.shape().frame_shape(),
            self.segment.pixel_type(),
            guard,
        ))
    }

    /// Mirror release and progress counters into the segment header.
    pub fn publish_progress(&self, batches_released: u64, frames_processed: u64, progress: f64) {
        let header = self.segment.header();
        header
            .frames_processed
            .store(frames_processed, Ordering::Release);
        header
            .progress_bits
            .store(progress.clamp(0.0, 1.0).to_bits(), Ordering::Release);
        header
            .batches_released
            .store(batches_released, Ordering::Release);
    }

    /// Flag the segment as belonging to a failed consumer.
    pub fn mark_failed(&self) {
        self.segment.header().failed.store(1, Ordering::Release);
    }

    /// Progress as last published by the consumer.
    #[must_use]
    pub fn progress(&self) -> SegmentProgress {
        self.segment.header().progress()
    }

    /// Region the producer currently appends to.
    #[must_use]
    pub fn write_region(&self) -> u32 {
        self.segment.header().write_region.load(Ordering::Acquire)
    }

    /// Region the consumer currently owns.
    #[must_use]
    pub fn read_region(&self) -> u32 {
        self.segment.header().read_region.load(Ordering::Acquire)
    }

    /// Frames the producer has written since its last swap.
    #[must_use]
    pub fn fill(&self) -> usize {
        self.segment.header().fill.load(Ordering::Acquire) as usize
    }

    /// Frames the read region holds according to the last swap.
    #[must_use]
    pub fn read_valid_depth(&self) -> usize {
        self.segment.header().read_valid_depth.load(Ordering::Acquire) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedDoubleBuffer;
    use vox_core::{Frame, FrameShape, PixelType};

    fn setup(depth: usize) -> (tempfile::TempDir, SharedDoubleBuffer, BufferReader) {
        let dir = tempfile::tempdir().unwrap();
        let buffer =
            SharedDoubleBuffer::allocate(FrameShape::new(2, 2), depth, PixelType::U16, Some(dir.path()))
                .unwrap();
        let reader = BufferReader::open(buffer.handle()).unwrap();
        (dir, buffer, reader)
    }

    #[test]
    fn test_batch_requires_read_region() {
        let (_dir, buffer, reader) = setup(4);
        buffer
            .add_frame(&Frame::filled(FrameShape::new(2, 2), PixelType::U16, 5.0))
            .unwrap();

        // Region 0 is still the write region
        assert!(matches!(
            reader.batch(0, 1),
            Err(VoxError::RegionConflict {
                region: 0,
                read_region: 1
            })
        ));

        let ticket = buffer.toggle().unwrap();
        let view = reader.batch(ticket.region, ticket.valid_depth).unwrap();
        assert_eq!(view.valid_depth(), 1);
        assert_eq!(view.frame_as::<u16>(0).unwrap(), &[5, 5, 5, 5]);
    }

    #[test]
    fn test_batch_rejects_excess_depth_and_bad_region() {
        let (_dir, _buffer, reader) = setup(4);
        assert!(matches!(
            reader.batch(1, 5),
            Err(VoxError::DepthOutOfRange {
                valid_depth: 5,
                depth: 4
            })
        ));
        assert!(matches!(
            reader.batch(2, 1),
            Err(VoxError::RegionConflict { .. })
        ));
    }

    #[test]
    fn test_stale_frames_unreachable() {
        let (_dir, buffer, reader) = setup(3);
        let shape = FrameShape::new(2, 2);
        for v in 0..3 {
            buffer
                .add_frame(&Frame::filled(shape, PixelType::U16, f64::from(v)))
                .unwrap();
        }
        let first = buffer.toggle().unwrap();
        buffer
            .add_frame(&Frame::filled(shape, PixelType::U16, 9.0))
            .unwrap();
        // Release region 0, refill it with one frame
        drop(reader.batch(first.region, first.valid_depth).unwrap());
        let second = buffer.toggle().unwrap();
        buffer
            .add_frame(&Frame::filled(shape, PixelType::U16, 7.0))
            .unwrap();
        let third = buffer.toggle().unwrap();
        assert_eq!(third.region, 0);
        assert_eq!(second.region, 1);

        let view = reader.batch(third.region, third.valid_depth).unwrap();
        assert_eq!(view.valid_depth(), 1);
        assert_eq!(view.frame_as::<u16>(0).unwrap()[0], 7);
        assert!(view.frame(1).is_none());
        assert!(view.to_frame(2).is_none());
        assert_eq!(view.frames().count(), 1);
    }

    #[test]
    fn test_progress_visible_to_producer() {
        let (_dir, buffer, reader) = setup(2);
        reader.publish_progress(2, 7, 0.7);
        let progress = buffer.progress().unwrap();
        assert_eq!(progress.batches_released, 2);
        assert_eq!(progress.frames_processed, 7);
        assert!((progress.progress - 0.7).abs() < f64::EPSILON);
        assert!(!progress.failed);

        reader.mark_failed();
        assert!(buffer.progress().unwrap().failed);
    }

    #[test]
    fn test_typed_view_rejects_wrong_width() {
        let (_dir, buffer, reader) = setup(2);
        buffer
            .add_frame(&Frame::filled(FrameShape::new(2, 2), PixelType::U16, 1.0))
            .unwrap();
        let ticket = buffer.toggle().unwrap();
        let view = reader.batch(ticket.region, ticket.valid_depth).unwrap();
        assert!(view.frame_as::<u32>(0).is_none());
        assert!(view.frame_as::<u8>(0).is_none());
        let stats = view.stats().unwrap();
        assert_eq!(stats.max, 1.0);
    }
}
