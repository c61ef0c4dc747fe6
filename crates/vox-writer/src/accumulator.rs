//! Per-frame to per-batch bridge.
//!
//! The accumulator forwards frames into the shared buffer and decides when a
//! region is complete. Before every swap it blocks on a [`SwapGate`] until the
//! consumer has released every previously dispatched batch, which bounds the
//! producer's lead to one region.

use tracing::trace;

use vox_buffer::{SharedDoubleBuffer, SwapTicket};
use vox_core::{Frame, VoxError};

/// Producer-side wait for consumer release.
pub trait SwapGate {
    /// Block until the consumer has released at least `dispatched` batches.
    fn wait_released(&self, dispatched: u64) -> Result<(), VoxError>;
}

/// Gate that never blocks. For tests and single-threaded tools that consume
/// each batch before adding the next frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl SwapGate for OpenGate {
    fn wait_released(&self, _dispatched: u64) -> Result<(), VoxError> {
        Ok(())
    }
}

/// Counts frames against the declared volume and triggers swaps.
#[derive(Debug, Clone)]
pub struct BatchAccumulator {
    frame_count: u64,
    batch_depth: usize,
    frames_accepted: u64,
    dispatched: u64,
}

impl BatchAccumulator {
    /// Accumulator for a volume of `frame_count` frames in batches of `batch_depth`.
    #[must_use]
    pub fn new(frame_count: u64, batch_depth: usize) -> Self {
        Self {
            frame_count,
            batch_depth,
            frames_accepted: 0,
            dispatched: 0,
        }
    }

    /// Add one frame. Returns a ticket when the frame completed a batch.
    ///
    /// A batch completes when the region is full or the frame is the last
    /// one of the volume.
    ///
    /// # Errors
    /// `FrameOverflow` past the declared frame count, any buffer error from
    /// [`SharedDoubleBuffer::add_frame`], or the gate's error.
    pub fn add_frame(
        &mut self,
        buffer: &SharedDoubleBuffer,
        gate: &dyn SwapGate,
        frame: &Frame,
    ) -> Result<Option<SwapTicket>, VoxError> {
        if self.frames_accepted >= self.frame_count {
            return Err(VoxError::FrameOverflow {
                frame_count: self.frame_count,
            });
        }

        let slot = buffer.add_frame(frame)?;
        self.frames_accepted += 1;
        trace!(slot, accepted = self.frames_accepted, "Frame accepted");

        if slot + 1 >= self.batch_depth || self.frames_accepted == self.frame_count {
            return self.swap(buffer, gate).map(Some);
        }
        Ok(None)
    }

    /// Swap out a partially filled region. `None` when the region is empty.
    pub fn flush(
        &mut self,
        buffer: &SharedDoubleBuffer,
        gate: &dyn SwapGate,
    ) -> Result<Option<SwapTicket>, VoxError> {
        if buffer.fill() == 0 {
            return Ok(None);
        }
        self.swap(buffer, gate).map(Some)
    }

    fn swap(
        &mut self,
        buffer: &SharedDoubleBuffer,
        gate: &dyn SwapGate,
    ) -> Result<SwapTicket, VoxError> {
        gate.wait_released(self.dispatched)?;
        let ticket = buffer.toggle()?;
        self.dispatched += 1;
        Ok(ticket)
    }

    /// Whether every declared frame has been accepted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.frames_accepted == self.frame_count
    }

    /// Frames accepted so far.
    #[must_use]
    pub fn frames_accepted(&self) -> u64 {
        self.frames_accepted
    }

    /// Batches handed to the consumer so far.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Declared frames in the volume.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use vox_core::{FrameShape, PixelType};

    const SHAPE: FrameShape = FrameShape::new(2, 2);

    fn buffer(depth: usize, dir: &tempfile::TempDir) -> SharedDoubleBuffer {
        SharedDoubleBuffer::allocate(SHAPE, depth, PixelType::U8, Some(dir.path())).unwrap()
    }

    fn frame() -> Frame {
        Frame::filled(SHAPE, PixelType::U8, 3.0)
    }

    fn run(frame_count: u64, depth: usize) -> Vec<usize> {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer(depth, &dir);
        let mut acc = BatchAccumulator::new(frame_count, depth);
        let mut depths = Vec::new();
        for _ in 0..frame_count {
            if let Some(ticket) = acc.add_frame(&buffer, &OpenGate, &frame()).unwrap() {
                assert_eq!(ticket.swap_index, depths.len() as u64);
                depths.push(ticket.valid_depth);
            }
        }
        assert!(acc.is_complete());
        depths
    }

    #[test]
    fn test_short_final_batch() {
        assert_eq!(run(100, 64), vec![64, 36]);
        assert_eq!(run(9, 4), vec![4, 4, 1]);
        assert_eq!(run(8, 4), vec![4, 4]);
        assert_eq!(run(3, 64), vec![3]);
    }

    #[test]
    fn test_overflow_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer(4, &dir);
        let mut acc = BatchAccumulator::new(2, 4);
        acc.add_frame(&buffer, &OpenGate, &frame()).unwrap();
        acc.add_frame(&buffer, &OpenGate, &frame()).unwrap();
        assert!(matches!(
            acc.add_frame(&buffer, &OpenGate, &frame()),
            Err(VoxError::FrameOverflow { frame_count: 2 })
        ));
    }

    #[test]
    fn test_flush_partial_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer(4, &dir);
        let mut acc = BatchAccumulator::new(10, 4);
        assert!(acc.flush(&buffer, &OpenGate).unwrap().is_none());

        acc.add_frame(&buffer, &OpenGate, &frame()).unwrap();
        acc.add_frame(&buffer, &OpenGate, &frame()).unwrap();
        let ticket = acc.flush(&buffer, &OpenGate).unwrap().unwrap();
        assert_eq!(ticket.valid_depth, 2);
        assert_eq!(acc.dispatched(), 1);
        assert!(acc.flush(&buffer, &OpenGate).unwrap().is_none());
    }

    struct RecordingGate {
        waits: RefCell<Vec<u64>>,
    }

    impl SwapGate for RecordingGate {
        fn wait_released(&self, dispatched: u64) -> Result<(), VoxError> {
            self.waits.borrow_mut().push(dispatched);
            Ok(())
        }
    }

    #[test]
    fn test_gate_consulted_before_every_swap() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer(2, &dir);
        let gate = RecordingGate {
            waits: RefCell::new(Vec::new()),
        };
        let mut acc = BatchAccumulator::new(5, 2);
        for _ in 0..5 {
            acc.add_frame(&buffer, &gate, &frame()).unwrap();
        }
        assert_eq!(*gate.waits.borrow(), vec![0, 1, 2]);
    }

    struct ClosedGate;

    impl SwapGate for ClosedGate {
        fn wait_released(&self, _dispatched: u64) -> Result<(), VoxError> {
            Err(VoxError::Cancelled)
        }
    }

    #[test]
    fn test_gate_error_prevents_swap() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer(1, &dir);
        let mut acc = BatchAccumulator::new(5, 1);
        assert!(matches!(
            acc.add_frame(&buffer, &ClosedGate, &frame()),
            Err(VoxError::Cancelled)
        ));
        assert_eq!(buffer.swaps(), 0);
        assert_eq!(acc.dispatched(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_batches_partition_the_volume(frame_count in 1u64..300, depth in 1usize..70) {
            let depths = run(frame_count, depth);
            let expected_batches = frame_count.div_ceil(depth as u64) as usize;
            prop_assert_eq!(depths.len(), expected_batches);
            prop_assert_eq!(depths.iter().sum::<usize>() as u64, frame_count);
            for d in &depths[..depths.len() - 1] {
                prop_assert_eq!(*d, depth);
            }
            let last = depths[depths.len() - 1];
            prop_assert!(last >= 1 && last <= depth);
        }
    }
}
