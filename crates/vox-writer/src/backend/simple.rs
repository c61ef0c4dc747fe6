//! Pattern-checking backend.
//!
//! Expects frame *i* of the volume to be filled with the value *i*, as produced
//! by [`IndexedFrames`](vox_core::source::IndexedFrames). Nothing is written to
//! disk; per-batch statistics are logged.

use tracing::{info, warn};

use vox_buffer::BatchView;
use vox_core::source::indexed_value;
use vox_core::WriterMetadata;

use super::{BackendEncoder, BackendError};

/// Validates the indexed fill pattern and discards the data.
#[derive(Debug, Default)]
pub struct SimpleEncoder {
    strict: bool,
    frames_seen: u64,
    mismatches: u64,
}

impl SimpleEncoder {
    /// Create the encoder. In strict mode a pattern mismatch fails the batch.
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Self::default()
        }
    }

    /// Frames checked so far.
    #[must_use]
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Frames whose contents did not match the expected value.
    #[must_use]
    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }
}

impl BackendEncoder for SimpleEncoder {
    fn name(&self) -> &str {
        "simple"
    }

    fn prepare(&mut self, metadata: &WriterMetadata) -> Result<(), BackendError> {
        self.frames_seen = 0;
        self.mismatches = 0;
        info!(
            file = %metadata.file_name,
            frames = metadata.frame_count,
            shape = %metadata.frame_shape,
            strict = self.strict,
            "Simple backend ready"
        );
        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &BatchView<'_>,
        batch_index: u64,
        valid_depth: usize,
    ) -> Result<(), BackendError> {
        for i in 0..valid_depth {
            let frame_index = self.frames_seen;
            let expected = indexed_value(batch.pixel_type(), frame_index);
            let stats = batch
                .frame_stats(i)
                .ok_or_else(|| BackendError::new(format!("frame {} missing from batch", i)))?;

            if stats.min != expected || stats.max != expected {
                self.mismatches += 1;
                warn!(
                    batch = batch_index,
                    frame = frame_index,
                    expected,
                    min = stats.min,
                    max = stats.max,
                    "Frame does not match indexed pattern"
                );
                if self.strict {
                    return Err(BackendError::new(format!(
                        "frame {} expected value {}, found range [{}, {}]",
                        frame_index, expected, stats.min, stats.max
                    )));
                }
            }
            self.frames_seen += 1;
        }

        if let Some(stats) = batch.stats() {
            info!(
                batch = batch_index,
                valid_depth,
                min = stats.min,
                mean = stats.mean,
                max = stats.max,
                "Batch checked"
            );
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        info!(
            frames = self.frames_seen,
            mismatches = self.mismatches,
            "Simple backend finalized"
        );
        Ok(())
    }
}
