//! Throughput-testing backend that discards its input.

use std::time::Duration;
use tracing::{debug, info};

use vox_buffer::BatchView;
use vox_core::WriterMetadata;

use super::{BackendEncoder, BackendError};

/// Sleeps `write_delay` per batch, then drops the data.
#[derive(Debug, Default)]
pub struct SimulatedEncoder {
    write_delay: Duration,
    frames: u64,
    bytes: u64,
}

impl SimulatedEncoder {
    /// Create the encoder with a per-batch delay.
    #[must_use]
    pub fn new(write_delay: Duration) -> Self {
        Self {
            write_delay,
            ..Self::default()
        }
    }

    /// Frames consumed so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl BackendEncoder for SimulatedEncoder {
    fn name(&self) -> &str {
        "simulated"
    }

    fn prepare(&mut self, metadata: &WriterMetadata) -> Result<(), BackendError> {
        self.frames = 0;
        self.bytes = 0;
        debug!(file = %metadata.file_name, delay_ms = self.write_delay.as_millis() as u64, "Simulated backend ready");
        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &BatchView<'_>,
        _batch_index: u64,
        valid_depth: usize,
    ) -> Result<(), BackendError> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        self.frames += valid_depth as u64;
        self.bytes += batch.as_bytes().len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        info!(frames = self.frames, bytes = self.bytes, "Simulated backend finalized");
        Ok(())
    }
}
