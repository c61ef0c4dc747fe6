//! In-process recording backend for tests.
//!
//! [`MemoryEncoder`] copies every batch into a shared [`MemoryRecord`] that the
//! test keeps a clone of. It can also inject failures and delays, and run
//! an inspector against each live batch view.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use vox_buffer::BatchView;
use vox_core::WriterMetadata;

use super::{BackendEncoder, BackendError};

/// Hook run against every live batch view before it is recorded.
pub type BatchInspector = Box<dyn FnMut(&BatchView<'_>, u64) + Send>;

/// One recorded `process_batch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    /// Batch index as passed by the worker
    pub index: u64,
    /// Valid depth as passed by the worker
    pub valid_depth: usize,
    /// Copies of the valid frames
    pub frames: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct RecordInner {
    metadata: Option<WriterMetadata>,
    prepare_calls: u32,
    batches: Vec<RecordedBatch>,
    finalize_calls: u32,
    cleanup_calls: u32,
}

/// Shared view of what a [`MemoryEncoder`] received.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecord {
    inner: Arc<Mutex<RecordInner>>,
}

impl MemoryRecord {
    /// Metadata passed to `prepare`.
    #[must_use]
    pub fn metadata(&self) -> Option<WriterMetadata> {
        self.inner.lock().metadata.clone()
    }

    /// Number of `prepare` calls.
    #[must_use]
    pub fn prepare_calls(&self) -> u32 {
        self.inner.lock().prepare_calls
    }

    /// Every recorded batch, in call order.
    #[must_use]
    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.inner.lock().batches.clone()
    }

    /// `(index, valid_depth)` of every recorded batch.
    #[must_use]
    pub fn batch_shapes(&self) -> Vec<(u64, usize)> {
        self.inner
            .lock()
            .batches
            .iter()
            .map(|b| (b.index, b.valid_depth))
            .collect()
    }

    /// All recorded frames, flattened in order.
    #[must_use]
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .batches
            .iter()
            .flat_map(|b| b.frames.iter().cloned())
            .collect()
    }

    /// Number of `finalize` calls.
    #[must_use]
    pub fn finalize_calls(&self) -> u32 {
        self.inner.lock().finalize_calls
    }

    /// Number of `cleanup` calls.
    #[must_use]
    pub fn cleanup_calls(&self) -> u32 {
        self.inner.lock().cleanup_calls
    }
}

/// Records batches in memory.
pub struct MemoryEncoder {
    record: MemoryRecord,
    batch_delay: Duration,
    fail_prepare: Option<String>,
    fail_on_batch: Option<u64>,
    fail_finalize: bool,
    fail_cleanup: bool,
    inspector: Option<BatchInspector>,
}

impl std::fmt::Debug for MemoryEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEncoder")
            .field("batch_delay", &self.batch_delay)
            .field("fail_prepare", &self.fail_prepare)
            .field("fail_on_batch", &self.fail_on_batch)
            .field("fail_finalize", &self.fail_finalize)
            .field("has_inspector", &self.inspector.is_some())
            .finish()
    }
}

impl MemoryEncoder {
    /// Create an encoder and the record it writes to.
    #[must_use]
    pub fn new() -> (Self, MemoryRecord) {
        let record = MemoryRecord::default();
        let encoder = Self {
            record: record.clone(),
            batch_delay: Duration::ZERO,
            fail_prepare: None,
            fail_on_batch: None,
            fail_finalize: false,
            fail_cleanup: false,
            inspector: None,
        };
        (encoder, record)
    }

    /// Sleep this long inside every `process_batch`.
    #[must_use]
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Make `prepare` fail with `message`.
    #[must_use]
    pub fn fail_prepare(mut self, message: impl Into<String>) -> Self {
        self.fail_prepare = Some(message.into());
        self
    }

    /// Make `process_batch` fail for batch `index`.
    #[must_use]
    pub fn fail_on_batch(mut self, index: u64) -> Self {
        self.fail_on_batch = Some(index);
        self
    }

    /// Make `finalize` fail.
    #[must_use]
    pub fn fail_finalize(mut self) -> Self {
        self.fail_finalize = true;
        self
    }

    /// Make `cleanup` fail.
    #[must_use]
    pub fn fail_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    /// Run `inspector` against every live batch view.
    #[must_use]
    pub fn with_inspector(mut self, inspector: impl FnMut(&BatchView<'_>, u64) + Send + 'static) -> Self {
        self.inspector = Some(Box::new(inspector));
        self
    }
}

impl BackendEncoder for MemoryEncoder {
    fn name(&self) -> &str {
        "memory"
    }

    fn prepare(&mut self, metadata: &WriterMetadata) -> Result<(), BackendError> {
        let mut inner = self.record.inner.lock();
        inner.prepare_calls += 1;
        if let Some(message) = &self.fail_prepare {
            return Err(BackendError::new(message.clone()));
        }
        inner.metadata = Some(metadata.clone());
        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &BatchView<'_>,
        batch_index: u64,
        valid_depth: usize,
    ) -> Result<(), BackendError> {
        if let Some(inspector) = self.inspector.as_mut() {
            inspector(batch, batch_index);
        }
        if !self.batch_delay.is_zero() {
            std::thread::sleep(self.batch_delay);
        }
        if self.fail_on_batch == Some(batch_index) {
            return Err(BackendError::new(format!(
                "injected failure on batch {}",
                batch_index
            )));
        }

        let frames = (0..valid_depth)
            .map(|i| {
                batch
                    .frame(i)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| BackendError::new(format!("frame {} missing", i)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(batch = batch_index, valid_depth, "Recorded batch");

        self.record.inner.lock().batches.push(RecordedBatch {
            index: batch_index,
            valid_depth,
            frames,
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        self.record.inner.lock().finalize_calls += 1;
        if self.fail_finalize {
            return Err(BackendError::new("injected finalize failure"));
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), BackendError> {
        self.record.inner.lock().cleanup_calls += 1;
        if self.fail_cleanup {
            return Err(BackendError::new("injected cleanup failure"));
        }
        Ok(())
    }
}
