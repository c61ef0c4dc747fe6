//! Backend encoders: the consumer end of the pipeline.
//!
//! A [`BackendEncoder`] receives one [`BatchView`] per swap, in strictly
//! ascending batch order, and persists it however it likes. The worker loop
//! drives the lifecycle:
//!
//! ```text
//! prepare(metadata) -> process_batch(batch, index, valid_depth)* -> finalize() -> cleanup()
//! ```
//!
//! `cleanup` runs on every teardown path, including after a failure or an
//! abort. Its errors are logged and never escalated.
//!
//! # Available backends
//!
//! | Backend | Output | Feature |
//! |---|---|---|
//! | [`SimpleEncoder`] | none, validates the indexed fill pattern | - |
//! | [`SimulatedEncoder`] | none, artificial write delay | - |
//! | [`RawEncoder`] | `<name>.raw` + `<name>.json` sidecar | - |
//! | [`TextEncoder`] | `<name>.txt` per-frame statistics | - |
//! | `TiffEncoder` | `<name>.tiff` multi-page BigTIFF | `storage_tiff` |
//! | [`MemoryEncoder`] | in-process [`MemoryRecord`] | - |

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use vox_buffer::BatchView;
use vox_core::{BackendConfig, VoxError, WriterMetadata};

pub mod memory;
pub mod raw;
pub mod simple;
pub mod simulated;
pub mod text;
#[cfg(feature = "storage_tiff")]
pub mod tiff_stack;

pub use memory::{MemoryEncoder, MemoryRecord, RecordedBatch};
pub use raw::{RawEncoder, RawSidecar, RawStack};
pub use simple::SimpleEncoder;
pub use simulated::SimulatedEncoder;
pub use text::TextEncoder;
#[cfg(feature = "storage_tiff")]
pub use tiff_stack::TiffEncoder;

/// Error raised by a backend hook.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl BackendError {
    /// Create an error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create an error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The message, with the underlying cause appended when present.
    #[must_use]
    pub fn detailed(&self) -> String {
        match &self.source {
            Some(source) => format!("{}: {}", self.message, source),
            None => self.message.clone(),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source("I/O error", err)
    }
}

impl From<VoxError> for BackendError {
    fn from(err: VoxError) -> Self {
        Self::with_source("pipeline error", err)
    }
}

/// Consumer-side encoder contract.
///
/// Implementations must not retain the batch view beyond `process_batch`; the
/// borrow makes that a compile error.
pub trait BackendEncoder: Send {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Open output resources for the volume.
    fn prepare(&mut self, metadata: &WriterMetadata) -> Result<(), BackendError>;

    /// Persist the first `valid_depth` frames of `batch`.
    fn process_batch(
        &mut self,
        batch: &BatchView<'_>,
        batch_index: u64,
        valid_depth: usize,
    ) -> Result<(), BackendError>;

    /// Complete the output once every batch has been processed.
    fn finalize(&mut self) -> Result<(), BackendError>;

    /// Release resources. Called on every teardown path.
    fn cleanup(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Build the encoder selected by `config`, writing into `output_dir`.
pub fn build_encoder(
    config: &BackendConfig,
    output_dir: &Path,
) -> Result<Box<dyn BackendEncoder>, BackendError> {
    debug!(backend = config.kind(), output_dir = %output_dir.display(), "Building backend encoder");
    match config {
        BackendConfig::Simple { strict } => Ok(Box::new(SimpleEncoder::new(*strict))),
        BackendConfig::Simulated { write_delay_ms } => Ok(Box::new(SimulatedEncoder::new(
            std::time::Duration::from_millis(*write_delay_ms),
        ))),
        BackendConfig::Raw => Ok(Box::new(RawEncoder::new(output_dir))),
        BackendConfig::Text => Ok(Box::new(TextEncoder::new(output_dir))),
        #[cfg(feature = "storage_tiff")]
        BackendConfig::Tiff { compression } => {
            Ok(Box::new(TiffEncoder::new(output_dir, *compression)))
        }
        #[cfg(not(feature = "storage_tiff"))]
        BackendConfig::Tiff { .. } => Err(BackendError::new(
            "tiff backend requires the storage_tiff feature",
        )),
    }
}

/// `<output_dir>/<file_name>.<extension>`
#[must_use]
pub fn output_path(output_dir: &Path, file_name: &str, extension: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", file_name, extension))
}

/// Remove a stale output file so a rerun never appends to old data.
pub fn remove_existing(path: &Path) -> Result<(), BackendError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed existing output file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackendError::with_source(
            format!("cannot remove existing {}", path.display()),
            e,
        )),
    }
}

/// Create `output_dir` (and parents) if missing.
pub(crate) fn ensure_dir(output_dir: &Path) -> Result<(), BackendError> {
    std::fs::create_dir_all(output_dir).map_err(|e| {
        BackendError::with_source(format!("cannot create {}", output_dir.display()), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_detail() {
        let err = BackendError::with_source(
            "cannot open",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "cannot open");
        assert_eq!(err.detailed(), "cannot open: denied");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_build_encoder_names() {
        let dir = tempfile::tempdir().unwrap();
        for (config, name) in [
            (BackendConfig::Simple { strict: true }, "simple"),
            (BackendConfig::Simulated { write_delay_ms: 0 }, "simulated"),
            (BackendConfig::Raw, "raw"),
            (BackendConfig::Text, "text"),
        ] {
            let encoder = build_encoder(&config, dir.path()).unwrap();
            assert_eq!(encoder.name(), name);
        }
    }

    #[cfg(not(feature = "storage_tiff"))]
    #[test]
    fn test_tiff_requires_feature() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::Tiff {
            compression: vox_core::TiffCompression::None,
        };
        assert!(build_encoder(&config, dir.path()).is_err());
    }

    #[test]
    fn test_remove_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = output_path(dir.path(), "stack", "raw");
        assert!(remove_existing(&path).is_ok());
        std::fs::write(&path, b"old").unwrap();
        remove_existing(&path).unwrap();
        assert!(!path.exists());
    }
}
