//! Raw stack backend.
//!
//! Writes every frame back to back into `<file_name>.raw` (row-major,
//! little-endian, z-major) and, on finalize, a `<file_name>.json` sidecar that
//! describes the stack. [`RawStack`] reads both back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use vox_buffer::BatchView;
use vox_core::{Frame, FrameShape, PixelType, WriterMetadata};

use super::{ensure_dir, output_path, remove_existing, BackendEncoder, BackendError};

/// Sidecar written next to a raw stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSidecar {
    /// Volume metadata as configured
    pub metadata: WriterMetadata,
    /// Frames actually written
    pub frames_written: u64,
    /// Bytes per frame
    pub frame_bytes: usize,
    /// Always `"little"`
    pub byte_order: String,
    /// When the stack was finalized
    pub finalized_at: DateTime<Utc>,
    /// Descriptor shared with other backends
    pub descriptor: serde_json::Value,
}

/// Writes `<file_name>.raw` plus a JSON sidecar.
#[derive(Debug)]
pub struct RawEncoder {
    output_dir: PathBuf,
    metadata: Option<WriterMetadata>,
    raw_path: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    frames_written: u64,
}

impl RawEncoder {
    /// Create an encoder writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            metadata: None,
            raw_path: None,
            file: None,
            frames_written: 0,
        }
    }

    /// Path of the raw data file, once prepared.
    #[must_use]
    pub fn raw_path(&self) -> Option<&Path> {
        self.raw_path.as_deref()
    }
}

impl BackendEncoder for RawEncoder {
    fn name(&self) -> &str {
        "raw"
    }

    fn prepare(&mut self, metadata: &WriterMetadata) -> Result<(), BackendError> {
        ensure_dir(&self.output_dir)?;
        let raw_path = output_path(&self.output_dir, &metadata.file_name, "raw");
        let sidecar_path = output_path(&self.output_dir, &metadata.file_name, "json");
        remove_existing(&raw_path)?;
        remove_existing(&sidecar_path)?;

        let file = File::create(&raw_path).map_err(|e| {
            BackendError::with_source(format!("cannot create {}", raw_path.display()), e)
        })?;
        info!(path = %raw_path.display(), frames = metadata.frame_count, "Raw stack opened");

        self.file = Some(BufWriter::with_capacity(1 << 20, file));
        self.raw_path = Some(raw_path);
        self.metadata = Some(metadata.clone());
        self.frames_written = 0;
        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &BatchView<'_>,
        batch_index: u64,
        valid_depth: usize,
    ) -> Result<(), BackendError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BackendError::new("raw stack is not open"))?;
        file.write_all(batch.as_bytes()).map_err(|e| {
            BackendError::with_source(format!("write of batch {} failed", batch_index), e)
        })?;
        self.frames_written += valid_depth as u64;
        debug!(batch = batch_index, valid_depth, frames = self.frames_written, "Raw batch written");
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| BackendError::new("raw stack is not open"))?;
        let file = file
            .into_inner()
            .map_err(|e| BackendError::with_source("flush failed", e.into_error()))?;
        file.sync_all()?;

        let metadata = self
            .metadata
            .clone()
            .ok_or_else(|| BackendError::new("raw stack was never prepared"))?;
        let sidecar = RawSidecar {
            frame_bytes: metadata.frame_bytes(),
            descriptor: metadata.descriptor(),
            frames_written: self.frames_written,
            byte_order: "little".to_string(),
            finalized_at: Utc::now(),
            metadata,
        };
        let sidecar_path = output_path(&self.output_dir, &sidecar.metadata.file_name, "json");
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| BackendError::with_source("cannot encode sidecar", e))?;
        std::fs::write(&sidecar_path, json).map_err(|e| {
            BackendError::with_source(format!("cannot write {}", sidecar_path.display()), e)
        })?;

        info!(
            path = %sidecar_path.display(),
            frames = self.frames_written,
            "Raw stack finalized"
        );
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), BackendError> {
        // An unfinalized stack is left on disk as a partial record
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// A raw stack read back from disk.
#[derive(Debug, Clone)]
pub struct RawStack {
    sidecar: RawSidecar,
    data: Vec<u8>,
}

impl RawStack {
    /// Read `<file_name>.raw` and its sidecar from `dir`.
    pub fn open(dir: &Path, file_name: &str) -> Result<Self, BackendError> {
        let sidecar_path = output_path(dir, file_name, "json");
        let raw_path = output_path(dir, file_name, "raw");

        let sidecar_bytes = std::fs::read(&sidecar_path).map_err(|e| {
            BackendError::with_source(format!("cannot read {}", sidecar_path.display()), e)
        })?;
        let sidecar: RawSidecar = serde_json::from_slice(&sidecar_bytes)
            .map_err(|e| BackendError::with_source("invalid sidecar", e))?;
        let data = std::fs::read(&raw_path).map_err(|e| {
            BackendError::with_source(format!("cannot read {}", raw_path.display()), e)
        })?;

        let expected = sidecar.frames_written as usize * sidecar.frame_bytes;
        if data.len() != expected {
            return Err(BackendError::new(format!(
                "raw stack holds {} bytes, sidecar describes {}",
                data.len(),
                expected
            )));
        }
        Ok(Self { sidecar, data })
    }

    /// Sidecar contents.
    #[must_use]
    pub fn sidecar(&self) -> &RawSidecar {
        &self.sidecar
    }

    /// Frames in the stack.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.sidecar.frames_written
    }

    /// Frame shape.
    #[must_use]
    pub fn shape(&self) -> FrameShape {
        self.sidecar.metadata.frame_shape
    }

    /// Pixel type.
    #[must_use]
    pub fn pixel_type(&self) -> PixelType {
        self.sidecar.metadata.pixel_type
    }

    /// Copy frame `index` out of the stack.
    #[must_use]
    pub fn frame(&self, index: u64) -> Option<Frame> {
        if index >= self.frame_count() {
            return None;
        }
        let size = self.sidecar.frame_bytes;
        let start = index as usize * size;
        let bytes = self.data.get(start..start + size)?;
        let shape = self.shape();
        Some(Frame::from_bytes(
            shape.width,
            shape.height,
            self.pixel_type(),
            bytes.to_vec(),
        ))
    }

    /// Iterate every frame in order.
    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        (0..self.frame_count()).filter_map(|i| self.frame(i))
    }
}
