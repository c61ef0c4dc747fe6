//! Plain-text diagnostic backend: one line of statistics per frame.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

use vox_buffer::BatchView;
use vox_core::WriterMetadata;

use super::{ensure_dir, output_path, remove_existing, BackendEncoder, BackendError};

/// Writes `<file_name>.txt`.
///
/// ```text
/// # vox text stack
/// # name: tile_0
/// # shape: 2048x2048 uint16
/// # frames: 100
/// # index min max mean
/// 0 100 4095 1022.5
/// ...
/// # written: 100
/// ```
#[derive(Debug)]
pub struct TextEncoder {
    output_dir: PathBuf,
    file: Option<BufWriter<File>>,
    frames_written: u64,
}

impl TextEncoder {
    /// Create an encoder writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            file: None,
            frames_written: 0,
        }
    }

    fn file(&mut self) -> Result<&mut BufWriter<File>, BackendError> {
        self.file
            .as_mut()
            .ok_or_else(|| BackendError::new("text stack is not open"))
    }
}

impl BackendEncoder for TextEncoder {
    fn name(&self) -> &str {
        "text"
    }

    fn prepare(&mut self, metadata: &WriterMetadata) -> Result<(), BackendError> {
        ensure_dir(&self.output_dir)?;
        let path = output_path(&self.output_dir, &metadata.file_name, "txt");
        remove_existing(&path)?;

        let file = File::create(&path).map_err(|e| {
            BackendError::with_source(format!("cannot create {}", path.display()), e)
        })?;
        let mut file = BufWriter::new(file);
        writeln!(file, "# vox text stack")?;
        writeln!(file, "# name: {}", metadata.file_name)?;
        writeln!(file, "# channel: {}", metadata.channel)?;
        writeln!(
            file,
            "# shape: {} {}",
            metadata.frame_shape, metadata.pixel_type
        )?;
        writeln!(file, "# frames: {}", metadata.frame_count)?;
        writeln!(file, "# position: {}", metadata.position)?;
        writeln!(file, "# voxel_size: {}", metadata.voxel_size)?;
        writeln!(file, "# index min max mean")?;

        info!(path = %path.display(), "Text stack opened");
        self.file = Some(file);
        self.frames_written = 0;
        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &BatchView<'_>,
        _batch_index: u64,
        valid_depth: usize,
    ) -> Result<(), BackendError> {
        let first = self.frames_written;
        let file = self.file()?;
        for i in 0..valid_depth {
            let stats = batch
                .frame_stats(i)
                .ok_or_else(|| BackendError::new(format!("frame {} missing from batch", i)))?;
            writeln!(
                file,
                "{} {} {} {:.3}",
                first + i as u64,
                stats.min,
                stats.max,
                stats.mean
            )?;
        }
        self.frames_written += valid_depth as u64;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        let frames = self.frames_written;
        let mut file = self
            .file
            .take()
            .ok_or_else(|| BackendError::new("text stack is not open"))?;
        writeln!(file, "# written: {}", frames)?;
        file.flush()?;
        info!(frames, "Text stack finalized");
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), BackendError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
