//! Multi-page BigTIFF backend.
//!
//! Each frame becomes one grayscale page of `<file_name>.tiff`. The volume
//! descriptor is stored as JSON in the first page's ImageDescription tag.
//! Compression is delegated to the `tiff` crate.

use std::fs::File;
use std::path::PathBuf;
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::compression::{Compression, Deflate, Lzw, Uncompressed};
use tiff::encoder::{TiffEncoder as BigTiff, TiffKindBig, TiffValue};
use tiff::tags::Tag;
use tiff::TiffResult;
use tracing::{debug, info};

use vox_buffer::BatchView;
use vox_core::{PixelType, TiffCompression, WriterMetadata};

use super::{ensure_dir, output_path, remove_existing, BackendEncoder, BackendError};

type Writer = BigTiff<File, TiffKindBig>;

impl From<tiff::TiffError> for BackendError {
    fn from(err: tiff::TiffError) -> Self {
        BackendError::with_source("TIFF encoding failed", err)
    }
}

/// Writes `<file_name>.tiff`.
pub struct TiffEncoder {
    output_dir: PathBuf,
    compression: TiffCompression,
    encoder: Option<Writer>,
    path: Option<PathBuf>,
    description: Option<String>,
    pages: u64,
}

impl std::fmt::Debug for TiffEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiffEncoder")
            .field("output_dir", &self.output_dir)
            .field("compression", &self.compression)
            .field("path", &self.path)
            .field("pages", &self.pages)
            .finish()
    }
}

impl TiffEncoder {
    /// Create an encoder writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>, compression: TiffCompression) -> Self {
        Self {
            output_dir: output_dir.into(),
            compression,
            encoder: None,
            path: None,
            description: None,
            pages: 0,
        }
    }
}

fn write_page<C, D>(
    encoder: &mut Writer,
    width: u32,
    height: u32,
    compression: D,
    data: &[C::Inner],
    description: Option<&str>,
) -> TiffResult<()>
where
    C: ColorType,
    D: Compression,
    [C::Inner]: TiffValue,
{
    let mut image = encoder.new_image_with_compression::<C, D>(width, height, compression)?;
    if let Some(description) = description {
        image
            .encoder()
            .write_tag(Tag::ImageDescription, description)?;
    }
    image.write_data(data)
}

fn write_compressed<C>(
    encoder: &mut Writer,
    compression: TiffCompression,
    width: u32,
    height: u32,
    data: &[C::Inner],
    description: Option<&str>,
) -> TiffResult<()>
where
    C: ColorType,
    [C::Inner]: TiffValue,
{
    match compression {
        TiffCompression::None => {
            write_page::<C, _>(encoder, width, height, Uncompressed::default(), data, description)
        }
        TiffCompression::Lzw => {
            write_page::<C, _>(encoder, width, height, Lzw::default(), data, description)
        }
        TiffCompression::Deflate => {
            write_page::<C, _>(encoder, width, height, Deflate::default(), data, description)
        }
    }
}

impl BackendEncoder for TiffEncoder {
    fn name(&self) -> &str {
        "tiff"
    }

    fn prepare(&mut self, metadata: &WriterMetadata) -> Result<(), BackendError> {
        ensure_dir(&self.output_dir)?;
        let path = output_path(&self.output_dir, &metadata.file_name, "tiff");
        remove_existing(&path)?;

        let file = File::create(&path).map_err(|e| {
            BackendError::with_source(format!("cannot create {}", path.display()), e)
        })?;
        self.encoder = Some(BigTiff::new_big(file)?);
        self.description = Some(metadata.descriptor().to_string());
        info!(
            path = %path.display(),
            compression = ?self.compression,
            pages = metadata.frame_count,
            "TIFF stack opened"
        );
        self.path = Some(path);
        self.pages = 0;
        Ok(())
    }

    fn process_batch(
        &mut self,
        batch: &BatchView<'_>,
        batch_index: u64,
        valid_depth: usize,
    ) -> Result<(), BackendError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| BackendError::new("TIFF stack is not open"))?;
        let shape = batch.shape();
        let missing = |i: usize| BackendError::new(format!("frame {} missing from batch", i));

        for i in 0..valid_depth {
            // Only the first page carries the descriptor
            let description = if self.pages == 0 {
                self.description.as_deref()
            } else {
                None
            };
            let (w, h, c) = (shape.width, shape.height, self.compression);
            match batch.pixel_type() {
                PixelType::U8 => {
                    let data = batch.frame_as::<u8>(i).ok_or_else(|| missing(i))?;
                    write_compressed::<colortype::Gray8>(encoder, c, w, h, data, description)?;
                }
                PixelType::U16 => {
                    let data = batch.frame_as::<u16>(i).ok_or_else(|| missing(i))?;
                    write_compressed::<colortype::Gray16>(encoder, c, w, h, data, description)?;
                }
                PixelType::U32 => {
                    let data = batch.frame_as::<u32>(i).ok_or_else(|| missing(i))?;
                    write_compressed::<colortype::Gray32>(encoder, c, w, h, data, description)?;
                }
                PixelType::F32 => {
                    let data = batch.frame_as::<f32>(i).ok_or_else(|| missing(i))?;
                    write_compressed::<colortype::Gray32Float>(encoder, c, w, h, data, description)?;
                }
            }
            self.pages += 1;
        }
        debug!(batch = batch_index, valid_depth, pages = self.pages, "TIFF pages written");
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| BackendError::new("TIFF stack is not open"))?;
        drop(encoder);
        if let Some(path) = &self.path {
            File::open(path)?.sync_all()?;
            info!(path = %path.display(), pages = self.pages, "TIFF stack finalized");
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), BackendError> {
        self.encoder = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use tiff::decoder::{Decoder, DecodingResult};
    use vox_buffer::{BufferReader, SharedDoubleBuffer};
    use vox_core::{Frame, FrameShape};

    fn write_stack(compression: TiffCompression) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let shape = FrameShape::new(6, 4);
        let meta = WriterMetadata::new(3, shape, "stack").with_channel("488");
        let buffer =
            SharedDoubleBuffer::allocate(shape, 4, PixelType::U16, Some(dir.path())).unwrap();
        let reader = BufferReader::open(buffer.handle()).unwrap();

        for v in 0..3 {
            buffer
                .add_frame(&Frame::filled(shape, PixelType::U16, f64::from(v * 100)))
                .unwrap();
        }
        let ticket = buffer.toggle().unwrap();

        let mut encoder = TiffEncoder::new(dir.path(), compression);
        encoder.prepare(&meta).unwrap();
        {
            let view = reader.batch(ticket.region, ticket.valid_depth).unwrap();
            encoder.process_batch(&view, 0, ticket.valid_depth).unwrap();
        }
        encoder.finalize().unwrap();
        encoder.cleanup().unwrap();
        let path = dir.path().join("stack.tiff");
        (dir, path)
    }

    fn read_pages(path: &std::path::Path) -> (Vec<Vec<u16>>, String) {
        let file = File::open(path).unwrap();
        let mut decoder = Decoder::new(BufReader::new(file)).unwrap();
        let description = decoder.get_tag_ascii_string(Tag::ImageDescription).unwrap();
        let mut pages = Vec::new();
        loop {
            assert_eq!(decoder.dimensions().unwrap(), (6, 4));
            match decoder.read_image().unwrap() {
                DecodingResult::U16(data) => pages.push(data),
                other => panic!("unexpected sample type: {:?}", std::mem::discriminant(&other)),
            }
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().unwrap();
        }
        (pages, description)
    }

    #[test]
    fn test_uncompressed_pages_round_trip() {
        let (_dir, path) = write_stack(TiffCompression::None);
        let (pages, description) = read_pages(&path);
        assert_eq!(pages.len(), 3);
        for (i, page) in pages.iter().enumerate() {
            assert!(page.iter().all(|&p| p == (i as u16) * 100));
        }
        let descriptor: serde_json::Value = serde_json::from_str(&description).unwrap();
        assert_eq!(descriptor["channel"], "488");
        assert_eq!(descriptor["size"]["z"], 3);
    }

    #[test]
    fn test_lzw_and_deflate_round_trip() {
        for compression in [TiffCompression::Lzw, TiffCompression::Deflate] {
            let (_dir, path) = write_stack(compression);
            let (pages, _) = read_pages(&path);
            assert_eq!(pages.len(), 3);
            assert!(pages[2].iter().all(|&p| p == 200));
        }
    }
}
