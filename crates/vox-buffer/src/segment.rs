#![allow(unsafe_code)]
//! Memory-mapped segment backing the double buffer.
//!
//! # Layout
//!
//! ```text
//! [ 128-byte header | pad to page | region 0 | pad to page | region 1 | pad ]
//! ```
//!
//! The header is `#[repr(C)]` and every field that changes after creation is an
//! atomic, so the producer process and the worker process can both observe
//! region roles, the fill counter and the progress mirror through their own
//! mappings of the same file.
//!
//! # Safety model
//!
//! A [`Segment`] hands out raw region memory. Exclusive access is a protocol
//! property: the producer writes only the region named by `write_region`, the
//! consumer reads only the region named by `read_region`, and roles change only
//! in `toggle`, after the consumer has released the region it was reading.

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use vox_core::{PixelType, VoxError};

use crate::handle::{BufferHandle, BufferShape};

/// Magic number for segment header validation
pub(crate) const MAGIC: u64 = 0x564F_5844_4255_4631; // "VOXDBUF1"

/// Header layout version
pub(crate) const LAYOUT_VERSION: u32 = 1;

/// Size of the segment header in bytes (2 cache lines)
pub(crate) const HEADER_SIZE: usize = 128;

/// Region alignment within the segment.
const PAGE_SIZE: usize = 4096;

/// Segment header.
///
/// Layout (128 bytes total):
/// - magic: u64, version: u32, pixel_code: u32
/// - depth: u32, rows: u32, cols: u32, _reserved: u32
/// - region_stride: u64
/// - write_region: AtomicU32, read_region: AtomicU32
/// - fill, read_valid_depth, swaps: AtomicU64
/// - batches_released, frames_processed, progress_bits: AtomicU64
/// - failed: AtomicU32, _reserved2: u32
/// - _padding: [u8; 24]
#[repr(C)]
pub(crate) struct SegmentHeader {
    magic: u64,
    version: u32,
    pixel_code: u32,
    depth: u32,
    rows: u32,
    cols: u32,
    _reserved: u32,
    region_stride: u64,

    /// Region the producer appends to
    pub(crate) write_region: AtomicU32,
    /// Region the consumer may read
    pub(crate) read_region: AtomicU32,
    /// Frames written to the write region since the last swap
    pub(crate) fill: AtomicU64,
    /// Frames the read region holds
    pub(crate) read_valid_depth: AtomicU64,
    /// Completed swaps
    pub(crate) swaps: AtomicU64,

    /// Batches the consumer has fully processed
    pub(crate) batches_released: AtomicU64,
    /// Frames the consumer has fully processed
    pub(crate) frames_processed: AtomicU64,
    /// Progress fraction as `f64` bits
    pub(crate) progress_bits: AtomicU64,
    /// Non-zero once the consumer has failed
    pub(crate) failed: AtomicU32,
    _reserved2: u32,

    _padding: [u8; 24],
}

const _: () = assert!(
    std::mem::size_of::<SegmentHeader>() == HEADER_SIZE,
    "SegmentHeader size must equal HEADER_SIZE (128 bytes)"
);

/// Progress mirrored in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SegmentProgress {
    /// Batches the consumer has released
    pub batches_released: u64,
    /// Frames the consumer has processed
    pub frames_processed: u64,
    /// Fraction complete in `[0, 1]`
    pub progress: f64,
    /// Whether the consumer reported a failure
    pub failed: bool,
}

impl SegmentHeader {
    pub(crate) fn progress(&self) -> SegmentProgress {
        SegmentProgress {
            batches_released: self.batches_released.load(Ordering::Acquire),
            frames_processed: self.frames_processed.load(Ordering::Acquire),
            progress: f64::from_bits(self.progress_bits.load(Ordering::Acquire)),
            failed: self.failed.load(Ordering::Acquire) != 0,
        }
    }
}

fn round_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v / align * align)
}

/// Byte layout derived from a buffer shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentLayout {
    pub(crate) frame_bytes: usize,
    pub(crate) region_bytes: usize,
    pub(crate) region_offset: usize,
    pub(crate) region_stride: usize,
    pub(crate) total_bytes: usize,
}

impl SegmentLayout {
    pub(crate) fn compute(shape: BufferShape, pixel_type: PixelType) -> Result<Self, VoxError> {
        if shape.depth == 0 || shape.height == 0 || shape.width == 0 {
            return Err(VoxError::Allocation(format!(
                "buffer shape must be positive, got {}",
                shape
            )));
        }
        if u32::try_from(shape.depth).is_err() {
            return Err(VoxError::Allocation(format!(
                "buffer depth {} too large",
                shape.depth
            )));
        }
        let overflow = || VoxError::Allocation(format!("buffer size overflow for {}", shape));

        let frame_bytes = (shape.width as usize)
            .checked_mul(shape.height as usize)
            .and_then(|p| p.checked_mul(pixel_type.element_size()))
            .ok_or_else(overflow)?;
        let region_bytes = frame_bytes.checked_mul(shape.depth).ok_or_else(overflow)?;
        let region_offset = round_up(HEADER_SIZE, PAGE_SIZE).ok_or_else(overflow)?;
        let region_stride = round_up(region_bytes, PAGE_SIZE).ok_or_else(overflow)?;
        let total_bytes = region_stride
            .checked_mul(2)
            .and_then(|r| r.checked_add(region_offset))
            .ok_or_else(overflow)?;

        Ok(Self {
            frame_bytes,
            region_bytes,
            region_offset,
            region_stride,
            total_bytes,
        })
    }
}

/// Directory used for segment files when none is configured.
///
/// `/dev/shm` keeps the segment in RAM on Linux; elsewhere the temp dir is used.
#[must_use]
pub fn default_segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// A mapped segment: header plus two regions.
pub(crate) struct Segment {
    path: PathBuf,

    /// Memory-mapped file backing the segment
    #[expect(
        dead_code,
        reason = "mmap must be kept alive to maintain memory mapping validity"
    )]
    mmap: MmapMut,

    /// SAFETY: Points to the start of mmap, valid as long as mmap exists
    header: *mut SegmentHeader,

    /// SAFETY: Both point into mmap at region_offset + i * region_stride
    regions: [*mut u8; 2],

    layout: SegmentLayout,
    shape: BufferShape,
    pixel_type: PixelType,
}

// SAFETY: Segment owns its mmap; the raw pointers never outlive it. Mutable header
// state is atomic, and region memory is accessed under the role protocol above.
unsafe impl Send for Segment {}

// SAFETY: See Send. Shared access only reads atomics or region memory whose
// exclusive owner is decided by the header roles.
unsafe impl Sync for Segment {}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .field("pixel_type", &self.pixel_type)
            .field("region_bytes", &self.layout.region_bytes)
            .finish()
    }
}

impl Segment {
    /// Create a fresh segment file at `path` and initialize its header.
    pub(crate) fn create(
        path: &Path,
        shape: BufferShape,
        pixel_type: PixelType,
    ) -> Result<Self, VoxError> {
        let layout = SegmentLayout::compute(shape, pixel_type)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                VoxError::Allocation(format!("cannot create segment {}: {}", path.display(), e))
            })?;
        file.set_len(layout.total_bytes as u64).map_err(|e| {
            let _ = std::fs::remove_file(path);
            VoxError::Allocation(format!(
                "cannot reserve {} bytes for segment {}: {}",
                layout.total_bytes,
                path.display(),
                e
            ))
        })?;

        // SAFETY: We just created the file exclusively and set its size
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| {
            let _ = std::fs::remove_file(path);
            VoxError::Allocation(format!("cannot map segment {}: {}", path.display(), e))
        })?;
        debug_assert!(mmap.len() >= layout.total_bytes, "mmap shorter than requested size");

        let header = mmap.as_mut_ptr() as *mut SegmentHeader;
        // SAFETY: mmap is at least HEADER_SIZE bytes, page aligned, and nobody else
        // has mapped the file yet
        unsafe {
            header.write(SegmentHeader {
                magic: MAGIC,
                version: LAYOUT_VERSION,
                pixel_code: pixel_type.code(),
                depth: shape.depth as u32,
                rows: shape.height,
                cols: shape.width,
                _reserved: 0,
                region_stride: layout.region_stride as u64,
                write_region: AtomicU32::new(0),
                read_region: AtomicU32::new(1),
                fill: AtomicU64::new(0),
                read_valid_depth: AtomicU64::new(0),
                swaps: AtomicU64::new(0),
                batches_released: AtomicU64::new(0),
                frames_processed: AtomicU64::new(0),
                progress_bits: AtomicU64::new(0f64.to_bits()),
                failed: AtomicU32::new(0),
                _reserved2: 0,
                _padding: [0; 24],
            });
        }

        let regions = Self::region_pointers(&mut mmap, &layout);
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            header,
            regions,
            layout,
            shape,
            pixel_type,
        })
    }

    /// Map an existing segment and check it matches `handle`.
    pub(crate) fn open(handle: &BufferHandle) -> Result<Self, VoxError> {
        let path = &handle.path;
        let layout = SegmentLayout::compute(handle.shape, handle.pixel_type)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                VoxError::Allocation(format!("cannot open segment {}: {}", path.display(), e))
            })?;
        let len = file.metadata()?.len();
        if len < layout.total_bytes as u64 {
            return Err(VoxError::Allocation(format!(
                "segment {} is {} bytes, expected {}",
                path.display(),
                len,
                layout.total_bytes
            )));
        }

        // SAFETY: Opening a file created by Segment::create; size checked above
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| {
            VoxError::Allocation(format!("cannot map segment {}: {}", path.display(), e))
        })?;

        let header = mmap.as_mut_ptr() as *mut SegmentHeader;
        // SAFETY: mmap holds at least HEADER_SIZE bytes; the immutable fields were
        // written once by create before the handle was published
        let (magic, version, pixel_code, depth, rows, cols, stride) = unsafe {
            let h = &*header;
            (
                h.magic,
                h.version,
                h.pixel_code,
                h.depth,
                h.rows,
                h.cols,
                h.region_stride,
            )
        };

        if magic != MAGIC {
            return Err(VoxError::Allocation(format!(
                "invalid segment magic: expected 0x{:016X}, got 0x{:016X}",
                MAGIC, magic
            )));
        }
        if version != LAYOUT_VERSION {
            return Err(VoxError::Allocation(format!(
                "unsupported segment layout version {}",
                version
            )));
        }
        let header_shape = BufferShape {
            depth: depth as usize,
            height: rows,
            width: cols,
        };
        if header_shape != handle.shape
            || pixel_code != handle.pixel_type.code()
            || stride != layout.region_stride as u64
        {
            return Err(VoxError::Allocation(format!(
                "segment {} holds {} pixel code {}, handle expects {} {}",
                path.display(),
                header_shape,
                pixel_code,
                handle.shape,
                handle.pixel_type
            )));
        }

        let regions = Self::region_pointers(&mut mmap, &layout);
        Ok(Self {
            path: path.clone(),
            mmap,
            header,
            regions,
            layout,
            shape: handle.shape,
            pixel_type: handle.pixel_type,
        })
    }

    fn region_pointers(mmap: &mut MmapMut, layout: &SegmentLayout) -> [*mut u8; 2] {
        debug_assert!(layout.total_bytes <= mmap.len());
        let base = mmap.as_mut_ptr();
        // SAFETY: region_offset + 2 * region_stride == total_bytes <= mmap.len()
        unsafe {
            [
                base.add(layout.region_offset),
                base.add(layout.region_offset + layout.region_stride),
            ]
        }
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        // SAFETY: header points into mmap, which lives as long as self
        unsafe { &*self.header }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub(crate) fn shape(&self) -> BufferShape {
        self.shape
    }

    pub(crate) fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Copy one frame into `slot` of `region`.
    ///
    /// # Safety
    /// The caller must hold the producer's write lock and `region` must be the
    /// current write region, so no reader observes the bytes being copied.
    pub(crate) unsafe fn write_slot(&self, region: u32, slot: usize, bytes: &[u8]) {
        debug_assert!(region < 2);
        debug_assert!(slot < self.shape.depth);
        debug_assert_eq!(bytes.len(), self.layout.frame_bytes);
        let dest = self.regions[region as usize].add(slot * self.layout.frame_bytes);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len());
    }

    /// Borrow the first `frames` frames of `region`.
    ///
    /// # Safety
    /// `region` must be the current read region and must not be toggled back to
    /// the producer while the returned slice is alive.
    pub(crate) unsafe fn region_slice(&self, region: u32, frames: usize) -> &[u8] {
        debug_assert!(region < 2);
        debug_assert!(frames <= self.shape.depth);
        std::slice::from_raw_parts(
            self.regions[region as usize],
            frames * self.layout.frame_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::FrameShape;

    fn shape() -> BufferShape {
        BufferShape::new(4, FrameShape::new(8, 6))
    }

    #[test]
    fn test_layout_is_page_aligned() {
        let layout = SegmentLayout::compute(shape(), PixelType::U16).unwrap();
        assert_eq!(layout.frame_bytes, 8 * 6 * 2);
        assert_eq!(layout.region_bytes, 4 * 8 * 6 * 2);
        assert_eq!(layout.region_offset % PAGE_SIZE, 0);
        assert_eq!(layout.region_stride % PAGE_SIZE, 0);
        assert_eq!(layout.total_bytes, layout.region_offset + 2 * layout.region_stride);
    }

    #[test]
    fn test_layout_rejects_zero_and_overflow() {
        let zero = BufferShape::new(0, FrameShape::new(8, 6));
        assert!(matches!(
            SegmentLayout::compute(zero, PixelType::U8),
            Err(VoxError::Allocation(_))
        ));
        let huge = BufferShape {
            depth: u32::MAX as usize,
            height: u32::MAX,
            width: u32::MAX,
        };
        assert!(SegmentLayout::compute(huge, PixelType::F32).is_err());
    }

    #[test]
    fn test_create_initializes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let segment = Segment::create(&path, shape(), PixelType::U16).unwrap();
        let header = segment.header();
        assert_eq!(header.write_region.load(Ordering::Acquire), 0);
        assert_eq!(header.read_region.load(Ordering::Acquire), 1);
        assert_eq!(header.fill.load(Ordering::Acquire), 0);
        assert_eq!(header.progress(), SegmentProgress::default());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, b"occupied").unwrap();
        assert!(matches!(
            Segment::create(&path, shape(), PixelType::U16),
            Err(VoxError::Allocation(_))
        ));
    }

    #[test]
    fn test_open_validates_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let _segment = Segment::create(&path, shape(), PixelType::U16).unwrap();

        let good = BufferHandle {
            path: path.clone(),
            shape: shape(),
            pixel_type: PixelType::U16,
        };
        assert!(Segment::open(&good).is_ok());

        let wrong_type = BufferHandle {
            pixel_type: PixelType::U8,
            ..good.clone()
        };
        assert!(Segment::open(&wrong_type).is_err());

        let wrong_shape = BufferHandle {
            shape: BufferShape::new(2, FrameShape::new(8, 6)),
            ..good
        };
        assert!(Segment::open(&wrong_shape).is_err());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let layout = SegmentLayout::compute(shape(), PixelType::U16).unwrap();
        std::fs::write(&path, vec![0u8; layout.total_bytes]).unwrap();
        let handle = BufferHandle {
            path,
            shape: shape(),
            pixel_type: PixelType::U16,
        };
        assert!(Segment::open(&handle).is_err());
    }

    #[test]
    fn test_writes_visible_through_second_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let producer = Segment::create(&path, shape(), PixelType::U16).unwrap();
        let handle = BufferHandle {
            path,
            shape: shape(),
            pixel_type: PixelType::U16,
        };
        let consumer = Segment::open(&handle).unwrap();

        let bytes = vec![0xAB; producer.layout().frame_bytes];
        // SAFETY: single-threaded test, region 1 is not read concurrently
        unsafe { producer.write_slot(1, 2, &bytes) };
        producer.header().fill.store(3, Ordering::Release);

        assert_eq!(consumer.header().fill.load(Ordering::Acquire), 3);
        // SAFETY: single-threaded test
        let region = unsafe { consumer.region_slice(1, 3) };
        let frame_bytes = consumer.layout().frame_bytes;
        assert!(region[2 * frame_bytes..].iter().all(|&b| b == 0xAB));
        assert!(region[..frame_bytes].iter().all(|&b| b == 0));
    }
}
