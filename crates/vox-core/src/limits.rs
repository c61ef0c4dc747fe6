//! Shared hard limits and pipeline defaults.
//!
//! This module centralizes:
//! - Sizing limits for frames and batches
//! - Default timeouts for worker start-up, shutdown and polling
//!
//! Configuration defaults in [`crate::config`] are built from these constants.

use crate::data::PixelType;
use crate::error::VoxError;
use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default bound on how long `start` waits for the worker to report ready (10 seconds).
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on how long `stop` waits for finalize and worker exit (30 seconds).
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Slice length for condition-variable waits (50 ms).
///
/// Every blocking wait re-checks cancellation, latched failures and worker
/// liveness at least this often.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Size Limits
// =============================================================================

/// Default number of frames per batch.
pub const DEFAULT_BATCH_DEPTH: usize = 64;

/// Maximum frames per batch.
pub const MAX_BATCH_DEPTH: usize = 4096;

/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;

/// Maximum allowed frame payload in bytes (default: 256MB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Pixels per frame
    pub pixels: usize,
    /// Bytes per frame
    pub bytes: usize,
}

/// Validate frame dimensions and calculate pixel/byte sizes without overflow.
pub fn validate_frame_size(
    width: u32,
    height: u32,
    pixel_type: PixelType,
) -> Result<FrameSize, VoxError> {
    if width == 0 || height == 0 {
        return Err(VoxError::Allocation(format!(
            "frame dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(VoxError::Allocation(format!(
            "frame dimensions {}x{} exceed the maximum of {}",
            width, height, MAX_FRAME_DIMENSION
        )));
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| VoxError::Allocation("pixel count overflow".into()))?;
    let bytes = pixels
        .checked_mul(pixel_type.element_size())
        .ok_or_else(|| VoxError::Allocation("frame byte size overflow".into()))?;

    if bytes > MAX_FRAME_BYTES {
        return Err(VoxError::Allocation(format!(
            "frame of {} bytes exceeds the maximum of {} bytes",
            bytes, MAX_FRAME_BYTES
        )));
    }

    Ok(FrameSize { pixels, bytes })
}

/// Validate a batch depth against [`MAX_BATCH_DEPTH`].
pub fn validate_batch_depth(depth: usize) -> Result<(), VoxError> {
    if depth == 0 || depth > MAX_BATCH_DEPTH {
        return Err(VoxError::Allocation(format!(
            "batch depth {} outside 1..={}",
            depth, MAX_BATCH_DEPTH
        )));
    }
    Ok(())
}
