//! Error types for the acquisition-to-disk pipeline.
//!
//! [`VoxError`] is the single error type returned by every public operation in the
//! workspace. It is built with `thiserror` and groups failures by where they surface:
//!
//! - **Configuration-time**: `InvalidMetadata`, `Allocation`, `AlreadyConfigured`,
//!   `InvalidState`, `Config`. Returned synchronously from `configure`/`allocate`;
//!   the writer never reaches `RUNNING` after one of these.
//! - **Producer-path faults**: `ShapeMismatch`, `PixelTypeMismatch`,
//!   `FrameSizeMismatch`, `BufferFull`, `FrameOverflow`. These indicate a misconfigured frame source and are fatal.
//! - **Reader-side role checks**: `RegionConflict`, `DepthOutOfRange`. Raised when a
//!   consumer asks for memory it does not own.
//! - **Worker-side faults**: `BackendInit`, `BackendWrite`, `BackendFinalize`,
//!   `WorkerLost`. Raised inside the worker, carried back as a [`Failure`] and
//!   surfaced on the producer's next interaction with the writer.
//!
//! Worker failures cross a process boundary, so they travel as the serializable
//! [`Failure`] record and are turned back into a [`VoxError`] by `From<Failure>`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::data::{FrameShape, PixelType};
use crate::state::WriterState;

/// Convenience alias for results using the pipeline error type.
pub type VoxResult<T> = std::result::Result<T, VoxError>;

/// Primary error type for the pipeline.
#[derive(Error, Debug)]
pub enum VoxError {
    /// The shared segment could not be sized or reserved on the host.
    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    /// A frame's 2-D shape differs from the configured frame shape.
    #[error("Frame shape {actual} does not match configured shape {expected}")]
    ShapeMismatch {
        /// Shape the buffer was allocated for.
        expected: FrameShape,
        /// Shape of the rejected frame.
        actual: FrameShape,
    },

    /// A frame's element type differs from the configured pixel type.
    #[error("Frame pixel type {actual} does not match configured pixel type {expected}")]
    PixelTypeMismatch {
        /// Pixel type the buffer was allocated for.
        expected: PixelType,
        /// Pixel type of the rejected frame.
        actual: PixelType,
    },

    /// A frame's byte length disagrees with its own shape and pixel type.
    #[error("Frame holds {actual} bytes, its shape and pixel type need {expected}")]
    FrameSizeMismatch {
        /// Bytes required by the frame's shape and pixel type.
        expected: usize,
        /// Bytes the frame actually carries.
        actual: usize,
    },

    /// The write region has no free depth slot left.
    #[error("Write region is full ({capacity} frames)")]
    BufferFull {
        /// Depth capacity of one region.
        capacity: usize,
    },

    /// A reader asked for a region it does not currently own.
    #[error("Region {region} is not the readable region (read region is {read_region})")]
    RegionConflict {
        /// Region requested by the reader.
        region: u32,
        /// Region currently marked readable.
        read_region: u32,
    },

    /// A reader asked for more frames than a region holds.
    #[error("Valid depth {valid_depth} exceeds region depth {depth}")]
    DepthOutOfRange {
        /// Requested valid depth.
        valid_depth: usize,
        /// Depth capacity of one region.
        depth: usize,
    },

    /// Writer metadata failed validation.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// `configure` was called on a writer that is not idle.
    #[error("Writer is already configured")]
    AlreadyConfigured,

    /// An operation was attempted from a state that does not allow it.
    #[error("Cannot {operation} while writer is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// State the writer was in.
        state: WriterState,
    },

    /// The frame source yielded more frames than the volume declares.
    #[error("Frame source produced more than the declared {frame_count} frames")]
    FrameOverflow {
        /// Declared frame count of the volume.
        frame_count: u64,
    },

    /// The backend's `prepare` hook failed.
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    /// The backend's `process_batch` hook failed.
    #[error("Backend failed to write batch {batch}: {message}")]
    BackendWrite {
        /// Index of the failed batch.
        batch: u64,
        /// Backend-provided description.
        message: String,
    },

    /// The backend's `finalize` hook failed.
    #[error("Backend finalize failed: {0}")]
    BackendFinalize(String),

    /// The worker exited or stopped responding without reporting a result.
    #[error("Worker lost: {0}")]
    WorkerLost(String),

    /// A fatal producer-side fault was latched earlier and the writer is unusable.
    #[error("Writer faulted: {0}")]
    Faulted(String),

    /// The operation was interrupted by a stop request.
    #[error("Operation cancelled")]
    Cancelled,

    /// A bounded wait expired.
    #[error("Timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        /// How long the caller waited.
        elapsed: Duration,
        /// What the caller was waiting for.
        waiting_for: &'static str,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O failure (segment files, pipes, output files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker protocol message could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl From<figment::Error> for VoxError {
    fn from(err: figment::Error) -> Self {
        VoxError::Config(err.to_string())
    }
}

impl VoxError {
    /// Whether this error poisons the writer (latches `ERROR`).
    ///
    /// Configuration-time and state errors leave the writer usable; everything
    /// raised while frames are flowing does not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VoxError::InvalidMetadata(_)
                | VoxError::AlreadyConfigured
                | VoxError::InvalidState { .. }
                | VoxError::Config(_)
        )
    }
}

/// Category of a latched failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// `prepare` failed.
    BackendInit,
    /// `process_batch` failed.
    BackendWrite,
    /// `finalize` failed.
    BackendFinalize,
    /// Worker process/thread died or broke protocol.
    WorkerLost,
    /// Producer-side fatal fault (shape mismatch, overflow, ...).
    Producer,
    /// The acquisition was cancelled by a stop request.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::BackendInit => "backend_init",
            FailureKind::BackendWrite => "backend_write",
            FailureKind::BackendFinalize => "backend_finalize",
            FailureKind::WorkerLost => "worker_lost",
            FailureKind::Producer => "producer",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// Serializable record of a terminal failure.
///
/// This is what the worker sends back across the process boundary and what the
/// writer latches once it enters `ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Batch index, when the failure belongs to one batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<u64>,
}

impl Failure {
    /// Create a failure without a batch index.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            batch: None,
        }
    }

    /// Create a failure attached to a batch.
    pub fn for_batch(kind: FailureKind, batch: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            batch: Some(batch),
        }
    }

    /// Latch a producer-side error.
    pub fn from_producer(err: &VoxError) -> Self {
        match err {
            VoxError::Cancelled => Self::new(FailureKind::Cancelled, "acquisition cancelled"),
            other => Self::new(FailureKind::Producer, other.to_string()),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.batch {
            Some(batch) => write!(f, "{} (batch {}): {}", self.kind, batch, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl From<Failure> for VoxError {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::BackendInit => VoxError::BackendInit(failure.message),
            FailureKind::BackendWrite => VoxError::BackendWrite {
                batch: failure.batch.unwrap_or_default(),
                message: failure.message,
            },
            FailureKind::BackendFinalize => VoxError::BackendFinalize(failure.message),
            FailureKind::WorkerLost => VoxError::WorkerLost(failure.message),
            FailureKind::Producer => VoxError::Faulted(failure.message),
            FailureKind::Cancelled => VoxError::Cancelled,
        }
    }
}
