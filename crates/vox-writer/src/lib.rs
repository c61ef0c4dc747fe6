//! Batching writer for vox-stream.
//!
//! This crate turns a stream of frames into batches in the shared double
//! buffer and hands each batch to a backend encoder running in a worker:
//!
//! - [`VolumeWriter`]: producer-side state machine (`configure`, `start`,
//!   `write`, `stop`, `wait_to_finish`)
//! - [`BatchAccumulator`]: frame counting and swap decisions with backpressure
//! - [`backend`]: the [`BackendEncoder`] trait and reference encoders
//! - [`worker`]: the worker loop, shared by thread and process modes
//! - [`protocol`]: JSON-line messages between writer and worker
//! - [`signals`]: progress, failure latching and cancellation
//!
//! # Example
//!
//! ```no_run
//! use vox_core::source::IndexedFrames;
//! use vox_core::{BackendConfig, FrameShape, PixelType, WriterConfig, WriterMetadata};
//! use vox_writer::{ThreadLauncher, VolumeWriter};
//!
//! # fn main() -> Result<(), vox_core::VoxError> {
//! let config = WriterConfig {
//!     backend: BackendConfig::Raw,
//!     ..WriterConfig::default()
//! };
//! let mut writer = VolumeWriter::with_launcher(config, ThreadLauncher::new());
//!
//! let shape = FrameShape::new(512, 512);
//! writer.configure(WriterMetadata::new(100, shape, "tile_0"))?;
//! writer.start()?;
//! writer.write(IndexedFrames::new(shape, PixelType::U16, 100))?;
//! writer.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod backend;
pub mod launcher;
pub mod process;
pub mod protocol;
pub mod signals;
pub mod worker;
pub mod writer;

pub use accumulator::{BatchAccumulator, OpenGate, SwapGate};
pub use backend::{build_encoder, BackendEncoder, BackendError, MemoryEncoder, MemoryRecord};
pub use launcher::{ThreadLauncher, WorkerLauncher, WorkerLink};
pub use process::{resolve_worker_program, ProcessLauncher};
pub use protocol::{BatchStats, WorkerCommand, WorkerEvent, WorkerSpec};
pub use signals::{PipelineSignals, ProgressMonitor, ProgressSnapshot, StopHandle};
pub use worker::{run_worker, WorkerExit};
pub use writer::VolumeWriter;
