//! `vox-core`
//!
//! Core types shared by every crate of the streaming acquisition-to-disk
//! pipeline.
//!
//! ## Key Types
//!
//! - [`Frame`], [`FrameShape`], [`PixelType`]: the unit of acquisition
//! - [`WriterMetadata`]: immutable description of one volume
//! - [`WriterState`]: explicit writer lifecycle state machine
//! - [`VoxError`] and [`Failure`]: error taxonomy and its serializable form
//!
//! ## Ambient modules
//!
//! - [`config`]: layered Figment configuration (`vox.toml` + `VOX_` environment)
//! - [`logging`]: `tracing-subscriber` initialization
//! - [`source`]: synthetic frame generators
//! - [`limits`]: sizing limits and default timeouts

pub mod config;
pub mod data;
pub mod error;
pub mod limits;
pub mod logging;
pub mod metadata;
pub mod source;
pub mod state;

pub use config::{BackendConfig, TiffCompression, VoxConfig, WorkerMode, WriterConfig};
pub use data::{Frame, FrameShape, PixelStats, PixelType};
pub use error::{Failure, FailureKind, VoxError, VoxResult};
pub use metadata::{Vec3, WriterMetadata};
pub use state::WriterState;
