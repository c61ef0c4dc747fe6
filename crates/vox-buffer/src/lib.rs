//! `vox-buffer`
//!
//! Double buffer shared between a frame producer and a writer worker that may
//! live in another process.
//!
//! Both regions live in one memory-mapped segment file. The producer side,
//! [`SharedDoubleBuffer`], appends frames to the write region and swaps roles
//! with [`SharedDoubleBuffer::toggle`]. The consumer side, [`BufferReader`],
//! maps the same file from a serializable [`BufferHandle`] and borrows the read
//! region as a [`BatchView`].
//!
//! At most one region is writable at any instant. The reader refuses any region
//! that is not currently marked readable.

pub mod double_buffer;
pub mod handle;
pub mod reader;
pub mod segment;
pub mod view;

pub use double_buffer::{SharedDoubleBuffer, SwapTicket};
pub use handle::{BufferHandle, BufferShape};
pub use reader::BufferReader;
pub use segment::{default_segment_dir, SegmentProgress};
pub use view::BatchView;
