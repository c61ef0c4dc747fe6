//! Wire protocol between the writer and its worker.
//!
//! Messages are newline-delimited JSON. In process mode the writer sends a
//! [`WorkerSpec`] as the first stdin line, followed by [`WorkerCommand`]s, and
//! reads [`WorkerEvent`]s from the child's stdout. Thread mode uses the same
//! types over in-process channels.
//!
//! ```text
//! {"cmd":"batch","index":0,"region":0,"valid_depth":64}
//! {"event":"batch_done","index":0,"valid_depth":64,"frames_processed":64,"stats":{"elapsed_us":812,"bytes":536870912}}
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::PathBuf;

use vox_buffer::BufferHandle;
use vox_core::{BackendConfig, Failure, VoxError, WriterMetadata};

/// Everything a worker process needs to attach and build its backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Shared segment to attach
    pub handle: BufferHandle,
    /// Volume being written
    pub metadata: WriterMetadata,
    /// Backend selection
    pub backend: BackendConfig,
    /// Directory the backend writes into
    pub output_dir: PathBuf,
    /// Log level for the worker's stderr subscriber
    pub log_level: String,
}

/// Writer to worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Process the read region.
    Batch {
        /// Batch index, strictly ascending from zero
        index: u64,
        /// Region holding the batch
        region: u32,
        /// Leading frames that are valid
        valid_depth: usize,
    },
    /// Every batch has been dispatched; finalize the output.
    Finalize,
    /// Stop without finalizing.
    Abort,
}

/// Timing of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Time spent inside `process_batch`
    pub elapsed_us: u64,
    /// Bytes handed to the backend
    pub bytes: u64,
}

impl BatchStats {
    /// Write rate in MiB/s, or 0.0 when no time was measured.
    #[must_use]
    pub fn mb_per_s(&self) -> f64 {
        if self.elapsed_us == 0 {
            return 0.0;
        }
        (self.bytes as f64 / (1024.0 * 1024.0)) / (self.elapsed_us as f64 / 1_000_000.0)
    }
}

/// Worker to writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// `prepare` succeeded.
    Ready,
    /// A batch was processed and its region released.
    BatchDone {
        /// Batch index
        index: u64,
        /// Frames in the batch
        valid_depth: usize,
        /// Running total of frames processed
        frames_processed: u64,
        /// Timing
        stats: BatchStats,
    },
    /// A terminal failure. No further batches are processed.
    Failed(Failure),
    /// `finalize` succeeded.
    Finalized {
        /// Frames written to the output
        frames_processed: u64,
    },
    /// Last event of every worker, after `cleanup`.
    Exited,
}

/// Encode one message as a JSON line (without the trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, VoxError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one JSON line.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, VoxError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::FailureKind;

    #[test]
    fn test_command_wire_format() {
        let line = encode_line(&WorkerCommand::Batch {
            index: 2,
            region: 1,
            valid_depth: 36,
        })
        .unwrap();
        assert_eq!(line, r#"{"cmd":"batch","index":2,"region":1,"valid_depth":36}"#);
        assert_eq!(
            encode_line(&WorkerCommand::Finalize).unwrap(),
            r#"{"cmd":"finalize"}"#
        );
    }

    #[test]
    fn test_failed_event_flattens_failure() {
        let event = WorkerEvent::Failed(Failure::for_batch(FailureKind::BackendWrite, 4, "disk"));
        let line = encode_line(&event).unwrap();
        assert!(line.starts_with(r#"{"event":"failed","kind":"backend_write""#));
        let decoded: WorkerEvent = decode_line(&format!("{}\n", line)).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = decode_line::<WorkerEvent>("not json").unwrap_err();
        assert!(matches!(err, VoxError::Protocol(_)));
        let err = decode_line::<WorkerCommand>(r#"{"cmd":"rewind"}"#).unwrap_err();
        assert!(matches!(err, VoxError::Protocol(_)));
    }

    #[test]
    fn test_batch_rate() {
        let stats = BatchStats {
            elapsed_us: 1_000_000,
            bytes: 1024 * 1024,
        };
        assert!((stats.mb_per_s() - 1.0).abs() < 1e-9);

        let instant = BatchStats {
            elapsed_us: 0,
            bytes: 4096,
        };
        assert_eq!(instant.mb_per_s(), 0.0);
    }
}
