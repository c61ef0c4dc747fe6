//! The volume writer state machine.
//!
//! ```text
//! IDLE --configure--> CONFIGURED --start--> RUNNING --last frame--> FINALIZING --> DONE
//!                                              any fault --> ERROR
//! ```
//!
//! [`VolumeWriter`] is the producer side of the pipeline. It owns the shared
//! buffer, the batch accumulator and the link to the worker. Worker failures
//! are latched in the shared signals and surfaced on the next call; once in
//! `ERROR` the worker has been aborted and the buffer released, and every
//! further call returns the latched error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use vox_buffer::{BufferHandle, SharedDoubleBuffer, SwapTicket};
use vox_core::{
    Failure, Frame, VoxConfig, VoxError, WorkerMode, WriterConfig, WriterMetadata, WriterState,
};

use crate::accumulator::BatchAccumulator;
use crate::launcher::{ThreadLauncher, WorkerLauncher, WorkerLink};
use crate::process::ProcessLauncher;
use crate::protocol::{WorkerCommand, WorkerSpec};
use crate::signals::{PipelineSignals, ProgressMonitor, ProgressSnapshot, StopHandle};

/// Streams frames of one volume at a time to a backend encoder.
pub struct VolumeWriter {
    config: WriterConfig,
    segment_dir: Option<PathBuf>,
    log_level: String,
    launcher: Box<dyn WorkerLauncher>,
    signals: Arc<PipelineSignals>,
    state: WriterState,
    metadata: Option<WriterMetadata>,
    buffer: Option<SharedDoubleBuffer>,
    accumulator: Option<BatchAccumulator>,
    link: Option<Box<dyn WorkerLink>>,
}

impl std::fmt::Debug for VolumeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeWriter")
            .field("state", &self.state)
            .field("backend", &self.config.backend.kind())
            .field("batch_depth", &self.config.batch_depth)
            .field("metadata", &self.metadata)
            .field("buffer", &self.buffer.as_ref().map(SharedDoubleBuffer::handle))
            .finish()
    }
}

impl VolumeWriter {
    /// Writer using the launcher selected by `config.writer.worker_mode`.
    pub fn from_config(config: &VoxConfig) -> Result<Self, VoxError> {
        config.validate()?;
        let launcher: Box<dyn WorkerLauncher> = match config.writer.worker_mode {
            WorkerMode::Process => Box::new(ProcessLauncher::from_env()?),
            WorkerMode::Thread => Box::new(ThreadLauncher::new()),
        };
        let mut writer = Self::with_boxed_launcher(config.writer.clone(), launcher);
        writer.segment_dir = config.buffer.segment_dir.clone();
        writer.log_level = config.logging.level.clone();
        Ok(writer)
    }

    /// Writer using `launcher` for its workers.
    pub fn with_launcher(config: WriterConfig, launcher: impl WorkerLauncher + 'static) -> Self {
        Self::with_boxed_launcher(config, Box::new(launcher))
    }

    fn with_boxed_launcher(config: WriterConfig, launcher: Box<dyn WorkerLauncher>) -> Self {
        let signals = Arc::new(PipelineSignals::new(
            config.poll_interval(),
            config.backpressure_timeout(),
        ));
        Self {
            config,
            segment_dir: None,
            log_level: "info".to_string(),
            launcher,
            signals,
            state: WriterState::Idle,
            metadata: None,
            buffer: None,
            accumulator: None,
            link: None,
        }
    }

    /// Place shared segments in `dir` instead of the platform default.
    #[must_use]
    pub fn with_segment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.segment_dir = Some(dir.into());
        self
    }

    /// Current state.
    ///
    /// A latched worker failure reads as `ERROR` and a completed finalize as
    /// `DONE` even before the next call observes them. Until that call
    /// (`stop` or `wait_to_finish`) the segment stays mapped and the worker
    /// unjoined, so callers must still call one of them to release resources.
    #[must_use]
    pub fn state(&self) -> WriterState {
        match self.state {
            WriterState::Running | WriterState::Finalizing if self.signals.failure().is_some() => {
                WriterState::Error
            }
            WriterState::Finalizing if self.signals.snapshot().finalized => WriterState::Done,
            state => state,
        }
    }

    /// Writer configuration.
    #[must_use]
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Metadata of the configured volume.
    #[must_use]
    pub fn metadata(&self) -> Option<&WriterMetadata> {
        self.metadata.as_ref()
    }

    /// Handle of the shared buffer while one is allocated.
    #[must_use]
    pub fn buffer_handle(&self) -> Option<&BufferHandle> {
        self.buffer.as_ref().map(SharedDoubleBuffer::handle)
    }

    /// Fraction of the volume processed.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.signals.progress()
    }

    /// Cloneable progress observer.
    #[must_use]
    pub fn monitor(&self) -> ProgressMonitor {
        ProgressMonitor::new(Arc::clone(&self.signals))
    }

    /// Cloneable handle that interrupts a blocked `write`.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.signals))
    }

    /// Progress snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.signals.snapshot()
    }

    /// Frames accepted for the current volume.
    #[must_use]
    pub fn frames_accepted(&self) -> u64 {
        self.accumulator
            .as_ref()
            .map_or(0, BatchAccumulator::frames_accepted)
    }

    /// Validate `metadata` and allocate the shared buffer.
    #[instrument(skip(self, metadata), fields(volume = %metadata.file_name))]
    pub fn configure(&mut self, metadata: WriterMetadata) -> Result<(), VoxError> {
        if self.state != WriterState::Idle {
            return Err(VoxError::AlreadyConfigured);
        }
        metadata.validate()?;

        let buffer = SharedDoubleBuffer::allocate(
            metadata.frame_shape,
            self.config.batch_depth,
            metadata.pixel_type,
            self.segment_dir.as_deref(),
        )?;
        info!(
            frames = metadata.frame_count,
            shape = %metadata.frame_shape,
            pixel_type = %metadata.pixel_type,
            batch_depth = self.config.batch_depth,
            batches = metadata.batch_count(self.config.batch_depth),
            segment = %buffer.handle().path.display(),
            "Writer configured"
        );

        self.signals.reset(metadata.frame_count);
        self.accumulator = Some(BatchAccumulator::new(
            metadata.frame_count,
            self.config.batch_depth,
        ));
        self.buffer = Some(buffer);
        self.metadata = Some(metadata);
        self.state = WriterState::Configured;
        Ok(())
    }

    /// Launch the worker and wait for its backend to be prepared.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<(), VoxError> {
        if self.state != WriterState::Configured {
            return Err(VoxError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let (Some(buffer), Some(metadata)) = (self.buffer.as_ref(), self.metadata.as_ref()) else {
            return Err(VoxError::InvalidState {
                operation: "start",
                state: self.state,
            });
        };

        let spec = WorkerSpec {
            handle: buffer.handle().clone(),
            metadata: metadata.clone(),
            backend: self.config.backend.clone(),
            output_dir: self.config.output_dir.clone(),
            log_level: self.log_level.clone(),
        };
        self.state = WriterState::Running;
        match self.launcher.launch(spec, Arc::clone(&self.signals)) {
            Ok(link) => self.link = Some(link),
            Err(e) => return Err(self.fail(e)),
        }

        if let Err(e) = self.signals.wait_ready(self.config.ready_timeout()) {
            return Err(self.fail(e));
        }
        info!(backend = self.config.backend.kind(), "Writer running");
        Ok(())
    }

    /// Add one frame.
    ///
    /// Completing a batch dispatches it to the worker, blocking first until
    /// the worker has released the previous one. Accepting the last declared
    /// frame dispatches `Finalize` and moves the writer to `FINALIZING`.
    pub fn add_frame(&mut self, frame: &Frame) -> Result<(), VoxError> {
        self.ensure_running("add_frame")?;
        if self.signals.is_cancelled() {
            return Err(self.fail(VoxError::Cancelled));
        }

        let added = {
            let (Some(buffer), Some(accumulator)) =
                (self.buffer.as_ref(), self.accumulator.as_mut())
            else {
                return Err(VoxError::InvalidState {
                    operation: "add_frame",
                    state: self.state,
                });
            };
            accumulator
                .add_frame(buffer, self.signals.as_ref(), frame)
                .map(|ticket| (ticket, accumulator.is_complete()))
        };

        match added {
            Ok((Some(ticket), complete)) => {
                self.dispatch(ticket)?;
                if complete {
                    self.begin_finalize()?;
                }
                Ok(())
            }
            Ok((None, _)) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Consume `frames`, returning how many were added.
    ///
    /// Stops at the first error. Frames beyond the declared count fail with
    /// `FrameOverflow`.
    pub fn write<I>(&mut self, frames: I) -> Result<u64, VoxError>
    where
        I: IntoIterator<Item = Frame>,
    {
        let mut added = 0;
        for frame in frames {
            self.add_frame(&frame)?;
            added += 1;
        }
        debug!(added, "Frame sequence consumed");
        Ok(added)
    }

    /// Finish or tear down the current volume, depending on state.
    ///
    /// - `RUNNING`: flush the partial batch, finalize, wait for `DONE`.
    /// - `FINALIZING`: wait for `DONE`.
    /// - `CONFIGURED`: release the buffer, back to `IDLE`.
    /// - `ERROR`: abort the worker, release, return the latched error.
    /// - `IDLE`/`DONE`: nothing.
    ///
    /// A stop requested through a [`StopHandle`] aborts instead of finalizing
    /// and returns `Ok`.
    #[instrument(skip(self), fields(state = %self.state))]
    pub fn stop(&mut self) -> Result<(), VoxError> {
        let result = match self.state {
            WriterState::Idle | WriterState::Done => Ok(()),
            WriterState::Configured => {
                self.teardown();
                self.state = WriterState::Idle;
                info!("Configuration released");
                Ok(())
            }
            WriterState::Running => self.stop_running(),
            WriterState::Finalizing => self.finish(self.config.stop_timeout()),
            WriterState::Error => {
                self.teardown();
                Err(self.latched_error())
            }
        };
        match result {
            Err(VoxError::Cancelled) => {
                info!("Acquisition cancelled");
                Ok(())
            }
            other => other,
        }
    }

    /// Block until `DONE` or `ERROR`, at most `timeout`.
    ///
    /// Only meaningful once every frame was added. A timeout is returned
    /// without affecting the writer.
    pub fn wait_to_finish(&mut self, timeout: Duration) -> Result<WriterState, VoxError> {
        match self.state {
            WriterState::Finalizing => {
                match self.signals.wait_finalized(timeout) {
                    Ok(()) => {}
                    Err(e @ VoxError::Timeout { .. }) => return Err(e),
                    Err(e) => return Err(self.fail(e)),
                }
                self.complete();
                Ok(WriterState::Done)
            }
            WriterState::Done => Ok(WriterState::Done),
            WriterState::Error => Err(self.latched_error()),
            state => Err(VoxError::InvalidState {
                operation: "wait_to_finish",
                state,
            }),
        }
    }

    fn ensure_running(&mut self, operation: &'static str) -> Result<(), VoxError> {
        match self.state {
            WriterState::Running => {
                if let Some(failure) = self.signals.failure() {
                    return Err(self.fail(failure.into()));
                }
                Ok(())
            }
            WriterState::Finalizing => {
                let frame_count = self.metadata.as_ref().map_or(0, |m| m.frame_count);
                Err(self.fail(VoxError::FrameOverflow { frame_count }))
            }
            WriterState::Error => Err(self.latched_error()),
            state => Err(VoxError::InvalidState { operation, state }),
        }
    }

    fn dispatch(&mut self, ticket: SwapTicket) -> Result<(), VoxError> {
        // A failure latched during the gate wait must stop further batches
        if let Some(failure) = self.signals.failure() {
            return Err(self.fail(failure.into()));
        }
        let command = WorkerCommand::Batch {
            index: ticket.swap_index,
            region: ticket.region,
            valid_depth: ticket.valid_depth,
        };
        debug!(
            batch = ticket.swap_index,
            region = ticket.region,
            valid_depth = ticket.valid_depth,
            "Dispatching batch"
        );
        self.send(command)
    }

    fn begin_finalize(&mut self) -> Result<(), VoxError> {
        self.send(WorkerCommand::Finalize)?;
        self.state = WriterState::Finalizing;
        info!(frames = self.frames_accepted(), "All frames dispatched, finalizing");
        Ok(())
    }

    fn send(&mut self, command: WorkerCommand) -> Result<(), VoxError> {
        let sent = match self.link.as_mut() {
            Some(link) => link.send(command),
            None => Err(VoxError::WorkerLost("no worker attached".to_string())),
        };
        sent.map_err(|e| self.fail(e))
    }

    fn stop_running(&mut self) -> Result<(), VoxError> {
        if let Some(failure) = self.signals.failure() {
            return Err(self.fail(failure.into()));
        }
        if self.signals.is_cancelled() {
            return Err(self.fail(VoxError::Cancelled));
        }

        let flushed = match (self.buffer.as_ref(), self.accumulator.as_mut()) {
            (Some(buffer), Some(accumulator)) => accumulator.flush(buffer, self.signals.as_ref()),
            _ => Ok(None),
        };
        match flushed {
            Ok(Some(ticket)) => {
                info!(valid_depth = ticket.valid_depth, "Flushing partial batch");
                self.dispatch(ticket)?;
            }
            Ok(None) => {}
            Err(e) => return Err(self.fail(e)),
        }
        self.begin_finalize()?;
        self.finish(self.config.stop_timeout())
    }

    fn finish(&mut self, timeout: Duration) -> Result<(), VoxError> {
        if let Err(e) = self.signals.wait_finalized(timeout) {
            return Err(self.fail(e));
        }
        self.complete();
        Ok(())
    }

    fn complete(&mut self) {
        self.teardown();
        self.state = WriterState::Done;
        let snapshot = self.signals.snapshot();
        info!(
            frames = snapshot.frames_processed,
            batches = snapshot.batches_released,
            "Volume written"
        );
    }

    /// Latch `err`, abort the worker and release everything.
    ///
    /// Returns the error to surface: the first latched failure when one
    /// exists, otherwise `err` itself.
    fn fail(&mut self, err: VoxError) -> VoxError {
        if !err.is_fatal() {
            return err;
        }
        let surfaced = match self.signals.failure() {
            Some(failure) => VoxError::from(failure),
            None => {
                self.signals.latch(Failure::from_producer(&err));
                err
            }
        };
        if self.state != WriterState::Error {
            error!(error = %surfaced, "Writer entered ERROR");
        }
        self.state = WriterState::Error;
        self.teardown();
        surfaced
    }

    fn latched_error(&self) -> VoxError {
        self.signals
            .failure()
            .map_or_else(|| VoxError::Faulted("writer is in ERROR".to_string()), VoxError::from)
    }

    /// Abort and join the worker, then release the buffer. Idempotent.
    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            if !self.signals.snapshot().exited {
                if let Err(e) = link.send(WorkerCommand::Abort) {
                    debug!(error = %e, "Abort not delivered");
                }
            }
            link.join(self.config.stop_timeout());
        }
        if let Some(mut buffer) = self.buffer.take() {
            buffer.close_and_release();
        }
        self.accumulator = None;
    }
}

impl Drop for VolumeWriter {
    fn drop(&mut self) {
        if self.link.is_some() || self.buffer.is_some() {
            warn!(state = %self.state, "Writer dropped with live resources, aborting");
            self.teardown();
        }
    }
}
