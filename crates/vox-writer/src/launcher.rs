//! Worker launchers.
//!
//! A [`WorkerLauncher`] starts the worker for one acquisition and returns a
//! [`WorkerLink`] the writer uses to send commands and join it. Every launcher
//! feeds worker events into the shared [`PipelineSignals`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, warn};

use vox_core::{Failure, FailureKind, VoxError};

use crate::backend::BackendEncoder;
use crate::protocol::{WorkerCommand, WorkerEvent, WorkerSpec};
use crate::signals::PipelineSignals;
use crate::worker::{serve, ChannelCommands, SignalSink};

/// Starts workers.
pub trait WorkerLauncher: Send {
    /// Launch a worker for `spec`. Events must be applied to `signals`.
    fn launch(
        &mut self,
        spec: WorkerSpec,
        signals: Arc<PipelineSignals>,
    ) -> Result<Box<dyn WorkerLink>, VoxError>;
}

/// Writer-side end of a running worker.
pub trait WorkerLink: Send {
    /// Send one command.
    fn send(&mut self, command: WorkerCommand) -> Result<(), VoxError>;

    /// Close the command stream. The worker aborts if it has not finalized.
    fn close(&mut self);

    /// Close the command stream and wait up to `timeout` for the worker to
    /// exit. A worker that does not exit in time is killed or detached.
    fn join(&mut self, timeout: Duration);
}

/// Runs the worker on a dedicated thread in this process.
#[derive(Default)]
pub struct ThreadLauncher {
    encoder: Option<Box<dyn BackendEncoder>>,
}

impl std::fmt::Debug for ThreadLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLauncher")
            .field("encoder", &self.encoder.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

impl ThreadLauncher {
    /// Build the backend from the writer configuration on every launch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `encoder` for the next launch instead of the configured backend.
    #[must_use]
    pub fn with_encoder(encoder: impl BackendEncoder + 'static) -> Self {
        Self {
            encoder: Some(Box::new(encoder)),
        }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(
        &mut self,
        spec: WorkerSpec,
        signals: Arc<PipelineSignals>,
    ) -> Result<Box<dyn WorkerLink>, VoxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let encoder = self.encoder.take();
        let worker_signals = Arc::clone(&signals);

        let handle = std::thread::Builder::new()
            .name(format!("vox-worker-{}", spec.metadata.file_name))
            .spawn(move || {
                let mut commands = ChannelCommands::new(rx);
                let mut events = SignalSink::new(Arc::clone(&worker_signals));
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    serve(&spec, encoder, &mut commands, &mut events)
                }));
                if outcome.is_err() {
                    error!("Worker thread panicked");
                    worker_signals.latch(Failure::new(
                        FailureKind::WorkerLost,
                        "worker thread panicked",
                    ));
                    worker_signals.apply(&WorkerEvent::Exited);
                }
            })?;

        debug!("Worker thread started");
        Ok(Box::new(ThreadLink {
            tx: Some(tx),
            handle: Some(handle),
            signals,
        }))
    }
}

struct ThreadLink {
    tx: Option<UnboundedSender<WorkerCommand>>,
    handle: Option<JoinHandle<()>>,
    signals: Arc<PipelineSignals>,
}

impl WorkerLink for ThreadLink {
    fn send(&mut self, command: WorkerCommand) -> Result<(), VoxError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| VoxError::WorkerLost("command channel closed".to_string()))?;
        tx.send(command)
            .map_err(|_| VoxError::WorkerLost("worker thread is gone".to_string()))
    }

    fn close(&mut self) {
        self.tx = None;
    }

    fn join(&mut self, timeout: Duration) {
        self.close();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.signals.wait_exited(timeout) {
            if handle.join().is_err() {
                warn!("Worker thread ended with a panic");
            }
            debug!("Worker thread joined");
        } else {
            warn!(?timeout, "Worker thread did not exit in time, detaching");
        }
    }
}
