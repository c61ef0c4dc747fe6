//! Progress and failure signalling between the worker and the producer.
//!
//! [`PipelineSignals`] is the single place worker events land, whichever
//! transport carried them. The producer blocks on it (readiness, batch
//! release, finalize, exit) with a `parking_lot::Condvar`, waking in
//! `poll_interval` slices to re-check cancellation and latched failures.
//!
//! The latched failure is first-wins: once set it is never replaced.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use vox_core::{Failure, FailureKind, VoxError};

use crate::accumulator::SwapGate;
use crate::protocol::{BatchStats, WorkerEvent};

#[derive(Debug, Default)]
struct SignalState {
    frame_count: u64,
    ready: bool,
    released: u64,
    frames_processed: u64,
    finalized: bool,
    exited: bool,
    failure: Option<Failure>,
    last_stats: Option<BatchStats>,
}

impl SignalState {
    fn progress(&self) -> f64 {
        if self.frame_count == 0 {
            return 0.0;
        }
        (self.frames_processed as f64 / self.frame_count as f64).min(1.0)
    }
}

/// Shared signal block for one acquisition.
#[derive(Debug)]
pub struct PipelineSignals {
    state: Mutex<SignalState>,
    cond: Condvar,
    cancel: AtomicBool,
    poll_interval: Duration,
    backpressure_timeout: Option<Duration>,
}

impl PipelineSignals {
    /// Signals that wake waiters at least every `poll_interval`.
    #[must_use]
    pub fn new(poll_interval: Duration, backpressure_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
            cancel: AtomicBool::new(false),
            poll_interval,
            backpressure_timeout,
        }
    }

    /// Clear everything for a new volume of `frame_count` frames.
    pub fn reset(&self, frame_count: u64) {
        let mut state = self.state.lock();
        *state = SignalState {
            frame_count,
            ..SignalState::default()
        };
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Apply one worker event and wake every waiter.
    pub fn apply(&self, event: &WorkerEvent) {
        let mut state = self.state.lock();
        match event {
            WorkerEvent::Ready => state.ready = true,
            WorkerEvent::BatchDone {
                index,
                frames_processed,
                stats,
                ..
            } => {
                state.released = state.released.max(index + 1);
                state.frames_processed = state.frames_processed.max(*frames_processed);
                state.last_stats = Some(*stats);
            }
            WorkerEvent::Failed(failure) => {
                if state.failure.is_none() {
                    state.failure = Some(failure.clone());
                } else {
                    debug!(%failure, "Ignoring failure after the first");
                }
            }
            WorkerEvent::Finalized { frames_processed } => {
                state.finalized = true;
                state.frames_processed = state.frames_processed.max(*frames_processed);
            }
            WorkerEvent::Exited => state.exited = true,
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Latch a failure raised outside the worker.
    pub fn latch(&self, failure: Failure) {
        self.apply(&WorkerEvent::Failed(failure));
    }

    /// The worker's event stream ended. Latches `WorkerLost` unless the worker
    /// finished cleanly, already failed, or was cancelled.
    pub fn worker_gone(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.exited {
            return;
        }
        if state.failure.is_none() && !state.finalized && !self.is_cancelled() {
            warn!(reason, "Worker vanished");
            state.failure = Some(Failure::new(FailureKind::WorkerLost, reason));
        }
        state.exited = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Interrupt every blocked wait with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Block until `pred` holds.
    ///
    /// Checked in order on every wake-up: latched failure, cancellation,
    /// `pred`, worker exit, then `timeout`.
    pub fn wait_until(
        &self,
        waiting_for: &'static str,
        timeout: Option<Duration>,
        pred: impl Fn(&SignalStateView) -> bool,
    ) -> Result<(), VoxError> {
        let started = Instant::now();
        let mut state = self.state.lock();
        loop {
            if let Some(failure) = &state.failure {
                return Err(failure.clone().into());
            }
            if self.is_cancelled() {
                return Err(VoxError::Cancelled);
            }
            if pred(&SignalStateView::of(&state)) {
                return Ok(());
            }
            if state.exited {
                return Err(VoxError::WorkerLost(format!(
                    "worker exited while waiting for {}",
                    waiting_for
                )));
            }
            let elapsed = started.elapsed();
            let slice = match timeout {
                Some(limit) if elapsed >= limit => {
                    return Err(VoxError::Timeout {
                        elapsed,
                        waiting_for,
                    });
                }
                Some(limit) => self.poll_interval.min(limit - elapsed),
                None => self.poll_interval,
            };
            self.cond.wait_for(&mut state, slice);
        }
    }

    /// Block until the worker has sent `Ready`.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), VoxError> {
        self.wait_until("worker ready", Some(timeout), |s| s.ready)
    }

    /// Block until the worker has finalized the output.
    pub fn wait_finalized(&self, timeout: Duration) -> Result<(), VoxError> {
        self.wait_until("finalize", Some(timeout), |s| s.finalized)
    }

    /// Block until the worker has exited, ignoring failures and cancellation.
    /// Returns `false` on timeout.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.exited {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = self.poll_interval.min(deadline - now);
            self.cond.wait_for(&mut state, slice);
        }
        true
    }

    /// Snapshot of the current signal state.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            frame_count: state.frame_count,
            batches_released: state.released,
            frames_processed: state.frames_processed,
            progress: state.progress(),
            ready: state.ready,
            finalized: state.finalized,
            exited: state.exited,
            failure: state.failure.clone(),
            last_batch: state.last_stats,
        }
    }

    /// Latched failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.state.lock().failure.clone()
    }

    /// Fraction of the volume processed, in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.state.lock().progress()
    }
}

impl SwapGate for PipelineSignals {
    fn wait_released(&self, dispatched: u64) -> Result<(), VoxError> {
        self.wait_until("batch release", self.backpressure_timeout, |s| {
            s.batches_released >= dispatched
        })
    }
}

/// Read-only view handed to wait predicates.
#[derive(Debug, Clone, Copy)]
pub struct SignalStateView {
    /// Worker sent `Ready`
    pub ready: bool,
    /// Batches released by the worker
    pub batches_released: u64,
    /// Worker sent `Finalized`
    pub finalized: bool,
}

impl SignalStateView {
    fn of(state: &SignalState) -> Self {
        Self {
            ready: state.ready,
            batches_released: state.released,
            finalized: state.finalized,
        }
    }
}

/// Point-in-time progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Declared frames in the volume
    pub frame_count: u64,
    /// Batches processed and released
    pub batches_released: u64,
    /// Frames processed
    pub frames_processed: u64,
    /// `frames_processed / frame_count`
    pub progress: f64,
    /// Worker reported ready
    pub ready: bool,
    /// Output finalized
    pub finalized: bool,
    /// Worker exited
    pub exited: bool,
    /// Latched failure
    pub failure: Option<Failure>,
    /// Timing of the most recent batch
    pub last_batch: Option<BatchStats>,
}

/// Cloneable, non-blocking progress observer.
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    signals: Arc<PipelineSignals>,
}

impl ProgressMonitor {
    pub(crate) fn new(signals: Arc<PipelineSignals>) -> Self {
        Self { signals }
    }

    /// Fraction processed, in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.signals.progress()
    }

    /// Percentage processed, in `[0, 100]`.
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.progress() * 100.0
    }

    /// Latched failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.signals.failure()
    }

    /// Full snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.signals.snapshot()
    }
}

/// Cloneable handle that interrupts a blocked producer from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signals: Arc<PipelineSignals>,
}

impl StopHandle {
    pub(crate) fn new(signals: Arc<PipelineSignals>) -> Self {
        Self { signals }
    }

    /// Request a stop. A producer blocked on backpressure returns `Cancelled`.
    pub fn request_stop(&self) {
        debug!("Stop requested");
        self.signals.cancel();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.signals.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn signals() -> Arc<PipelineSignals> {
        let signals = Arc::new(PipelineSignals::new(Duration::from_millis(5), None));
        signals.reset(10);
        signals
    }

    fn done(index: u64, frames_processed: u64) -> WorkerEvent {
        WorkerEvent::BatchDone {
            index,
            valid_depth: 4,
            frames_processed,
            stats: BatchStats::default(),
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let signals = signals();
        signals.apply(&done(0, 4));
        signals.apply(&done(1, 8));
        assert!((signals.progress() - 0.8).abs() < 1e-9);
        signals.apply(&done(0, 4));
        assert!((signals.progress() - 0.8).abs() < 1e-9);
        assert_eq!(signals.snapshot().batches_released, 2);
    }

    #[test]
    fn test_first_failure_wins() {
        let signals = signals();
        signals.latch(Failure::for_batch(FailureKind::BackendWrite, 1, "first"));
        signals.latch(Failure::new(FailureKind::WorkerLost, "second"));
        assert_eq!(signals.failure().unwrap().message, "first");
        assert!(matches!(
            signals.wait_released(1),
            Err(VoxError::BackendWrite { batch: 1, .. })
        ));
    }

    #[test]
    fn test_gate_unblocks_on_release() {
        let signals = signals();
        let worker = Arc::clone(&signals);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            worker.apply(&done(0, 4));
        });
        signals.wait_released(1).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_interrupts_gate() {
        let signals = signals();
        let stop = StopHandle::new(Arc::clone(&signals));
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stop.request_stop();
        });
        assert!(matches!(signals.wait_released(1), Err(VoxError::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn test_backpressure_timeout() {
        let signals = PipelineSignals::new(Duration::from_millis(5), Some(Duration::from_millis(20)));
        signals.reset(10);
        assert!(matches!(
            signals.wait_released(1),
            Err(VoxError::Timeout {
                waiting_for: "batch release",
                ..
            })
        ));
    }

    #[test]
    fn test_worker_gone_latches_unless_finished() {
        let signals = signals();
        signals.worker_gone("stdout closed");
        assert_eq!(signals.failure().unwrap().kind, FailureKind::WorkerLost);
        assert!(signals.wait_exited(Duration::from_millis(1)));

        let clean = self::signals();
        clean.apply(&WorkerEvent::Finalized { frames_processed: 10 });
        clean.worker_gone("stdout closed");
        assert!(clean.failure().is_none());
        assert!((clean.progress() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_exit_without_ready_is_worker_lost() {
        let signals = signals();
        signals.apply(&WorkerEvent::Exited);
        assert!(matches!(
            signals.wait_ready(Duration::from_secs(1)),
            Err(VoxError::WorkerLost(_))
        ));
    }

    #[test]
    fn test_monitor_percent() {
        let signals = signals();
        let monitor = ProgressMonitor::new(Arc::clone(&signals));
        signals.apply(&done(0, 5));
        assert!((monitor.percent() - 50.0).abs() < 1e-9);
        assert!(monitor.failure().is_none());
    }
}
