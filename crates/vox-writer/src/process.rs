//! Worker in a child process.
//!
//! The child is `vox worker`. It receives the [`WorkerSpec`] and then one
//! command per stdin line, and answers with one event per stdout line. A relay
//! thread in the parent applies events to the signals; when stdout closes
//! without an `Exited` event the worker counts as lost. The child's stderr is
//! inherited so its logs reach the parent's terminal.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use vox_core::{Failure, FailureKind, VoxError};

use crate::launcher::{WorkerLauncher, WorkerLink};
use crate::protocol::{decode_line, encode_line, WorkerCommand, WorkerEvent, WorkerSpec};
use crate::signals::PipelineSignals;

/// Environment variable overriding the worker executable.
pub const WORKER_BIN_ENV: &str = "VOX_WORKER_BIN";

/// Name of the worker executable.
pub const WORKER_BIN_NAME: &str = "vox";

/// Grace period between the `Exited` event and process exit.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Find the `vox` executable.
///
/// Order: `$VOX_WORKER_BIN`, the current executable's directory, then its
/// parent (test binaries live in `target/<profile>/deps`).
pub fn resolve_worker_program() -> Result<PathBuf, VoxError> {
    if let Some(path) = std::env::var_os(WORKER_BIN_ENV) {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()?;
    let file_name = format!("{}{}", WORKER_BIN_NAME, std::env::consts::EXE_SUFFIX);
    let mut dir = exe.parent();
    for _ in 0..2 {
        let Some(candidate_dir) = dir else { break };
        let candidate = candidate_dir.join(&file_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
        dir = candidate_dir.parent();
    }
    Err(VoxError::Config(format!(
        "worker executable '{}' not found next to {}; set {}",
        file_name,
        exe.display(),
        WORKER_BIN_ENV
    )))
}

/// Spawns `<program> worker` per acquisition.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    /// Launch `program` as the worker executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch the executable found by [`resolve_worker_program`].
    pub fn from_env() -> Result<Self, VoxError> {
        resolve_worker_program().map(Self::new)
    }

    /// Worker executable.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &mut self,
        spec: WorkerSpec,
        signals: Arc<PipelineSignals>,
    ) -> Result<Box<dyn WorkerLink>, VoxError> {
        info!(program = %self.program.display(), "Starting worker process");
        let mut child = Command::new(&self.program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                VoxError::WorkerLost(format!(
                    "cannot start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill(&mut child);
            return Err(VoxError::WorkerLost("worker pipes unavailable".to_string()));
        };

        let line = encode_line(&spec)?;
        if let Err(e) = writeln!(stdin, "{}", line).and_then(|()| stdin.flush()) {
            kill(&mut child);
            return Err(VoxError::WorkerLost(format!("cannot send worker spec: {}", e)));
        }

        let relay_signals = Arc::clone(&signals);
        let relay = std::thread::Builder::new()
            .name("vox-worker-relay".to_string())
            .spawn(move || relay_events(stdout, &relay_signals));
        let relay = match relay {
            Ok(relay) => relay,
            Err(e) => {
                kill(&mut child);
                return Err(e.into());
            }
        };

        debug!(pid = child.id(), "Worker process started");
        Ok(Box::new(ProcessLink {
            stdin: Some(stdin),
            child: Some(child),
            relay: Some(relay),
            signals,
        }))
    }
}

fn relay_events(stdout: ChildStdout, signals: &PipelineSignals) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Worker stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<WorkerEvent>(&line) {
            Ok(event) => {
                let exited = event == WorkerEvent::Exited;
                signals.apply(&event);
                if exited {
                    return;
                }
            }
            Err(e) => {
                signals.latch(Failure::new(
                    FailureKind::WorkerLost,
                    format!("malformed worker event: {}", e),
                ));
            }
        }
    }
    signals.worker_gone("worker stdout closed without an exit event");
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "Kill failed, worker already gone");
    }
    match child.wait() {
        Ok(status) => debug!(%status, "Worker process reaped"),
        Err(e) => warn!(error = %e, "Error waiting for worker process"),
    }
}

struct ProcessLink {
    stdin: Option<ChildStdin>,
    child: Option<Child>,
    relay: Option<JoinHandle<()>>,
    signals: Arc<PipelineSignals>,
}

impl WorkerLink for ProcessLink {
    fn send(&mut self, command: WorkerCommand) -> Result<(), VoxError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VoxError::WorkerLost("command pipe closed".to_string()))?;
        let line = encode_line(&command)?;
        writeln!(stdin, "{}", line)
            .and_then(|()| stdin.flush())
            .map_err(|e| VoxError::WorkerLost(format!("cannot send command: {}", e)))
    }

    fn close(&mut self) {
        self.stdin = None;
    }

    fn join(&mut self, timeout: Duration) {
        self.close();
        let Some(mut child) = self.child.take() else {
            return;
        };

        let started = Instant::now();
        let exited = self.signals.wait_exited(timeout);
        let deadline = Instant::now() + if exited { EXIT_GRACE } else { Duration::ZERO };
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        debug!(%status, "Worker process exited");
                    } else {
                        warn!(%status, "Worker process exited with failure status");
                    }
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(None) => {
                    warn!(elapsed = ?started.elapsed(), "Worker process did not exit, killing");
                    kill(&mut child);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check worker status");
                    kill(&mut child);
                    break;
                }
            }
        }

        if let Some(relay) = self.relay.take() {
            if relay.join().is_err() {
                warn!("Worker relay thread panicked");
            }
        }
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            self.stdin = None;
            kill(&mut child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = ProcessLauncher::new(dir.path().join("no-such-vox"));
        let signals = Arc::new(PipelineSignals::new(Duration::from_millis(5), None));
        let spec = WorkerSpec {
            handle: vox_buffer::BufferHandle {
                path: dir.path().join("x.seg"),
                shape: vox_buffer::BufferShape {
                    depth: 1,
                    height: 1,
                    width: 1,
                },
                pixel_type: vox_core::PixelType::U8,
            },
            metadata: vox_core::WriterMetadata::new(1, vox_core::FrameShape::new(1, 1), "x"),
            backend: vox_core::BackendConfig::Raw,
            output_dir: dir.path().to_path_buf(),
            log_level: "info".to_string(),
        };
        assert!(matches!(
            launcher.launch(spec, signals),
            Err(VoxError::WorkerLost(_))
        ));
    }
}
