//! The worker loop.
//!
//! One loop serves both execution modes. It owns the backend encoder, reads
//! commands from a [`CommandSource`] and reports through an [`EventSink`]:
//!
//! ```text
//! prepare -> Ready
//! Batch{index, region, valid_depth} -> process_batch -> release -> BatchDone
//! Finalize -> finalize -> Finalized
//! Abort | end of stream -> (no finalize)
//! any failure -> Failed
//! always: cleanup -> Exited
//! ```
//!
//! The batch view is dropped before the release is published, so the producer
//! can never toggle onto a region the backend is still reading.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, info_span, warn};

use vox_buffer::BufferReader;
use vox_core::{Failure, FailureKind, VoxError, WriterMetadata};

use crate::backend::{build_encoder, BackendEncoder};
use crate::protocol::{decode_line, encode_line, BatchStats, WorkerCommand, WorkerEvent, WorkerSpec};
use crate::signals::PipelineSignals;

/// Where the worker's commands come from.
pub trait CommandSource {
    /// Next command, or `None` once the writer closed the stream.
    fn next_command(&mut self) -> Result<Option<WorkerCommand>, VoxError>;
}

/// Where the worker's events go.
pub trait EventSink {
    /// Deliver one event.
    fn emit(&mut self, event: WorkerEvent) -> Result<(), VoxError>;
}

/// How a worker loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every batch was processed and the output finalized.
    Finalized,
    /// Aborted or the command stream closed before `Finalize`.
    Aborted,
    /// A terminal failure was reported.
    Failed(Failure),
}

impl WorkerExit {
    /// Whether the output is complete.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Finalized)
    }
}

/// Commands from an in-process channel.
#[derive(Debug)]
pub struct ChannelCommands {
    rx: UnboundedReceiver<WorkerCommand>,
}

impl ChannelCommands {
    /// Wrap the receiving half of the writer's command channel.
    pub fn new(rx: UnboundedReceiver<WorkerCommand>) -> Self {
        Self { rx }
    }
}

impl CommandSource for ChannelCommands {
    fn next_command(&mut self) -> Result<Option<WorkerCommand>, VoxError> {
        Ok(self.rx.blocking_recv())
    }
}

/// Events applied straight to the writer's signals.
#[derive(Debug, Clone)]
pub struct SignalSink {
    signals: Arc<PipelineSignals>,
}

impl SignalSink {
    /// Sink feeding `signals`.
    pub fn new(signals: Arc<PipelineSignals>) -> Self {
        Self { signals }
    }
}

impl EventSink for SignalSink {
    fn emit(&mut self, event: WorkerEvent) -> Result<(), VoxError> {
        self.signals.apply(&event);
        Ok(())
    }
}

/// JSON-line commands, one per line. Blank lines are skipped.
#[derive(Debug)]
pub struct LineCommands<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> LineCommands<R> {
    /// Read commands from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Read the leading [`WorkerSpec`] line.
    pub fn read_spec(&mut self) -> Result<WorkerSpec, VoxError> {
        match self.next_line()? {
            Some(line) => decode_line(&line),
            None => Err(VoxError::WorkerLost(
                "command stream closed before the worker spec".to_string(),
            )),
        }
    }

    fn next_line(&mut self) -> Result<Option<String>, VoxError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            if !self.line.trim().is_empty() {
                return Ok(Some(self.line.clone()));
            }
        }
    }
}

impl<R: BufRead> CommandSource for LineCommands<R> {
    fn next_command(&mut self) -> Result<Option<WorkerCommand>, VoxError> {
        match self.next_line()? {
            Some(line) => decode_line(&line).map(Some),
            None => Ok(None),
        }
    }
}

/// JSON-line events, flushed after every line.
#[derive(Debug)]
pub struct LineEvents<W> {
    writer: W,
}

impl<W: Write> LineEvents<W> {
    /// Write events to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for LineEvents<W> {
    fn emit(&mut self, event: WorkerEvent) -> Result<(), VoxError> {
        let line = encode_line(&event)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn emit_or_log(events: &mut dyn EventSink, event: WorkerEvent) {
    if let Err(e) = events.emit(event) {
        warn!(error = %e, "Cannot deliver worker event");
    }
}

/// Run the worker loop to completion.
///
/// Never panics on backend errors: every failure is reported as a
/// `Failed` event, `cleanup` always runs, and `Exited` is always the last
/// event.
pub fn run_worker(
    reader: &BufferReader,
    metadata: &WriterMetadata,
    encoder: &mut dyn BackendEncoder,
    commands: &mut dyn CommandSource,
    events: &mut dyn EventSink,
) -> WorkerExit {
    let span = info_span!("worker", backend = encoder.name(), volume = %metadata.file_name);
    let _enter = span.enter();

    let exit = drive(reader, metadata, encoder, commands, events);
    if let WorkerExit::Failed(failure) = &exit {
        error!(%failure, "Worker failed");
        reader.mark_failed();
        emit_or_log(events, WorkerEvent::Failed(failure.clone()));
    }

    if let Err(e) = encoder.cleanup() {
        warn!(error = %e.detailed(), "Backend cleanup failed");
    }
    emit_or_log(events, WorkerEvent::Exited);
    info!(?exit, "Worker exited");
    exit
}

fn drive(
    reader: &BufferReader,
    metadata: &WriterMetadata,
    encoder: &mut dyn BackendEncoder,
    commands: &mut dyn CommandSource,
    events: &mut dyn EventSink,
) -> WorkerExit {
    let lost = |e: VoxError| WorkerExit::Failed(Failure::new(FailureKind::WorkerLost, e.to_string()));

    if let Err(e) = encoder.prepare(metadata) {
        return WorkerExit::Failed(Failure::new(FailureKind::BackendInit, e.detailed()));
    }
    if let Err(e) = events.emit(WorkerEvent::Ready) {
        return lost(e);
    }
    info!(frames = metadata.frame_count, "Backend prepared");

    let mut next_index = 0u64;
    let mut frames_processed = 0u64;
    let mut throughput = Throughput::default();
    loop {
        let command = match commands.next_command() {
            Ok(Some(command)) => command,
            Ok(None) => {
                info!("Command stream closed, aborting");
                return WorkerExit::Aborted;
            }
            Err(e) => return lost(e),
        };

        match command {
            WorkerCommand::Batch {
                index,
                region,
                valid_depth,
            } => {
                if index != next_index {
                    return WorkerExit::Failed(Failure::for_batch(
                        FailureKind::WorkerLost,
                        index,
                        format!("batch {} received out of order, expected {}", index, next_index),
                    ));
                }

                let started = Instant::now();
                let bytes = {
                    let view = match reader.batch(region, valid_depth) {
                        Ok(view) => view,
                        Err(e) => {
                            return WorkerExit::Failed(Failure::for_batch(
                                FailureKind::WorkerLost,
                                index,
                                e.to_string(),
                            ))
                        }
                    };
                    if let Err(e) = encoder.process_batch(&view, index, valid_depth) {
                        return WorkerExit::Failed(Failure::for_batch(
                            FailureKind::BackendWrite,
                            index,
                            e.detailed(),
                        ));
                    }
                    (view.frame_bytes() * valid_depth) as u64
                };

                next_index += 1;
                frames_processed += valid_depth as u64;
                let progress = if metadata.frame_count == 0 {
                    0.0
                } else {
                    frames_processed as f64 / metadata.frame_count as f64
                };
                reader.publish_progress(next_index, frames_processed, progress);

                let stats = BatchStats {
                    elapsed_us: started.elapsed().as_micros() as u64,
                    bytes,
                };
                throughput.record(&stats);
                debug!(
                    batch = index,
                    valid_depth,
                    frames_processed,
                    elapsed_us = stats.elapsed_us,
                    mb_per_s = %format!("{:.1}", stats.mb_per_s()),
                    avg_mb_per_s = %format!("{:.1}", throughput.mb_per_s()),
                    "Batch released"
                );
                if let Err(e) = events.emit(WorkerEvent::BatchDone {
                    index,
                    valid_depth,
                    frames_processed,
                    stats,
                }) {
                    return lost(e);
                }
            }
            WorkerCommand::Finalize => {
                if let Err(e) = encoder.finalize() {
                    return WorkerExit::Failed(Failure::new(
                        FailureKind::BackendFinalize,
                        e.detailed(),
                    ));
                }
                info!(frames_processed, batches = next_index, "Output finalized");
                if let Err(e) = events.emit(WorkerEvent::Finalized { frames_processed }) {
                    return lost(e);
                }
                return WorkerExit::Finalized;
            }
            WorkerCommand::Abort => {
                info!(batches = next_index, "Abort received");
                return WorkerExit::Aborted;
            }
        }
    }
}

/// Running write rate over every batch of one volume.
#[derive(Debug, Default, Clone, Copy)]
struct Throughput {
    bytes: u64,
    elapsed_us: u64,
}

impl Throughput {
    fn record(&mut self, stats: &BatchStats) {
        self.bytes += stats.bytes;
        self.elapsed_us += stats.elapsed_us;
    }

    fn mb_per_s(&self) -> f64 {
        BatchStats {
            elapsed_us: self.elapsed_us,
            bytes: self.bytes,
        }
        .mb_per_s()
    }
}

/// Report a failure that happened before the worker loop could start.
pub fn report_startup_failure(events: &mut dyn EventSink, failure: Failure) -> WorkerExit {
    error!(%failure, "Worker startup failed");
    emit_or_log(events, WorkerEvent::Failed(failure.clone()));
    emit_or_log(events, WorkerEvent::Exited);
    WorkerExit::Failed(failure)
}

/// Attach to the segment named in `spec`, build the backend (unless one is
/// supplied) and run the worker loop.
pub fn serve(
    spec: &WorkerSpec,
    encoder: Option<Box<dyn BackendEncoder>>,
    commands: &mut dyn CommandSource,
    events: &mut dyn EventSink,
) -> WorkerExit {
    let reader = match BufferReader::open(&spec.handle) {
        Ok(reader) => reader,
        Err(e) => {
            return report_startup_failure(
                events,
                Failure::new(
                    FailureKind::BackendInit,
                    format!("cannot attach shared buffer: {}", e),
                ),
            )
        }
    };
    let mut encoder = match encoder {
        Some(encoder) => encoder,
        None => match build_encoder(&spec.backend, &spec.output_dir) {
            Ok(encoder) => encoder,
            Err(e) => {
                return report_startup_failure(
                    events,
                    Failure::new(FailureKind::BackendInit, e.detailed()),
                )
            }
        },
    };
    debug!(
        segment = %spec.handle.path.display(),
        shape = %spec.handle.shape,
        backend = spec.backend.kind(),
        "Worker attached"
    );
    run_worker(&reader, &spec.metadata, encoder.as_mut(), commands, events)
}

/// Entry point of `vox worker`: spec and commands on `input`, events on
/// `output`. Logging must already be initialized to stderr.
pub fn run_process_worker<R: BufRead, W: Write>(
    spec: &WorkerSpec,
    commands: LineCommands<R>,
    output: W,
) -> WorkerExit {
    let mut commands = commands;
    let mut events = LineEvents::new(output);
    serve(spec, None, &mut commands, &mut events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryEncoder;
    use std::collections::VecDeque;
    use vox_buffer::SharedDoubleBuffer;
    use vox_core::{Frame, FrameShape, PixelType};

    struct Script(VecDeque<WorkerCommand>);

    impl CommandSource for Script {
        fn next_command(&mut self) -> Result<Option<WorkerCommand>, VoxError> {
            Ok(self.0.pop_front())
        }
    }

    #[derive(Default)]
    struct Collect(Vec<WorkerEvent>);

    impl EventSink for Collect {
        fn emit(&mut self, event: WorkerEvent) -> Result<(), VoxError> {
            self.0.push(event);
            Ok(())
        }
    }

    const SHAPE: FrameShape = FrameShape::new(3, 2);

    fn setup(frames: usize) -> (tempfile::TempDir, SharedDoubleBuffer, BufferReader, u32) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedDoubleBuffer::allocate(SHAPE, 4, PixelType::U8, Some(dir.path())).unwrap();
        let reader = BufferReader::open(buffer.handle()).unwrap();
        for i in 0..frames {
            buffer
                .add_frame(&Frame::filled(SHAPE, PixelType::U8, i as f64))
                .unwrap();
        }
        let region = buffer.toggle().unwrap().region;
        (dir, buffer, reader, region)
    }

    #[test]
    fn test_single_batch_then_finalize() {
        let (_dir, _buffer, reader, region) = setup(3);
        let meta = WriterMetadata::new(3, SHAPE, "w").with_pixel_type(PixelType::U8);
        let (mut encoder, record) = MemoryEncoder::new();
        let mut commands = Script(VecDeque::from([
            WorkerCommand::Batch {
                index: 0,
                region,
                valid_depth: 3,
            },
            WorkerCommand::Finalize,
        ]));
        let mut events = Collect::default();

        let exit = run_worker(&reader, &meta, &mut encoder, &mut commands, &mut events);
        assert_eq!(exit, WorkerExit::Finalized);
        assert_eq!(record.batch_shapes(), vec![(0, 3)]);
        assert_eq!(record.frames()[2], vec![2u8; 6]);
        assert_eq!(record.finalize_calls(), 1);
        assert_eq!(record.cleanup_calls(), 1);

        assert_eq!(events.0.first(), Some(&WorkerEvent::Ready));
        assert!(matches!(
            events.0[1],
            WorkerEvent::BatchDone {
                index: 0,
                valid_depth: 3,
                frames_processed: 3,
                ..
            }
        ));
        assert_eq!(events.0[2], WorkerEvent::Finalized { frames_processed: 3 });
        assert_eq!(events.0.last(), Some(&WorkerEvent::Exited));

        let progress = reader.progress();
        assert_eq!(progress.batches_released, 1);
        assert!((progress.progress - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_prepare_failure_reports_init_error() {
        let (_dir, _buffer, reader, _) = setup(1);
        let meta = WriterMetadata::new(1, SHAPE, "w").with_pixel_type(PixelType::U8);
        let (encoder, record) = MemoryEncoder::new();
        let mut encoder = encoder.fail_prepare("no disk");
        let mut events = Collect::default();

        let exit = run_worker(&reader, &meta, &mut encoder, &mut Script(VecDeque::new()), &mut events);
        match exit {
            WorkerExit::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::BackendInit);
                assert_eq!(failure.message, "no disk");
            }
            other => panic!("unexpected exit: {:?}", other),
        }
        assert_eq!(record.cleanup_calls(), 1);
        assert!(reader.progress().failed);
        assert_eq!(events.0.len(), 2);
        assert_eq!(events.0.last(), Some(&WorkerEvent::Exited));
    }

    #[test]
    fn test_failed_batch_skips_finalize() {
        let (_dir, _buffer, reader, region) = setup(2);
        let meta = WriterMetadata::new(2, SHAPE, "w").with_pixel_type(PixelType::U8);
        let (encoder, record) = MemoryEncoder::new();
        let mut encoder = encoder.fail_on_batch(0).fail_cleanup();
        let mut commands = Script(VecDeque::from([
            WorkerCommand::Batch {
                index: 0,
                region,
                valid_depth: 2,
            },
            WorkerCommand::Finalize,
        ]));
        let mut events = Collect::default();

        let exit = run_worker(&reader, &meta, &mut encoder, &mut commands, &mut events);
        assert!(matches!(
            exit,
            WorkerExit::Failed(Failure {
                kind: FailureKind::BackendWrite,
                batch: Some(0),
                ..
            })
        ));
        assert_eq!(record.finalize_calls(), 0);
        assert_eq!(record.cleanup_calls(), 1);
        assert_eq!(reader.progress().batches_released, 0);
    }

    #[test]
    fn test_out_of_order_batch_is_rejected() {
        let (_dir, _buffer, reader, region) = setup(1);
        let meta = WriterMetadata::new(8, SHAPE, "w").with_pixel_type(PixelType::U8);
        let (mut encoder, record) = MemoryEncoder::new();
        let mut commands = Script(VecDeque::from([WorkerCommand::Batch {
            index: 1,
            region,
            valid_depth: 1,
        }]));

        let exit = run_worker(&reader, &meta, &mut encoder, &mut commands, &mut Collect::default());
        assert!(matches!(
            exit,
            WorkerExit::Failed(Failure {
                kind: FailureKind::WorkerLost,
                ..
            })
        ));
        assert!(record.batches().is_empty());
    }

    #[test]
    fn test_closed_stream_aborts_without_finalize() {
        let (_dir, _buffer, reader, _) = setup(1);
        let meta = WriterMetadata::new(1, SHAPE, "w").with_pixel_type(PixelType::U8);
        let (mut encoder, record) = MemoryEncoder::new();

        let exit = run_worker(&reader, &meta, &mut encoder, &mut Script(VecDeque::new()), &mut Collect::default());
        assert_eq!(exit, WorkerExit::Aborted);
        assert_eq!(record.finalize_calls(), 0);
        assert_eq!(record.cleanup_calls(), 1);
    }

    #[test]
    fn test_line_transport() {
        let (dir, buffer, _reader, region) = setup(2);
        let spec = WorkerSpec {
            handle: buffer.handle().clone(),
            metadata: WriterMetadata::new(2, SHAPE, "lines").with_pixel_type(PixelType::U8),
            backend: vox_core::BackendConfig::Raw,
            output_dir: dir.path().join("out"),
            log_level: "debug".to_string(),
        };
        let mut input = String::new();
        input.push_str(&encode_line(&spec).unwrap());
        input.push_str("\n\n");
        for command in [
            WorkerCommand::Batch {
                index: 0,
                region,
                valid_depth: 2,
            },
            WorkerCommand::Finalize,
        ] {
            input.push_str(&encode_line(&command).unwrap());
            input.push('\n');
        }

        let mut commands = LineCommands::new(input.as_bytes());
        let decoded = commands.read_spec().unwrap();
        assert_eq!(decoded, spec);
        let mut output = Vec::new();
        let exit = run_process_worker(&decoded, commands, &mut output);
        assert!(exit.is_success());

        let events: Vec<WorkerEvent> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| decode_line(l).unwrap())
            .collect();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], WorkerEvent::Exited);
        assert!(dir.path().join("out").join("lines.raw").exists());
    }

    #[test]
    fn test_missing_segment_is_startup_failure() {
        let (dir, buffer, _reader, _) = setup(0);
        let mut handle = buffer.handle().clone();
        handle.path = dir.path().join("missing.seg");
        let spec = WorkerSpec {
            handle,
            metadata: WriterMetadata::new(1, SHAPE, "x"),
            backend: vox_core::BackendConfig::Raw,
            output_dir: dir.path().to_path_buf(),
            log_level: "info".to_string(),
        };
        let mut events = Collect::default();
        let exit = serve(&spec, None, &mut Script(VecDeque::new()), &mut events);
        assert!(matches!(
            exit,
            WorkerExit::Failed(Failure {
                kind: FailureKind::BackendInit,
                ..
            })
        ));
        assert_eq!(events.0.last(), Some(&WorkerEvent::Exited));
    }

    #[test]
    fn test_throughput_accumulates_across_batches() {
        let mut throughput = Throughput::default();
        assert_eq!(throughput.mb_per_s(), 0.0);

        throughput.record(&BatchStats {
            elapsed_us: 500_000,
            bytes: 1024 * 1024,
        });
        throughput.record(&BatchStats {
            elapsed_us: 1_500_000,
            bytes: 3 * 1024 * 1024,
        });
        assert!((throughput.mb_per_s() - 2.0).abs() < 1e-9);
    }
}
