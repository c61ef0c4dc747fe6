//! CLI entry point for vox.
//!
//! Two commands:
//! - `vox simulate`: push synthetic frames through the full pipeline and
//!   report throughput. Exercises a backend without a camera.
//! - `vox worker`: the worker process spawned by the writer in process mode.
//!   Reads its spec and commands from stdin and writes events to stdout; not
//!   meant to be run by hand.
//!
//! # Usage
//!
//! ```bash
//! vox simulate --frames 500 --width 2048 --height 2048 --backend raw --output data/
//! VOX_WRITER__BATCH_DEPTH=32 vox simulate --backend tiff --compression lzw
//! ```

// Use mimalloc for the frame-sized allocations on the producer path
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use vox_core::logging::{self, LogTarget, TracingConfig};
use vox_core::source::{IndexedFrames, TestPatternFrames};
use vox_core::{
    BackendConfig, Frame, FrameShape, PixelType, TiffCompression, VoxConfig, WorkerMode,
    WriterMetadata,
};
use vox_writer::worker::{run_process_worker, LineCommands};
use vox_writer::VolumeWriter;

#[derive(Parser)]
#[command(name = "vox")]
#[command(about = "Streaming acquisition-to-disk pipeline", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./vox.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic volume through a backend
    Simulate(SimulateArgs),

    /// Internal: run the pipeline worker on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(clap::Args)]
struct SimulateArgs {
    /// Frames in the volume
    #[arg(long, default_value = "100")]
    frames: u64,

    /// Frame width in pixels
    #[arg(long, default_value = "512")]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value = "512")]
    height: u32,

    /// Frames per batch (overrides the configuration)
    #[arg(long)]
    batch_depth: Option<usize>,

    /// Backend (overrides the configuration)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// TIFF compression, with --backend tiff
    #[arg(long, value_enum, default_value = "none")]
    compression: CompressionArg,

    /// Artificial per-batch delay, with --backend simulated
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Output directory (overrides the configuration)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Output file name without extension
    #[arg(long, default_value = "simulated")]
    name: String,

    /// Pixel type
    #[arg(long, value_enum, default_value = "u16")]
    pixel_type: PixelArg,

    /// Frame content
    #[arg(long, value_enum, default_value = "indexed")]
    pattern: PatternArg,

    /// Run the worker on a thread instead of a child process
    #[arg(long)]
    thread: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Simple,
    Simulated,
    Raw,
    Text,
    Tiff,
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressionArg {
    None,
    Lzw,
    Deflate,
}

#[derive(Clone, Copy, ValueEnum)]
enum PixelArg {
    U8,
    U16,
    U32,
    F32,
}

#[derive(Clone, Copy, ValueEnum)]
enum PatternArg {
    /// Frame i filled with the value i
    Indexed,
    /// Moving gradient over a checkerboard (u16 only)
    Test,
}

impl SimulateArgs {
    fn backend(&self) -> Option<BackendConfig> {
        let compression = match self.compression {
            CompressionArg::None => TiffCompression::None,
            CompressionArg::Lzw => TiffCompression::Lzw,
            CompressionArg::Deflate => TiffCompression::Deflate,
        };
        self.backend.map(|backend| match backend {
            BackendArg::Simple => BackendConfig::Simple { strict: true },
            BackendArg::Simulated => BackendConfig::Simulated {
                write_delay_ms: self.delay_ms,
            },
            BackendArg::Raw => BackendConfig::Raw,
            BackendArg::Text => BackendConfig::Text,
            BackendArg::Tiff => BackendConfig::Tiff { compression },
        })
    }

    fn pixel_type(&self) -> PixelType {
        match self.pixel_type {
            PixelArg::U8 => PixelType::U8,
            PixelArg::U16 => PixelType::U16,
            PixelArg::U32 => PixelType::U32,
            PixelArg::F32 => PixelType::F32,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Worker => run_worker(),
        Commands::Simulate(args) => simulate(cli.config, &args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_worker() -> Result<ExitCode> {
    let stdin = std::io::stdin();
    let mut commands = LineCommands::new(stdin.lock());
    let spec = commands.read_spec().context("reading worker spec")?;

    let level = logging::parse_log_level(&spec.log_level)?;
    logging::init(
        TracingConfig::new(level)
            .with_target(LogTarget::Stderr)
            .with_ansi(false),
    )?;
    info!(
        pid = std::process::id(),
        volume = %spec.metadata.file_name,
        backend = spec.backend.kind(),
        "Worker process started"
    );

    let exit = run_process_worker(&spec, commands, std::io::stdout().lock());
    Ok(if exit.is_success() || exit == vox_writer::WorkerExit::Aborted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_config(path: Option<PathBuf>) -> Result<VoxConfig> {
    let config = match path {
        Some(path) => VoxConfig::load_from(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => VoxConfig::load().context("loading configuration")?,
    };
    Ok(config)
}

fn simulate(config_path: Option<PathBuf>, args: &SimulateArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(depth) = args.batch_depth {
        config.writer.batch_depth = depth;
    }
    if let Some(backend) = args.backend() {
        config.writer.backend = backend;
    }
    if let Some(output) = &args.output {
        config.writer.output_dir = output.clone();
    }
    if args.thread {
        config.writer.worker_mode = WorkerMode::Thread;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let pixel_type = args.pixel_type();
    if matches!(args.pattern, PatternArg::Test) && pixel_type != PixelType::U16 {
        bail!("the test pattern is only available for u16 pixels");
    }

    let shape = FrameShape::new(args.width, args.height);
    let metadata =
        WriterMetadata::new(args.frames, shape, args.name.clone()).with_pixel_type(pixel_type);
    let volume_bytes = metadata.frame_bytes() as u64 * args.frames;

    let mut writer = VolumeWriter::from_config(&config)?;
    writer.configure(metadata)?;
    writer.start()?;

    let done = Arc::new(AtomicBool::new(false));
    let reporter = {
        let monitor = writer.monitor();
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(500));
                let snapshot = monitor.snapshot();
                info!(
                    percent = %format!("{:.1}", snapshot.progress * 100.0),
                    frames = snapshot.frames_processed,
                    batches = snapshot.batches_released,
                    "Progress"
                );
            }
        })
    };

    let started = Instant::now();
    let frames: Box<dyn Iterator<Item = Frame>> = match args.pattern {
        PatternArg::Indexed => Box::new(IndexedFrames::new(shape, pixel_type, args.frames)),
        PatternArg::Test => Box::new(TestPatternFrames::new(shape, args.frames)),
    };
    let outcome = writer.write(frames).and_then(|_| writer.stop());
    done.store(true, Ordering::Relaxed);
    if reporter.join().is_err() {
        tracing::warn!("Progress reporter panicked");
    }
    outcome?;

    let elapsed = started.elapsed();
    let mb = volume_bytes as f64 / (1024.0 * 1024.0);
    let rate = mb / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        frames = args.frames,
        elapsed_ms = elapsed.as_millis() as u64,
        megabytes = %format!("{:.1}", mb),
        mb_per_s = %format!("{:.1}", rate),
        backend = config.writer.backend.kind(),
        output = %config.writer.output_dir.display(),
        "Simulation complete"
    );
    println!(
        "wrote {} frames ({:.1} MB) in {:.2?} ({:.1} MB/s)",
        args.frames, mb, elapsed, rate
    );
    Ok(ExitCode::SUCCESS)
}
