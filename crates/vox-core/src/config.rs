//! Configuration system using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`VoxConfig::default`])
//! 2. A TOML file (`vox.toml` by default)
//! 3. Environment variables prefixed with `VOX_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use vox_core::config::VoxConfig;
//!
//! # fn main() -> Result<(), vox_core::VoxError> {
//! // VOX_WRITER__BATCH_DEPTH=32 overrides writer.batch_depth
//! let config = VoxConfig::load()?;
//! println!("batch depth: {}", config.writer.batch_depth);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::VoxError;
use crate::limits;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "vox.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "VOX_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxConfig {
    /// Logging settings
    pub logging: LoggingConfig,
    /// Writer and worker settings
    pub writer: WriterConfig,
    /// Shared buffer settings
    pub buffer: BufferConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, colored output for development
    #[default]
    Pretty,
    /// Single-line output without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Where the worker loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Separate OS process (`vox worker`)
    #[default]
    Process,
    /// Thread in the producer process
    Thread,
}

/// Compression applied by the TIFF backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiffCompression {
    /// Uncompressed strips
    #[default]
    None,
    /// LZW
    Lzw,
    /// Deflate (zlib)
    Deflate,
}

/// Selects and parameterizes the backend encoder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Validates the indexed fill pattern and discards data.
    Simple {
        /// Fail the batch on a pattern mismatch instead of logging it
        #[serde(default)]
        strict: bool,
    },
    /// Discards data after an artificial per-batch delay.
    Simulated {
        /// Delay per batch in milliseconds
        #[serde(default)]
        write_delay_ms: u64,
    },
    /// Contiguous little-endian stack plus JSON sidecar.
    #[default]
    Raw,
    /// Plain-text per-frame statistics.
    Text,
    /// Multi-page BigTIFF (requires the `storage_tiff` feature).
    Tiff {
        /// Compression scheme
        #[serde(default)]
        compression: TiffCompression,
    },
}

impl BackendConfig {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Simple { .. } => "simple",
            BackendConfig::Simulated { .. } => "simulated",
            BackendConfig::Raw => "raw",
            BackendConfig::Text => "text",
            BackendConfig::Tiff { .. } => "tiff",
        }
    }
}

/// Writer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Frames per batch (depth of each buffer region)
    pub batch_depth: usize,
    /// Directory backends write into
    pub output_dir: PathBuf,
    /// Backend selection
    pub backend: BackendConfig,
    /// Worker placement
    pub worker_mode: WorkerMode,
    /// Slice length for blocking waits in milliseconds
    pub poll_interval_ms: u64,
    /// Bound on waiting for the worker's ready signal in milliseconds
    pub ready_timeout_ms: u64,
    /// Bound on finalize and worker exit during stop in milliseconds
    pub stop_timeout_ms: u64,
    /// Optional bound on a single backpressure wait in milliseconds (unbounded when absent)
    pub backpressure_timeout_ms: Option<u64>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_depth: limits::DEFAULT_BATCH_DEPTH,
            output_dir: PathBuf::from("data"),
            backend: BackendConfig::default(),
            worker_mode: WorkerMode::default(),
            poll_interval_ms: limits::POLL_INTERVAL.as_millis() as u64,
            ready_timeout_ms: limits::READY_TIMEOUT.as_millis() as u64,
            stop_timeout_ms: limits::STOP_TIMEOUT.as_millis() as u64,
            backpressure_timeout_ms: None,
        }
    }
}

impl WriterConfig {
    /// Poll slice for blocking waits.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Start-up bound.
    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Shutdown bound.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Backpressure bound, if any.
    #[must_use]
    pub fn backpressure_timeout(&self) -> Option<Duration> {
        self.backpressure_timeout_ms.map(Duration::from_millis)
    }
}

/// Shared buffer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Directory for segment files (`/dev/shm` or the temp dir when absent)
    pub segment_dir: Option<PathBuf>,
}

impl VoxConfig {
    /// Load configuration from `vox.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load() -> Result<Self, VoxError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, VoxError> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, exposed for callers that merge extra sources.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(VoxConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), VoxError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(VoxError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        limits::validate_batch_depth(self.writer.batch_depth)
            .map_err(|e| VoxError::Config(e.to_string()))?;

        for (name, value) in [
            ("poll_interval_ms", self.writer.poll_interval_ms),
            ("ready_timeout_ms", self.writer.ready_timeout_ms),
            ("stop_timeout_ms", self.writer.stop_timeout_ms),
        ] {
            if value == 0 {
                return Err(VoxError::Config(format!("{} must be positive", name)));
            }
        }

        if self.writer.backpressure_timeout_ms == Some(0) {
            return Err(VoxError::Config(
                "backpressure_timeout_ms must be positive when set".into(),
            ));
        }

        if self.writer.output_dir.as_os_str().is_empty() {
            return Err(VoxError::Config("output_dir must not be empty".into()));
        }

        Ok(())
    }
}
