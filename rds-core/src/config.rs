//! Capture configuration

use crate::board::{Stimulus, StreamBoardConfig};
use crate::calibration::{CalibrationMode, SearchParams};
use crate::crypto::{parse_block, Block};
use crate::decoder::SampleStride;
use crate::protocol::FrameLayout;
use crate::retry::RetryPolicy;
use crate::session::{KeyMode, PlaintextMode, SessionConfig};
use crate::sim::SimConfig;
use crate::sinks::{SinkOptions, TraceFormat};
use crate::thermometer::{CalibrationLayout, DelayTap};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the calibration file written next to the dumps
pub const CALIBRATION_FILE: &str = "idc_idf.bin";

/// How the board is reached
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Serial device node speaking the byte-stream protocol
    #[default]
    Uart,
    /// In-process simulated board
    Sim,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    #[default]
    Constant,
    Random,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaintextPolicy {
    Constant,
    #[default]
    Chained,
    Ttest,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationKind {
    Skip,
    Manual,
    FromFile,
    #[default]
    Coarse,
    CoarseFine,
}

/// Capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub transport: Transport,

    /// Serial device node (uart transport)
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,

    /// Traces to record
    #[serde(default = "default_num_traces")]
    pub num_traces: u64,

    #[serde(default)]
    pub key_mode: KeyPolicy,

    /// AES key (hex), used with the constant key mode and for calibration
    #[serde(default = "default_key")]
    pub key: String,

    #[serde(default)]
    pub plaintext_mode: PlaintextPolicy,

    /// First plaintext (hex)
    #[serde(default = "default_plaintext")]
    pub plaintext: String,

    /// Fixed plaintext of the t-test mode (hex)
    #[serde(default = "default_fixed_plaintext")]
    pub fixed_plaintext: String,

    /// Random masks loaded before each encryption
    #[serde(default)]
    pub mask_count: usize,

    /// Clock selection sent at connect time
    #[serde(default)]
    pub frequency_mode: Option<u8>,

    #[serde(default = "default_sensors")]
    pub sensors: usize,

    #[serde(default = "default_samples_per_trace")]
    pub samples_per_trace: usize,

    /// Sensor bytes per sample
    #[serde(default = "default_sample_bytes")]
    pub sample_bytes: usize,

    /// Sensor bits per sample
    #[serde(default = "default_sensor_width")]
    pub sensor_width: u32,

    #[serde(default = "default_idc_bits")]
    pub idc_bits: u32,

    #[serde(default = "default_idf_bits")]
    pub idf_bits: u32,

    #[serde(default)]
    pub calibration_mode: CalibrationKind,

    #[serde(default)]
    pub manual_idc: u32,

    #[serde(default)]
    pub manual_idf: u32,

    /// Calibration words to replay (from_file mode)
    #[serde(default)]
    pub calibration_file: Option<PathBuf>,

    /// Captures per tap during a search
    #[serde(default = "default_calibration_repeats")]
    pub calibration_repeats: u32,

    #[serde(default = "default_weight_floor")]
    pub weight_floor: u32,

    #[serde(default = "default_fine_margin")]
    pub fine_margin: u32,

    /// Scan sample weights with overlapping windows
    #[serde(default)]
    pub legacy_sample_stride: bool,

    #[serde(default = "default_max_retries_per_trace")]
    pub max_retries_per_trace: u32,

    /// Reopen attempts per recovery
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Initial wait between reopen attempts in milliseconds
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Directory receiving the dump files
    #[serde(default = "default_dump_path")]
    pub dump_path: PathBuf,

    #[serde(default)]
    pub trace_format: TraceFormat,

    /// Also dump the auxiliary signal as temperatures
    #[serde(default)]
    pub dump_signal: bool,

    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            device_path: default_device_path(),
            num_traces: default_num_traces(),
            key_mode: KeyPolicy::default(),
            key: default_key(),
            plaintext_mode: PlaintextPolicy::default(),
            plaintext: default_plaintext(),
            fixed_plaintext: default_fixed_plaintext(),
            mask_count: 0,
            frequency_mode: None,
            sensors: default_sensors(),
            samples_per_trace: default_samples_per_trace(),
            sample_bytes: default_sample_bytes(),
            sensor_width: default_sensor_width(),
            idc_bits: default_idc_bits(),
            idf_bits: default_idf_bits(),
            calibration_mode: CalibrationKind::default(),
            manual_idc: 0,
            manual_idf: 0,
            calibration_file: None,
            calibration_repeats: default_calibration_repeats(),
            weight_floor: default_weight_floor(),
            fine_margin: default_fine_margin(),
            legacy_sample_stride: false,
            max_retries_per_trace: default_max_retries_per_trace(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            dump_path: default_dump_path(),
            trace_format: TraceFormat::default(),
            dump_signal: false,
            progress_every: default_progress_every(),
        }
    }
}

impl CaptureConfig {
    /// Load from an optional YAML file, then apply `RDS_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("RDS"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("RDS_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_traces == 0 {
            return Err(Error::Config("num_traces must be > 0".to_string()));
        }

        let frame = FrameLayout::default();
        if self.sample_bytes == 0 || self.sample_bytes > frame.sensor_bytes {
            return Err(Error::Config(format!(
                "sample_bytes must be between 1 and {}",
                frame.sensor_bytes
            )));
        }
        if self.sensor_width == 0 || self.sensor_width as usize > self.sample_bytes * 8 {
            return Err(Error::Config(format!(
                "sensor_width must be between 1 and {} for {} sample bytes",
                self.sample_bytes * 8,
                self.sample_bytes
            )));
        }
        if self.samples_per_trace == 0 {
            return Err(Error::Config("samples_per_trace must be > 0".to_string()));
        }
        // byte-stream boards carry a single sensor
        if self.sensors != 1 {
            return Err(Error::Config(format!(
                "{:?} transport drives exactly one sensor, got {}",
                self.transport, self.sensors
            )));
        }

        self.calibration_layout().validate()?;
        self.key_block()?;
        self.plaintext_block()?;
        self.fixed_plaintext_block()?;

        if self.max_retries_per_trace == 0 {
            return Err(Error::Config("max_retries_per_trace must be >= 1".to_string()));
        }
        if self.reconnect_attempts == 0 {
            return Err(Error::Config("reconnect_attempts must be >= 1".to_string()));
        }

        match self.calibration_mode {
            CalibrationKind::Manual => {
                if self.manual_idc > self.idc_bits || self.manual_idf > self.idf_bits {
                    return Err(Error::Config(format!(
                        "manual tap idc={} idf={} exceeds the {}+{} bit fields",
                        self.manual_idc, self.manual_idf, self.idc_bits, self.idf_bits
                    )));
                }
            }
            CalibrationKind::FromFile => match &self.calibration_file {
                Some(path) if path.is_file() => {}
                Some(path) => {
                    return Err(Error::Config(format!(
                        "calibration_file {} does not exist",
                        path.display()
                    )))
                }
                None => {
                    return Err(Error::Config(
                        "calibration_mode from_file requires calibration_file".to_string(),
                    ))
                }
            },
            _ => {}
        }

        Ok(())
    }

    pub fn key_block(&self) -> Result<Block> {
        parse_block(&self.key).map_err(|e| Error::Config(format!("key: {}", e)))
    }

    pub fn plaintext_block(&self) -> Result<Block> {
        parse_block(&self.plaintext).map_err(|e| Error::Config(format!("plaintext: {}", e)))
    }

    pub fn fixed_plaintext_block(&self) -> Result<Block> {
        parse_block(&self.fixed_plaintext).map_err(|e| Error::Config(format!("fixed_plaintext: {}", e)))
    }

    pub fn calibration_layout(&self) -> CalibrationLayout {
        CalibrationLayout {
            idc_bits: self.idc_bits,
            idf_bits: self.idf_bits,
        }
    }

    pub fn calibration_mode(&self) -> Result<CalibrationMode> {
        Ok(match self.calibration_mode {
            CalibrationKind::Skip => CalibrationMode::Skip,
            CalibrationKind::Manual => CalibrationMode::Manual(DelayTap::new(self.manual_idc, self.manual_idf)),
            CalibrationKind::FromFile => match &self.calibration_file {
                Some(path) => CalibrationMode::FromFile(path.clone()),
                None => {
                    return Err(Error::Config(
                        "calibration_mode from_file requires calibration_file".to_string(),
                    ))
                }
            },
            CalibrationKind::Coarse => CalibrationMode::Coarse,
            CalibrationKind::CoarseFine => CalibrationMode::CoarseFine,
        })
    }

    /// Where search results are persisted
    pub fn calibration_output(&self) -> PathBuf {
        self.dump_path.join(CALIBRATION_FILE)
    }

    pub fn search_params(&self) -> Result<SearchParams> {
        Ok(SearchParams {
            layout: self.calibration_layout(),
            sensor_width: self.sensor_width,
            repeats: self.calibration_repeats,
            weight_floor: self.weight_floor,
            fine_margin: self.fine_margin,
            stride: if self.legacy_sample_stride {
                SampleStride::Overlapping
            } else {
                SampleStride::Exact
            },
            stimulus: Stimulus {
                key: self.key_block()?,
                plaintext: self.plaintext_block()?,
            },
            max_failures: self.reconnect_attempts.saturating_mul(self.max_retries_per_trace),
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let key_mode = match self.key_mode {
            KeyPolicy::Constant => KeyMode::Constant(self.key_block()?),
            KeyPolicy::Random => KeyMode::Random,
        };
        let plaintext_mode = match self.plaintext_mode {
            PlaintextPolicy::Constant => PlaintextMode::Constant,
            PlaintextPolicy::Chained => PlaintextMode::Chained,
            PlaintextPolicy::Ttest => PlaintextMode::TTest {
                fixed: self.fixed_plaintext_block()?,
            },
        };
        Ok(SessionConfig {
            num_traces: self.num_traces,
            key_mode,
            plaintext_mode,
            initial_plaintext: self.plaintext_block()?,
            mask_count: self.mask_count,
            max_retries_per_trace: self.max_retries_per_trace,
            progress_every: self.progress_every,
        })
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            dir: self.dump_path.clone(),
            num_traces: self.num_traces,
            mask_count: self.mask_count,
            format: self.trace_format,
            dump_signal: self.dump_signal,
            sensor_width: self.sensor_width,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.reconnect_attempts,
            initial_backoff: self.reconnect_backoff(),
            ..RetryPolicy::default()
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn stream_board_config(&self) -> StreamBoardConfig {
        StreamBoardConfig {
            samples: self.samples_per_trace,
            sample_bytes: self.sample_bytes,
            frequency_mode: self.frequency_mode,
            ..StreamBoardConfig::default()
        }
    }

    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            layout: self.calibration_layout(),
            samples: self.samples_per_trace,
            sample_bytes: self.sample_bytes,
            ..SimConfig::default()
        }
    }
}

// Default value functions
fn default_device_path() -> PathBuf {
    PathBuf::from("/dev/ttyUSB0")
}

fn default_num_traces() -> u64 {
    1000
}

fn default_key() -> String {
    "7d266aecb153b4d5d6b171a58136605b".to_string()
}

fn default_plaintext() -> String {
    "00000000000000000000000000000000".to_string()
}

fn default_fixed_plaintext() -> String {
    "da39a3ee5e6b4b0d3255bfef95601890".to_string()
}

fn default_sensors() -> usize {
    1
}

fn default_samples_per_trace() -> usize {
    256
}

fn default_sample_bytes() -> usize {
    16
}

fn default_sensor_width() -> u32 {
    128
}

fn default_idc_bits() -> u32 {
    32
}

fn default_idf_bits() -> u32 {
    96
}

fn default_calibration_repeats() -> u32 {
    10
}

fn default_weight_floor() -> u32 {
    32
}

fn default_fine_margin() -> u32 {
    20
}

fn default_max_retries_per_trace() -> u32 {
    10
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_backoff_ms() -> u64 {
    100
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("traces")
}

fn default_progress_every() -> u64 {
    1000
}
