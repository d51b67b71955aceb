//! Configuration management for the occupancy detector.
//!
//! Configuration is loaded from `config/default.toml`, an optional
//! `config/{RUN_MODE}.toml`, and finally environment variables prefixed with
//! `DETECTOR_` (e.g. `DETECTOR__BACKEND__URL`). Every section has defaults so
//! an empty environment yields a runnable service.

use crate::classifier::ClassifierParams;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the detector service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectorConfig {
    /// Service identity and metrics
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Configuration API listener
    #[serde(default)]
    pub api: ApiConfig,

    /// Backend system of record
    #[serde(default)]
    pub backend: BackendConfig,

    /// Worker pool and adaptive frame skipping
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Video feed acquisition
    #[serde(default)]
    pub feed: FeedConfig,

    /// Spot classifier parameters
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Temporal stabilizer parameters
    #[serde(default)]
    pub stabilizer: StabilizerConfig,

    /// Debug image persistence
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Prometheus exporter port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Configuration API listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,

    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// How a sync batch is delivered to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One POST carrying every lot
    #[default]
    Batch,
    /// One POST per lot to the legacy `ml-update` endpoint
    PerLot,
}

/// Backend sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend API
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Seconds between sync batches
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Delivery mode
    #[serde(default)]
    pub mode: SyncMode,
}

/// Worker pool and adaptive skipping configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of lot workers processing concurrently
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Desired sampling rate per lot
    #[serde(default = "default_target_fps")]
    pub target_fps: f32,

    /// Upper bound on frames discarded between processed frames
    #[serde(default = "default_max_skip_factor")]
    pub max_skip_factor: u32,

    /// Number of cycles in the rolling cycle-time average
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,

    /// Fraction of the budget the average must drop under before skipping less
    #[serde(default = "default_recovery_ratio")]
    pub recovery_ratio: f64,

    /// Time allowed for workers to stop on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Video feed acquisition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Consecutive failures before a lot is reported Degraded
    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,

    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Timeout for acquiring a single frame in seconds
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: u64,
}

/// Spot classifier configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Adaptive threshold neighbourhood size (even values are bumped to odd)
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Adaptive threshold bias constant
    #[serde(default = "default_bias")]
    pub bias: i32,

    /// Median filter kernel size
    #[serde(default = "default_median_kernel")]
    pub median_kernel: u32,

    /// Number of 3x3 dilation passes
    #[serde(default = "default_dilation_iterations")]
    pub dilation_iterations: u32,

    /// Foreground pixel count at or above which a spot is occupied
    #[serde(default = "default_occupancy_pixel_threshold")]
    pub occupancy_pixel_threshold: u32,

    /// Spot width used when a region omits it
    #[serde(default = "default_spot_width")]
    pub spot_width: u32,

    /// Spot height used when a region omits it
    #[serde(default = "default_spot_height")]
    pub spot_height: u32,
}

/// Temporal stabilizer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StabilizerConfig {
    /// Consecutive disagreeing observations required to flip a spot
    #[serde(default = "default_streak_length")]
    pub streak_length: u32,
}

/// Debug image persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct DebugConfig {
    /// Write annotated frames to disk at the sync interval
    #[serde(default)]
    pub save_images: bool,

    /// Output directory for annotated frames
    #[serde(default = "default_debug_directory")]
    pub directory: String,
}

// Default value functions
fn default_service_name() -> String {
    "parkwatch-detector".to_string()
}
fn default_metrics_port() -> u16 {
    9100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8001
}
fn default_true() -> bool {
    true
}
fn default_backend_url() -> String {
    "http://localhost:8000/api".to_string()
}
fn default_sync_interval() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    5
}
fn default_max_workers() -> usize {
    4
}
fn default_target_fps() -> f32 {
    2.0
}
fn default_max_skip_factor() -> u32 {
    8
}
fn default_rolling_window() -> usize {
    10
}
fn default_recovery_ratio() -> f64 {
    0.8
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_degraded_after_failures() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_frame_timeout() -> u64 {
    10
}
fn default_block_size() -> u32 {
    25
}
fn default_bias() -> i32 {
    16
}
fn default_median_kernel() -> u32 {
    5
}
fn default_dilation_iterations() -> u32 {
    1
}
fn default_occupancy_pixel_threshold() -> u32 {
    900
}
fn default_spot_width() -> u32 {
    103
}
fn default_spot_height() -> u32 {
    43
}
fn default_streak_length() -> u32 {
    3
}
fn default_debug_directory() -> String {
    "debug_images".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            sync_interval_secs: default_sync_interval(),
            request_timeout_secs: default_request_timeout(),
            mode: SyncMode::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            target_fps: default_target_fps(),
            max_skip_factor: default_max_skip_factor(),
            rolling_window: default_rolling_window(),
            recovery_ratio: default_recovery_ratio(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            degraded_after_failures: default_degraded_after_failures(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            frame_timeout_secs: default_frame_timeout(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            bias: default_bias(),
            median_kernel: default_median_kernel(),
            dilation_iterations: default_dilation_iterations(),
            occupancy_pixel_threshold: default_occupancy_pixel_threshold(),
            spot_width: default_spot_width(),
            spot_height: default_spot_height(),
        }
    }
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            streak_length: default_streak_length(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            save_images: false,
            directory: default_debug_directory(),
        }
    }
}

impl DetectorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/default.toml`
    /// 2. `config/{RUN_MODE}.toml`
    /// 3. Environment variables (prefixed with `DETECTOR`)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // DETECTOR__SCHEDULER__MAX_WORKERS -> scheduler.max_workers
            .add_source(
                Environment::with_prefix("DETECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("DETECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.backend.url.is_empty() {
            return Err(ConfigValidationError::MissingField("backend.url".to_string()));
        }
        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "backend.url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.backend.sync_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "backend.sync_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.scheduler.max_workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.max_workers".to_string(),
                message: "Pool size must be greater than 0".to_string(),
            });
        }
        if !(self.scheduler.target_fps > 0.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.target_fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }
        if self.scheduler.rolling_window == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.rolling_window".to_string(),
                message: "Window must hold at least one cycle".to_string(),
            });
        }
        if !(self.scheduler.recovery_ratio > 0.0 && self.scheduler.recovery_ratio <= 1.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.recovery_ratio".to_string(),
                message: "Ratio must be in (0, 1]".to_string(),
            });
        }

        if self.feed.reconnect_base_delay_ms > self.feed.reconnect_max_delay_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "feed.reconnect_base_delay_ms".to_string(),
                message: "Base delay must not exceed the maximum delay".to_string(),
            });
        }
        if self.feed.frame_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "feed.frame_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        ClassifierParams::from(&self.classifier)
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: format!("classifier.{}", e.field),
                message: format!("Value {} must be within {}..={}", e.value, e.min, e.max),
            })?;

        if self.stabilizer.streak_length == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stabilizer.streak_length".to_string(),
                message: "Streak must be at least 1".to_string(),
            });
        }

        if self.debug.save_images && self.debug.directory.is_empty() {
            return Err(ConfigValidationError::MissingField("debug.directory".to_string()));
        }

        Ok(())
    }
}

impl BackendConfig {
    /// Get sync interval as Duration.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SchedulerConfig {
    /// Per-cycle processing budget implied by the target frame rate.
    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.target_fps)
    }

    /// Get shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl FeedConfig {
    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Get frame acquisition timeout as Duration.
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
