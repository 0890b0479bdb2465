//! Configuration management for the event recorder.
//!
//! The raw document is loaded with the `config` crate from files and
//! environment variables, then validated into typed [`Settings`] before any
//! background work starts.

use crate::endpoint::ServerEndpoint;
use crate::reporter::{ReportFields, VideoUrlField};
use crate::retention::RetentionPolicy;
use crate::trigger::{Thresholds, TriggerRules};
use crate::type_resolver::TypePolicy;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Main configuration for the recorder service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Trigger and recording configuration
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Alarm report configuration
    #[serde(default)]
    pub report: ReportConfig,

    /// Storage retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Enable Prometheus metrics export
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
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

/// Consecutive-frame threshold: one value for all classes, or per class.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MinTriggerFrames {
    Global(i64),
    PerClass(HashMap<String, i64>),
}

/// Trigger and recording configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Storage root for videos and snapshots
    #[serde(default)]
    pub save_dir: String,
    /// Segment length in seconds (minimum 1)
    #[serde(default = "default_record_seconds")]
    pub record_seconds: i64,
    /// Classes that may trigger a recording (empty = any)
    #[serde(default)]
    pub trigger_classes: Vec<i32>,
    /// Consecutive frames required before a class fires
    #[serde(default)]
    pub min_trigger_frames: Option<MinTriggerFrames>,
    /// Per-channel input queue size
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Encoder executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Encoder video codec
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
}

/// Report `type` setting: a fixed value, a class map, or a marker string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeSetting {
    Fixed(i64),
    Mapped(HashMap<String, i64>),
    Named(String),
}

/// Alarm report configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Alarm endpoint (empty = reporting disabled)
    #[serde(default)]
    pub server_url: String,
    /// Base URL for published files (empty = absolute paths)
    #[serde(default)]
    pub base_file_url: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_ip: String,
    #[serde(default)]
    pub safety_id: String,
    #[serde(default)]
    pub safety_name: String,
    #[serde(default)]
    pub warning: String,
    /// How the reported type is derived
    #[serde(default, rename = "type")]
    pub type_setting: Option<TypeSetting>,
    /// Payload field that carries the video URL (safetyUrl or brakeUrl)
    #[serde(default = "default_video_url_field")]
    pub video_url_field: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Storage retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Delete media older than this many days (0 = disabled)
    #[serde(default)]
    pub retention_days: i64,
    /// Delete oldest media above this total size in GB (0 = disabled)
    #[serde(default)]
    pub retention_max_gb: f64,
    /// Seconds between cleanup passes (minimum 30)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

// Default value functions
fn default_service_name() -> String {
    "event-recorder".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_record_seconds() -> i64 {
    10
}
fn default_queue_size() -> usize {
    64
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_video_codec() -> String {
    "libx264".to_string()
}
fn default_video_url_field() -> String {
    "safetyUrl".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_cleanup_interval() -> u64 {
    300
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
            enable_metrics: true,
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

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            save_dir: String::new(),
            record_seconds: default_record_seconds(),
            trigger_classes: Vec::new(),
            min_trigger_frames: None,
            queue_size: default_queue_size(),
            ffmpeg_path: default_ffmpeg_path(),
            video_codec: default_video_codec(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            base_file_url: String::new(),
            device_id: String::new(),
            device_ip: String::new(),
            safety_id: String::new(),
            safety_name: String::new(),
            warning: String::new(),
            type_setting: None,
            video_url_field: default_video_url_field(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 0,
            retention_max_gb: 0.0,
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Validated recorder settings.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub save_dir: PathBuf,
    pub record_duration: Duration,
    pub trigger: TriggerRules,
    pub type_policy: TypePolicy,
    pub queue_size: usize,
    pub ffmpeg_path: PathBuf,
    pub video_codec: String,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::new(),
            record_duration: Duration::from_secs(default_record_seconds() as u64),
            trigger: TriggerRules::default(),
            type_policy: TypePolicy::Unset,
            queue_size: default_queue_size(),
            ffmpeg_path: PathBuf::from(default_ffmpeg_path()),
            video_codec: default_video_codec(),
        }
    }
}

/// Validated report settings.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub endpoint: Option<ServerEndpoint>,
    pub base_file_url: Option<String>,
    pub fields: ReportFields,
    pub video_field: VideoUrlField,
    pub request_timeout: Duration,
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub recorder: RecorderSettings,
    pub report: ReportSettings,
    /// Present only when at least one retention rule is enabled
    pub retention: Option<RetentionPolicy>,
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. System config (/etc/event-recorder/recorder.toml)
    /// 4. Environment variables (prefixed with RECORDER__)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = ConfigBuilder::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(File::with_name("/etc/event-recorder/recorder").required(false))
            // RECORDER__RECORDER__SAVE_DIR -> recorder.save_dir
            .add_source(
                Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration and convert it into typed settings.
    pub fn validate(&self) -> Result<Settings, ConfigValidationError> {
        let save_dir = self.recorder.save_dir.trim();
        if save_dir.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "recorder.save_dir".to_string(),
            ));
        }
        let save_dir = PathBuf::from(save_dir);

        if self.recorder.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recorder.queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        let endpoint = match self.report.server_url.trim() {
            "" => {
                warn!("No report.server_url configured, alarms will not be sent");
                None
            }
            url => Some(ServerEndpoint::parse(url).map_err(|e| {
                ConfigValidationError::InvalidValue {
                    field: "report.server_url".to_string(),
                    message: e.to_string(),
                }
            })?),
        };

        let record_seconds = self.recorder.record_seconds.max(1) as u64;

        let recorder = RecorderSettings {
            save_dir: save_dir.clone(),
            record_duration: Duration::from_secs(record_seconds),
            trigger: TriggerRules::new(
                self.recorder.trigger_classes.iter().copied(),
                self.thresholds(),
            ),
            type_policy: self.type_policy()?,
            queue_size: self.recorder.queue_size,
            ffmpeg_path: PathBuf::from(&self.recorder.ffmpeg_path),
            video_codec: self.recorder.video_codec.clone(),
        };

        let report = ReportSettings {
            endpoint,
            base_file_url: Some(self.report.base_file_url.trim().to_string())
                .filter(|u| !u.is_empty()),
            fields: ReportFields {
                device_id: self.report.device_id.clone(),
                device_ip: self.report.device_ip.clone(),
                safety_id: self.report.safety_id.clone(),
                safety_name: self.report.safety_name.clone(),
                warning: self.report.warning.clone(),
            },
            video_field: VideoUrlField::from_name(&self.report.video_url_field),
            request_timeout: Duration::from_secs(self.report.request_timeout_secs.max(1)),
        };

        let policy = RetentionPolicy::new(
            self.retention_days()?,
            self.retention_max_bytes()?,
            Duration::from_secs(self.retention.cleanup_interval_seconds),
        );

        Ok(Settings {
            service: self.service.clone(),
            logging: self.logging.clone(),
            recorder,
            report,
            retention: Some(policy).filter(RetentionPolicy::is_enabled),
        })
    }

    fn thresholds(&self) -> Thresholds {
        match &self.recorder.min_trigger_frames {
            None => Thresholds::default(),
            Some(MinTriggerFrames::Global(frames)) => Thresholds::new(clamp_frames(*frames)),
            Some(MinTriggerFrames::PerClass(map)) => {
                let mut thresholds = Thresholds::default();
                for (key, frames) in map {
                    match key.trim().parse::<i32>() {
                        Ok(class_id) => {
                            thresholds = thresholds.with_class(class_id, clamp_frames(*frames));
                        }
                        Err(_) => warn!(key = %key, "Ignoring non-numeric class in min_trigger_frames"),
                    }
                }
                thresholds
            }
        }
    }

    fn type_policy(&self) -> Result<TypePolicy, ConfigValidationError> {
        let policy = match &self.report.type_setting {
            None => TypePolicy::Unset,
            Some(TypeSetting::Fixed(value)) => TypePolicy::Fixed(report_type(*value)?),
            Some(TypeSetting::Mapped(map)) => {
                let mut mapping = HashMap::new();
                for (key, value) in map {
                    match key.trim().parse::<i32>() {
                        Ok(class_id) => {
                            mapping.insert(class_id, report_type(*value)?);
                        }
                        Err(_) => warn!(key = %key, "Ignoring non-numeric class in type map"),
                    }
                }
                if mapping.is_empty() {
                    TypePolicy::Unset
                } else {
                    TypePolicy::Mapped(mapping)
                }
            }
            Some(TypeSetting::Named(name)) => match name.as_str() {
                "class_id" | "classid" | "label" => TypePolicy::ClassId,
                other => {
                    warn!(value = other, "Unsupported report.type value, using class id");
                    TypePolicy::Unset
                }
            },
        };
        Ok(policy)
    }

    fn retention_days(&self) -> Result<u32, ConfigValidationError> {
        u32::try_from(self.retention.retention_days.max(0)).map_err(|_| {
            ConfigValidationError::InvalidValue {
                field: "retention.retention_days".to_string(),
                message: format!("{} is out of range", self.retention.retention_days),
            }
        })
    }

    fn retention_max_bytes(&self) -> Result<u64, ConfigValidationError> {
        let gb = self.retention.retention_max_gb;
        let bytes = gb.max(0.0) * BYTES_PER_GB;
        if !gb.is_finite() || bytes >= u64::MAX as f64 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retention.retention_max_gb".to_string(),
                message: format!("{gb} is out of range"),
            });
        }
        Ok(bytes as u64)
    }
}

fn report_type(value: i64) -> Result<i32, ConfigValidationError> {
    i32::try_from(value).map_err(|_| ConfigValidationError::InvalidValue {
        field: "report.type".to_string(),
        message: format!("{value} does not fit a 32-bit type code"),
    })
}

fn clamp_frames(frames: i64) -> u32 {
    frames.clamp(1, u32::MAX as i64) as u32
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
