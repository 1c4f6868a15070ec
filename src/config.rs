//! Configuration loading using Figment
//!
//! Settings are layered, lowest to highest precedence:
//! 1. Compiled defaults ([`Settings::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `PPSPEC_`, nested keys split on `__`
//!
//! ```text
//! PPSPEC_APPLICATION__LOG_LEVEL=debug
//! PPSPEC_SAFETY__MAX_BIAS_ATTEMPTS=20
//! PPSPEC_LOCKIN__ADDRESS=169.254.11.17
//! ```
//!
//! Durations are written in humantime form (`"10ms"`, `"1s"`).

use crate::error::{AppResult, PpError};
use crate::waveform::WaveformConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub awg: AwgConfig,
    pub lockin: LockInConfig,
    pub stm: StmConfig,
    pub waveform: WaveformConfig,
    pub timing: TimingConfig,
    pub safety: SafetyConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// trace, debug, info, warn or error. `RUST_LOG` overrides it.
    pub log_level: String,
    /// Where CSV results are written.
    pub data_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "ppspec".to_string(),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// How the AWG is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwgTransport {
    /// VISA resource string (USB/GPIB/LXI); needs `instrument_visa`.
    Visa,
    /// Raw SCPI socket.
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwgConfig {
    pub transport: AwgTransport,
    pub resource: String,
    pub address: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Wait after `*RST`.
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
}

impl Default for AwgConfig {
    fn default() -> Self {
        Self {
            transport: AwgTransport::Visa,
            resource: "USB0::0x0957::0x5707::MY53805152::0::INSTR".to_string(),
            address: "127.0.0.1".to_string(),
            port: 5025,
            timeout: Duration::from_secs(5),
            reset_settle: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockInConfig {
    pub address: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Appended to every command.
    pub terminator: String,
    /// End-of-reply marker; unset means one socket read is one reply.
    pub reply_terminator: Option<String>,
    /// Amplitude-modulation frequency applied to the probe channel.
    pub reference_frequency_hz: f64,
    /// Command returning the in-phase (X) reading.
    pub read_command: String,
    /// Sent in order by `default_configuration`.
    pub setup_commands: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
    #[serde(with = "humantime_serde")]
    pub command_spacing: Duration,
}

impl Default for LockInConfig {
    fn default() -> Self {
        Self {
            address: "169.254.11.17".to_string(),
            port: 50_000,
            timeout: Duration::from_secs(2),
            terminator: "\n".to_string(),
            reply_terminator: None,
            reference_frequency_hz: 1007.0,
            read_command: "X.".to_string(),
            setup_commands: crate::instrument::signal_recovery_7265::DEFAULT_SETUP
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reset_settle: Duration::from_secs(3),
            command_spacing: Duration::from_millis(200),
        }
    }
}

/// Supported STM controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StmModel {
    RhkR9,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StmConfig {
    pub model: StmModel,
    pub address: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub terminator: String,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            model: StmModel::RhkR9,
            address: "127.0.0.1".to_string(),
            port: 12600,
            timeout: Duration::from_secs(2),
            terminator: "\n".to_string(),
        }
    }
}

/// Fixed settle intervals of the run protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// After each sweep step, before the lock-in is read.
    #[serde(with = "humantime_serde")]
    pub sample_settle: Duration,
    /// Between the throwaway lock-in query and the first sample.
    #[serde(with = "humantime_serde")]
    pub flush_settle: Duration,
    /// After tip control changes.
    #[serde(with = "humantime_serde")]
    pub tip_settle: Duration,
    /// Between a bias request and its readback.
    #[serde(with = "humantime_serde")]
    pub bias_readback: Duration,
    /// After a bias has been confirmed.
    #[serde(with = "humantime_serde")]
    pub bias_settle: Duration,
    /// After the AWG output is closed, before the bias is restored.
    #[serde(with = "humantime_serde")]
    pub restore_settle: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sample_settle: Duration::from_millis(10),
            flush_settle: Duration::from_millis(200),
            tip_settle: Duration::from_secs(1),
            bias_readback: Duration::from_millis(100),
            bias_settle: Duration::from_secs(1),
            restore_settle: Duration::from_secs(1),
        }
    }
}

impl TimingConfig {
    /// No waiting at all; for simulated instruments.
    pub fn immediate() -> Self {
        Self {
            sample_settle: Duration::ZERO,
            flush_settle: Duration::ZERO,
            tip_settle: Duration::ZERO,
            bias_readback: Duration::ZERO,
            bias_settle: Duration::ZERO,
            restore_settle: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Bias (volts) held while the AWG drives the tip.
    pub bias_minimum: f64,
    /// Largest readback deviation accepted as confirmation.
    pub bias_tolerance: f64,
    /// Set-and-read attempts before the bias is declared unconfirmed.
    pub max_bias_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub bias_retry_delay: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            bias_minimum: 0.01,
            bias_tolerance: 1e-6,
            max_bias_attempts: 50,
            bias_retry_delay: Duration::from_millis(100),
        }
    }
}

/// What the queue does after an experiment fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop; remaining experiments stay queued.
    #[default]
    Abort,
    /// Drop the failed experiment and carry on with the next one.
    SkipAndContinue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub on_failure: FailurePolicy,
}

impl Settings {
    /// Loads defaults, then `path` (if any), then `PPSPEC_` environment
    /// variables, and validates the result.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(PpError::Configuration(format!(
                    "Configuration file '{}' not found",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("PPSPEC_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values the run protocol cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(PpError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(self.waveform.sample_rate_hz > 0.0) {
            return Err(PpError::Configuration(format!(
                "waveform.sample_rate_hz must be positive, got {}",
                self.waveform.sample_rate_hz
            )));
        }
        if self.waveform.min_arb_length == 0 {
            return Err(PpError::Configuration(
                "waveform.min_arb_length must be at least 1".to_string(),
            ));
        }
        if self.waveform.max_arb_length < self.waveform.min_arb_length {
            return Err(PpError::Configuration(format!(
                "waveform.max_arb_length ({}) is below min_arb_length ({})",
                self.waveform.max_arb_length, self.waveform.min_arb_length
            )));
        }
        if self.waveform.min_rise_time < 0.0 || self.waveform.min_width < 0.0 {
            return Err(PpError::Configuration(
                "waveform minimum rise time and width cannot be negative".to_string(),
            ));
        }

        if !(self.lockin.reference_frequency_hz > 0.0) {
            return Err(PpError::Configuration(format!(
                "lockin.reference_frequency_hz must be positive, got {}",
                self.lockin.reference_frequency_hz
            )));
        }
        if self.lockin.read_command.trim().is_empty() {
            return Err(PpError::Configuration(
                "lockin.read_command cannot be empty".to_string(),
            ));
        }

        if self.awg.transport == AwgTransport::Visa && self.awg.resource.trim().is_empty() {
            return Err(PpError::Configuration(
                "awg.resource is required when awg.transport = \"visa\"".to_string(),
            ));
        }

        if self.safety.max_bias_attempts == 0 {
            return Err(PpError::Configuration(
                "safety.max_bias_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.safety.bias_tolerance >= 0.0) {
            return Err(PpError::Configuration(format!(
                "safety.bias_tolerance cannot be negative, got {}",
                self.safety.bias_tolerance
            )));
        }

        Ok(())
    }
}
