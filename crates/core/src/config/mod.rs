use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, ScanError, ScanParameters};

/// Top-level configuration structure for a scanning session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub device: DeviceConfig,
    pub output: OutputConfig,
    pub input: InputConfig,
    /// How many refresh buffers fit in the hardware buffers.
    pub buffer_oversize: usize,
    pub write_timeout_secs: f64,
    /// `None` waits indefinitely for input samples.
    pub read_timeout_secs: Option<f64>,
    /// Parameters the engine starts with before the operator changes them.
    pub scan: ScanParameters,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            output: OutputConfig::default(),
            input: InputConfig::default(),
            buffer_oversize: 6,
            write_timeout_secs: 5.0,
            read_timeout_secs: None,
            scan: ScanParameters::default(),
        }
    }
}

impl ScanConfig {
    /// Preset that digitizes the output channels themselves, for checking the
    /// drive waveforms without a detector.
    pub fn loopback_debug() -> Self {
        Self {
            input: InputConfig {
                channels: vec!["_ao0_vs_aognd".to_string(), "_ao1_vs_aognd".to_string()],
                range: VoltageRange::new(-5.0, 5.0),
                terminal: TerminalConfig::BalancedDifferential,
            },
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.device.sample_rate.is_finite() && self.device.sample_rate > 0.0) {
            return Err(ScanError::config(format!(
                "sample rate must be positive, got {}",
                self.device.sample_rate
            )));
        }
        if self.output.channels.len() != 2 {
            return Err(ScanError::config(format!(
                "expected X and Y output channels, got {}",
                self.output.channels.len()
            )));
        }
        if self.input.channels.is_empty() {
            return Err(ScanError::config("at least one input channel is required"));
        }
        self.output.range.validate("output")?;
        self.input.range.validate("input")?;
        if self.buffer_oversize == 0 {
            return Err(ScanError::config("buffer oversize must be at least 1"));
        }
        if !(self.write_timeout_secs.is_finite() && self.write_timeout_secs > 0.0) {
            return Err(ScanError::config("write timeout must be positive"));
        }
        if let Some(timeout) = self.read_timeout_secs {
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(ScanError::config("read timeout must be positive"));
            }
        }
        self.scan.validate()
    }

    /// Fully qualified physical channel names for the output stream.
    pub fn output_channel_names(&self) -> Vec<String> {
        self.device.qualify(&self.output.channels)
    }

    pub fn input_channel_names(&self) -> Vec<String> {
        self.device.qualify(&self.input.channels)
    }
}

/// Device selection and sample clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub sample_rate: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Dev1".to_string(),
            sample_rate: 20_000.0,
        }
    }
}

impl DeviceConfig {
    fn qualify(&self, channels: &[String]) -> Vec<String> {
        channels
            .iter()
            .map(|ch| format!("{}/{}", self.name, ch.trim_start_matches('/')))
            .collect()
    }
}

/// Mirror drive channels, X first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub channels: Vec<String>,
    pub range: VoltageRange,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            channels: vec!["ao0".to_string(), "ao1".to_string()],
            range: VoltageRange::new(-3.0, 3.0),
        }
    }
}

/// Detector channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub channels: Vec<String>,
    pub range: VoltageRange,
    pub terminal: TerminalConfig,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            channels: vec!["ai0".to_string()],
            range: VoltageRange::new(-10.0, 10.0),
            terminal: TerminalConfig::Rse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalConfig {
    /// Referenced single-ended.
    Rse,
    BalancedDifferential,
}

/// Inclusive voltage bounds of a channel group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    pub min_val: f64,
    pub max_val: f64,
}

impl VoltageRange {
    pub const fn new(min_val: f64, max_val: f64) -> Self {
        Self { min_val, max_val }
    }

    pub fn clip(&self, value: f64) -> f64 {
        value.clamp(self.min_val, self.max_val)
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min_val..=self.max_val).contains(&value)
    }

    fn validate(&self, label: &str) -> Result<()> {
        if !(self.min_val.is_finite() && self.max_val.is_finite() && self.min_val < self.max_val) {
            return Err(ScanError::config(format!(
                "{label} range [{}, {}] is not a valid interval",
                self.min_val, self.max_val
            )));
        }
        Ok(())
    }
}
