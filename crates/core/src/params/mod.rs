use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use serde::{Deserialize, Serialize};

use crate::timing::{PixelGrid, MAX_FRAME_SAMPLES};
use crate::{Result, ScanError};

/// Operator-tunable scan geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    pub x_amplitude_volts: f64,
    pub x_offset_volts: f64,
    pub y_amplitude_volts: f64,
    pub y_offset_volts: f64,
    pub pixels_x: usize,
    pub samples_per_pixel: usize,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            x_amplitude_volts: 2.0,
            x_offset_volts: 0.0,
            y_amplitude_volts: 1.0,
            y_offset_volts: 0.0,
            pixels_x: 100,
            samples_per_pixel: 1,
        }
    }
}

impl ScanParameters {
    /// Checks the invariants the timing model relies on.
    pub fn validate(&self) -> Result<()> {
        if !(self.x_amplitude_volts.is_finite() && self.x_amplitude_volts > 0.0) {
            return Err(ScanError::config(format!(
                "x amplitude must be positive, got {}",
                self.x_amplitude_volts
            )));
        }
        if !(self.y_amplitude_volts.is_finite() && self.y_amplitude_volts > 0.0) {
            return Err(ScanError::config(format!(
                "y amplitude must be positive, got {}",
                self.y_amplitude_volts
            )));
        }
        if !self.x_offset_volts.is_finite() || !self.y_offset_volts.is_finite() {
            return Err(ScanError::config("offsets must be finite"));
        }
        if self.pixels_x == 0 {
            return Err(ScanError::config("pixels_x must be at least 1"));
        }
        if self.samples_per_pixel == 0 {
            return Err(ScanError::config("samples_per_pixel must be at least 1"));
        }
        let grid = PixelGrid::for_parameters(self);
        match grid.checked_sample_count() {
            Some(samples) if samples <= MAX_FRAME_SAMPLES => Ok(()),
            _ => Err(ScanError::config(format!(
                "{} x {} pixels at {} samples per pixel exceeds {MAX_FRAME_SAMPLES} samples per frame",
                grid.pixels_x, grid.pixels_y, grid.samples_per_pixel
            ))),
        }
    }
}

/// Single-writer, multi-reader snapshot of the live [`ScanParameters`].
///
/// Writers replace the whole parameter set at once, so readers on the
/// hardware callback thread always see an internally consistent value. The
/// version counter lets callers tell whether anything changed between two
/// checkpoints.
#[derive(Debug)]
pub struct ParameterStore {
    current: RwLock<Arc<ScanParameters>>,
    version: AtomicU64,
}

impl ParameterStore {
    pub fn new(params: ScanParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(params)),
            version: AtomicU64::new(0),
        })
    }

    /// Returns the latest published parameters.
    pub fn snapshot(&self) -> Result<Arc<ScanParameters>> {
        let guard = self
            .current
            .read()
            .map_err(|_| ScanError::msg("scan parameters have been poisoned"))?;
        Ok(Arc::clone(&guard))
    }

    /// Validates and publishes a new parameter set, returning its version.
    pub fn publish(&self, params: ScanParameters) -> Result<u64> {
        params.validate()?;
        let mut guard = self
            .current
            .write()
            .map_err(|_| ScanError::msg("scan parameters have been poisoned"))?;
        *guard = Arc::new(params);
        Ok(self.version.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}
