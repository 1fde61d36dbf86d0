use serde::{Deserialize, Serialize};

use crate::ScanParameters;

/// Largest frame, in samples per channel, the streams are sized for.
pub const MAX_FRAME_SAMPLES: usize = 1 << 24;

/// Pixel grid a refresh buffer is decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelGrid {
    pub pixels_x: usize,
    pub pixels_y: usize,
    pub samples_per_pixel: usize,
}

impl PixelGrid {
    pub fn for_parameters(params: &ScanParameters) -> Self {
        let pixels_x = params.pixels_x.max(1);
        Self {
            pixels_x,
            pixels_y: pixels_y(pixels_x, params.y_amplitude_volts, params.x_amplitude_volts),
            samples_per_pixel: params.samples_per_pixel.max(1),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels_x * self.pixels_y
    }

    /// Number of raw samples one full frame occupies per channel.
    pub fn sample_count(&self) -> usize {
        self.pixel_count() * self.samples_per_pixel
    }

    /// [`sample_count`](Self::sample_count), or `None` if it overflows.
    pub fn checked_sample_count(&self) -> Option<usize> {
        self.pixels_x
            .checked_mul(self.pixels_y)?
            .checked_mul(self.samples_per_pixel)
    }

    /// Samples spent on one fast-axis row.
    pub fn row_period(&self) -> usize {
        self.pixels_x * self.samples_per_pixel
    }
}

/// Quantities derived from [`ScanParameters`] and the fixed sample rate.
///
/// Never cached: call [`DerivedTiming::compute`] whenever the values are
/// needed so that live parameter changes are always reflected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedTiming {
    pub grid: PixelGrid,
    pub samples_per_refresh: usize,
    pub fps: f64,
    /// Seconds between consecutive samples.
    pub sample_period: f64,
}

impl DerivedTiming {
    pub fn compute(params: &ScanParameters, sample_rate: f64) -> Self {
        let grid = PixelGrid::for_parameters(params);

        // float product: unvalidated grids must not overflow here
        let samples_per_frame =
            grid.pixels_x as f64 * grid.pixels_y as f64 * grid.samples_per_pixel as f64;
        let fps = sample_rate / samples_per_frame;
        let samples_per_refresh = (sample_rate / fps).round_ties_even().max(1.0) as usize;

        Self {
            grid,
            samples_per_refresh,
            fps,
            sample_period: 1.0 / sample_rate,
        }
    }

    pub fn pixels_y(&self) -> usize {
        self.grid.pixels_y
    }

    /// Time stamp in seconds of every sample in one refresh buffer.
    pub fn timebase(&self) -> Vec<f64> {
        (0..self.samples_per_refresh)
            .map(|i| i as f64 * self.sample_period)
            .collect()
    }
}

/// Rows needed to keep pixels square for the given amplitudes.
///
/// Clamped to at least one row so a degenerate amplitude pair cannot produce
/// an empty grid or a division by zero downstream.
fn pixels_y(pixels_x: usize, y_amplitude: f64, x_amplitude: f64) -> usize {
    let rows = (pixels_x as f64 * y_amplitude / x_amplitude).round_ties_even();
    if rows.is_finite() && rows >= 1.0 {
        rows as usize
    } else {
        1
    }
}
