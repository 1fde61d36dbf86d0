//! Galvo drive waveform synthesis.
//!
//! One call to [`synthesize`] produces exactly one refresh buffer for the X
//! (fast) and Y (slow) mirrors. Nothing is carried over between calls, so a
//! parameter change lands on the next buffer boundary.

use crate::{config::VoltageRange, timing::DerivedTiming, ScanParameters};

/// Width of the smoothing kernel applied to the fast-axis slope, in samples.
pub const FLYBACK_SIGMA: f64 = 10.0;

/// Kernel radius in standard deviations.
const KERNEL_TRUNCATE: f64 = 4.0;

/// One refresh worth of mirror drive samples, channel-major.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputBuffer {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl OutputBuffer {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Channel slices in output channel order (X first).
    pub fn channels(&self) -> [&[f64]; 2] {
        [&self.x, &self.y]
    }

    /// Samples as `(x, y)` pairs in time order.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }
}

/// Builds the next output buffer from the current scan parameters.
///
/// The fast axis is a sawtooth with one period per pixel row. Its slope is
/// smoothed with a Gaussian before being integrated back into a position, so
/// the flyback is a band-limited step the mirror can follow. The slow axis
/// is a single linear ramp across the whole buffer. Both channels are clipped
/// to `range`.
pub fn synthesize(
    params: &ScanParameters,
    timing: &DerivedTiming,
    range: VoltageRange,
) -> OutputBuffer {
    let len = timing.samples_per_refresh;
    let row_period = timing.grid.row_period().max(1);

    let ramp: Vec<f64> = (0..len)
        .map(|i| ((i + 1) % row_period) as f64 / row_period as f64)
        .collect();
    let slope: Vec<f64> = ramp.windows(2).map(|w| w[1] - w[0]).collect();
    let smoothed = gaussian_filter(&slope, FLYBACK_SIGMA);

    let mut x = Vec::with_capacity(len);
    let mut position = 0.0;
    if len > 0 {
        x.push(position);
    }
    for step in smoothed {
        position += step;
        x.push(position);
    }
    for value in &mut x {
        *value = range.clip((*value - 0.5) * params.x_amplitude_volts + params.x_offset_volts);
    }

    let y_start = params.y_offset_volts - params.y_amplitude_volts / 2.0;
    let y_stop = params.y_offset_volts + params.y_amplitude_volts / 2.0;
    let y = linspace(y_start, y_stop, len)
        .map(|value| range.clip(value))
        .collect();

    OutputBuffer { x, y }
}

/// Evenly spaced values from `start` to `stop` inclusive.
fn linspace(start: f64, stop: f64, count: usize) -> impl Iterator<Item = f64> {
    let step = if count > 1 {
        (stop - start) / (count - 1) as f64
    } else {
        0.0
    };
    (0..count).map(move |i| {
        if count > 1 && i == count - 1 {
            stop
        } else {
            start + step * i as f64
        }
    })
}

/// 1-D Gaussian smoothing with mirrored edges (`d c b a | a b c d | d c b a`).
pub fn gaussian_filter(input: &[f64], sigma: f64) -> Vec<f64> {
    if input.is_empty() {
        return Vec::new();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let len = input.len() as isize;

    (0..len)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, weight)| weight * input[reflect_index(i + k as isize - radius, len)])
                .sum()
        })
        .collect()
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (KERNEL_TRUNCATE * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|offset| (-0.5 * (offset as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

fn reflect_index(index: isize, len: isize) -> usize {
    let period = 2 * len;
    let folded = index.rem_euclid(period);
    if folded < len {
        folded as usize
    } else {
        (period - 1 - folded) as usize
    }
}
