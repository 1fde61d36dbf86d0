use serde::{Deserialize, Serialize};

use crate::{timing::PixelGrid, Result, ScanError};

/// One reassembled image from a single input channel.
///
/// Orientation: the frame has `pixels_x` rows and `pixels_y` columns, so
/// `get(x, y)` is the pixel at fast-axis position `x` on slow-axis line `y`.
/// Samples arrive X-fastest, which makes the raw stream the column-major
/// flattening of this grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Input channel the samples came from.
    pub channel: usize,
    /// Acquisition counter value when the frame was captured.
    pub index: u64,
    pub pixels_x: usize,
    pub pixels_y: usize,
    /// Row-major pixel values, `pixels_x * pixels_y` long.
    pub data: Vec<f32>,
}

impl Frame {
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x < self.pixels_x && y < self.pixels_y {
            Some(self.data[x * self.pixels_y + y])
        } else {
            None
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.pixels_x, self.pixels_y)
    }

    /// The frame as a nested `[x][y]` grid.
    pub fn rows(&self) -> Vec<Vec<f32>> {
        self.data
            .chunks(self.pixels_y.max(1))
            .map(|row| row.to_vec())
            .collect()
    }

    /// Inverse of [`reassemble`] for frames with one sample per pixel: pixel
    /// values in the order the scan visited them.
    pub fn to_scan_order(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.data.len());
        for y in 0..self.pixels_y {
            for x in 0..self.pixels_x {
                out.push(self.data[x * self.pixels_y + y]);
            }
        }
        out
    }
}

/// Reshapes one refresh worth of raw samples into a [`Frame`].
///
/// With more than one sample per pixel the consecutive samples of a pixel are
/// averaged. The raw length must match the grid exactly.
pub fn reassemble(raw: &[f64], grid: PixelGrid, channel: usize, index: u64) -> Result<Frame> {
    let expected = grid.sample_count();
    if raw.len() != expected {
        return Err(ScanError::ShapeMismatch {
            expected,
            actual: raw.len(),
        });
    }

    let spp = grid.samples_per_pixel.max(1);
    let mut data = vec![0.0_f32; grid.pixel_count()];
    for (scan_index, samples) in raw.chunks_exact(spp).enumerate() {
        let x = scan_index % grid.pixels_x;
        let y = scan_index / grid.pixels_x;
        let mean = samples.iter().sum::<f64>() / spp as f64;
        data[x * grid.pixels_y + y] = mean as f32;
    }

    Ok(Frame {
        channel,
        index,
        pixels_x: grid.pixels_x,
        pixels_y: grid.pixels_y,
        data,
    })
}

/// Ordered, append-only record of every frame captured in a session.
#[derive(Debug, Clone, Default)]
pub struct FrameLog {
    frames: Vec<Frame>,
}

impl FrameLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Frames captured from one input channel, oldest first.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = &Frame> {
        self.frames.iter().filter(move |f| f.channel == channel)
    }

    /// Stacks one channel into a uniform image sequence for export.
    ///
    /// Fails if the channel holds frames of different shapes.
    pub fn stack(&self, channel: usize) -> Result<FrameStack> {
        let mut frames = self.channel(channel);
        let Some(first) = frames.next() else {
            return Ok(FrameStack {
                channel,
                pixels_x: 0,
                pixels_y: 0,
                frames: Vec::new(),
            });
        };

        let mut stack = FrameStack {
            channel,
            pixels_x: first.pixels_x,
            pixels_y: first.pixels_y,
            frames: vec![first.rows()],
        };
        for frame in frames {
            if frame.shape() != first.shape() {
                return Err(ScanError::config(format!(
                    "frame {} on channel {channel} is {}x{}, expected {}x{}",
                    frame.index, frame.pixels_x, frame.pixels_y, first.pixels_x, first.pixels_y
                )));
            }
            stack.frames.push(frame.rows());
        }
        Ok(stack)
    }
}

/// Uniformly shaped frames of one channel, `frames[n][x][y]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStack {
    pub channel: usize,
    pub pixels_x: usize,
    pub pixels_y: usize,
    pub frames: Vec<Vec<Vec<f32>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(pixels_x: usize, pixels_y: usize, samples_per_pixel: usize) -> PixelGrid {
        PixelGrid {
            pixels_x,
            pixels_y,
            samples_per_pixel,
        }
    }

    #[test]
    fn reassembly_is_a_permutation() {
        let raw: Vec<f64> = (0..12).map(f64::from).collect();
        let frame = reassemble(&raw, grid(4, 3, 1), 0, 0).unwrap();

        let restored: Vec<f64> = frame.to_scan_order().into_iter().map(f64::from).collect();
        assert_eq!(restored, raw);
    }

    #[test]
    fn fast_axis_runs_along_rows_of_first_index() {
        let raw: Vec<f64> = (0..6).map(f64::from).collect();
        let frame = reassemble(&raw, grid(3, 2, 1), 0, 0).unwrap();

        // first scan line is y = 0
        assert_eq!(frame.get(0, 0), Some(0.0));
        assert_eq!(frame.get(2, 0), Some(2.0));
        assert_eq!(frame.get(0, 1), Some(3.0));
        assert_eq!(frame.get(3, 0), None);
        assert_eq!(frame.rows(), vec![vec![0.0, 3.0], vec![1.0, 4.0], vec![2.0, 5.0]]);
    }

    #[test]
    fn averages_samples_within_a_pixel() {
        let raw = [1.0, 3.0, 5.0, 7.0, 0.0, 2.0, 4.0, 4.0];
        let frame = reassemble(&raw, grid(2, 2, 2), 1, 9).unwrap();

        assert_eq!(frame.channel, 1);
        assert_eq!(frame.index, 9);
        assert_eq!(frame.get(0, 0), Some(2.0));
        assert_eq!(frame.get(1, 0), Some(6.0));
        assert_eq!(frame.get(0, 1), Some(1.0));
        assert_eq!(frame.get(1, 1), Some(4.0));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let raw = vec![0.0; 10];
        let err = reassemble(&raw, grid(4, 3, 1), 0, 0).unwrap_err();
        assert!(matches!(
            err,
            ScanError::ShapeMismatch {
                expected: 12,
                actual: 10
            }
        ));
    }

    #[test]
    fn stack_keeps_channel_order() {
        let mut log = FrameLog::new();
        for index in 0..3 {
            for channel in 0..2 {
                let raw = vec![(index * 10 + channel) as f64; 4];
                log.push(reassemble(&raw, grid(2, 2, 1), channel, index as u64).unwrap());
            }
        }

        let stack = log.stack(1).unwrap();
        assert_eq!(stack.frames.len(), 3);
        assert_eq!(stack.frames[2][0][0], 21.0);
        assert_eq!((stack.pixels_x, stack.pixels_y), (2, 2));
        assert_eq!(log.latest().map(|f| f.channel), Some(1));
    }

    #[test]
    fn stack_rejects_mixed_shapes() {
        let mut log = FrameLog::new();
        log.push(reassemble(&[0.0; 4], grid(2, 2, 1), 0, 0).unwrap());
        log.push(reassemble(&[0.0; 6], grid(3, 2, 1), 0, 1).unwrap());

        assert!(log.stack(0).is_err());
        assert!(log.stack(1).unwrap().frames.is_empty());
    }
}
