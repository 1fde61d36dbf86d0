//! Hardware I/O backend trait: the only vendor-specific boundary of the engine.
//!
//! A backend hands out one continuously clocked analog output stream for the
//! mirrors and one analog input stream for the detector. The engine sizes their
//! buffers, pre-fills the output, and registers "every N samples" handlers. The
//! backend owns the thread those handlers run on.
//!
//! Contract for implementations:
//! - handlers for one stream are never invoked concurrently with each other;
//! - a handler returning an error halts streaming on that backend, and the
//!   error is reported again through [`OutputStream::take_error`] /
//!   [`InputStream::take_error`];
//! - an input stream created with [`StartTrigger::OutputStart`] acquires its
//!   first sample on the same clock edge as the output's first sample.

pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{TerminalConfig, VoltageRange};

pub use sim::{InputSource, SimClock, SimOp, SimulatedDaq, StreamDirection};

/// Result type for backend operations.
pub type BackendResult<T = ()> = Result<T, BackendError>;

/// Error from a backend operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("output buffer underrun")]
    Underrun,
    #[error("input buffer overrun")]
    Overrun,
    #[error("resource unavailable: {0}")]
    Resource(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("callback failed: {0}")]
    Handler(String),
}

/// Static description of the connected device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub product_type: String,
    pub ao_min_rate: f64,
    pub ao_max_rate: f64,
}

impl DeviceInfo {
    pub fn supports_rate(&self, sample_rate: f64) -> bool {
        (self.ao_min_rate..=self.ao_max_rate).contains(&sample_rate)
    }
}

/// How an input stream begins acquiring once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    Immediate,
    /// Wait for the output stream's start trigger.
    OutputStart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputStreamSpec {
    pub channels: Vec<String>,
    pub range: VoltageRange,
    pub sample_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputStreamSpec {
    pub channels: Vec<String>,
    pub range: VoltageRange,
    pub terminal: TerminalConfig,
    pub sample_rate: f64,
    pub trigger: StartTrigger,
}

/// Blocking multi-channel write into an output buffer.
pub trait SampleWriter {
    /// Queues one slice per channel, all of equal length. Returns the number
    /// of samples per channel written.
    fn write_many(&mut self, channels: &[&[f64]], timeout: Duration) -> BackendResult<usize>;
}

/// Blocking multi-channel read out of an input buffer.
pub trait SampleReader {
    /// Fills `buffers` (one per channel) with exactly `count` samples each.
    /// `None` waits indefinitely.
    fn read_many(
        &mut self,
        buffers: &mut [Vec<f64>],
        count: usize,
        timeout: Option<Duration>,
    ) -> BackendResult<usize>;
}

/// Invoked every time the registered number of samples has left the output
/// buffer.
pub trait OutputDrainHandler: Send + Sync {
    fn on_output_drained(&self, writer: &mut dyn SampleWriter, samples: usize) -> BackendResult;
}

/// Invoked every time the registered number of samples has been acquired into
/// the input buffer.
pub trait InputFillHandler: Send + Sync {
    fn on_input_filled(&self, reader: &mut dyn SampleReader, samples: usize) -> BackendResult;
}

pub trait OutputStream: SampleWriter + Send {
    /// Total buffer capacity in samples across all channels.
    fn set_buffer_size(&mut self, samples: usize) -> BackendResult;
    fn register_every_n_samples(
        &mut self,
        samples: usize,
        handler: Arc<dyn OutputDrainHandler>,
    ) -> BackendResult;
    fn start(&mut self) -> BackendResult;
    /// Halts generation and discards every sample still queued, so the next
    /// start plays only what is written after this call.
    fn stop(&mut self) -> BackendResult;
    fn close(&mut self) -> BackendResult;
    /// Error that halted the stream since the last call, if any.
    fn take_error(&mut self) -> Option<BackendError>;
}

pub trait InputStream: Send {
    fn set_buffer_size(&mut self, samples: usize) -> BackendResult;
    fn register_every_n_samples(
        &mut self,
        samples: usize,
        handler: Arc<dyn InputFillHandler>,
    ) -> BackendResult;
    fn start(&mut self) -> BackendResult;
    fn stop(&mut self) -> BackendResult;
    fn close(&mut self) -> BackendResult;
    fn take_error(&mut self) -> Option<BackendError>;
}

/// Factory for device streams.
pub trait DaqBackend: Send {
    fn device_info(&self) -> BackendResult<DeviceInfo>;

    fn create_output(&self, spec: &OutputStreamSpec) -> BackendResult<Box<dyn OutputStream>>;

    fn create_input(&self, spec: &InputStreamSpec) -> BackendResult<Box<dyn InputStream>>;

    /// Drives the output channels to fixed levels through a short-lived
    /// session of its own, returning once the values are applied. Fails with
    /// [`BackendError::Resource`] while an output stream holds the channels.
    fn write_static(
        &self,
        spec: &OutputStreamSpec,
        voltages: &[f64],
        timeout: Duration,
    ) -> BackendResult;
}
