//! Core library for galvo-mirror laser-scanning microscopes.
//!
//! The crate synthesizes the X/Y mirror drive waveforms, digitizes the
//! detector in lock-step with them and reassembles the samples into image
//! frames. Hardware access goes through the [`DaqBackend`] trait so the
//! engine itself is vendor-agnostic; [`SimulatedDaq`] stands in for a card in
//! tests and demos.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod params;
pub mod sink;
pub mod timing;
pub mod waveform;

pub use backend::{BackendError, DaqBackend, DeviceInfo, InputSource, SimClock, SimulatedDaq};
pub use config::{DeviceConfig, InputConfig, OutputConfig, ScanConfig, TerminalConfig, VoltageRange};
pub use engine::{EngineState, ScanEngine};
pub use error::{Result, ScanError};
pub use frame::{reassemble, Frame, FrameLog, FrameStack};
pub use params::{ParameterStore, ScanParameters};
pub use sink::{CallbackSink, ChannelSink, FrameSink};
pub use timing::{DerivedTiming, PixelGrid};
pub use waveform::{synthesize, OutputBuffer};
