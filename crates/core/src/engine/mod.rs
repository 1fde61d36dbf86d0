//! Synchronized generation/acquisition engine.
//!
//! [`ScanEngine`] owns the hardware streams and sequences their lifecycle.
//! The real-time work happens in [`ScanCore`], which the backend calls back
//! into every refresh buffer: once to refill the mirror output and once to
//! drain the detector input into a [`Frame`].

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendError, BackendResult, DaqBackend, DeviceInfo, InputFillHandler, InputStream,
    InputStreamSpec, OutputDrainHandler, OutputStream, OutputStreamSpec, SampleReader,
    SampleWriter, StartTrigger,
};
use crate::config::{ScanConfig, VoltageRange};
use crate::frame::{reassemble, Frame, FrameLog, FrameStack};
use crate::params::{ParameterStore, ScanParameters};
use crate::sink::FrameSink;
use crate::timing::DerivedTiming;
use crate::waveform::synthesize;
use crate::{Result, ScanError};

/// Lifecycle of the hardware session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No hardware resources allocated.
    Idle,
    /// Streams allocated and primed, not started.
    Configured,
    Running,
    /// Streaming halted, streams still allocated.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State shared with the backend's callback thread.
pub struct ScanCore {
    sample_rate: f64,
    output_range: VoltageRange,
    write_timeout: Duration,
    read_timeout: Option<Duration>,
    params: ParameterStore,
    /// Samples per channel per refresh the streams were configured with.
    refresh_samples: AtomicUsize,
    read_buffer: Mutex<Vec<Vec<f64>>>,
    frames: Mutex<FrameLog>,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    refills: AtomicU64,
    acquisitions: AtomicU64,
    fault: Mutex<Option<ScanError>>,
}

impl ScanCore {
    fn new(config: &ScanConfig) -> Result<Self> {
        Ok(Self {
            sample_rate: config.device.sample_rate,
            output_range: config.output.range,
            write_timeout: Duration::from_secs_f64(config.write_timeout_secs),
            read_timeout: config.read_timeout_secs.map(Duration::from_secs_f64),
            params: ParameterStore::new(config.scan)?,
            refresh_samples: AtomicUsize::new(0),
            read_buffer: Mutex::new(Vec::new()),
            frames: Mutex::new(FrameLog::new()),
            sink: Mutex::new(None),
            refills: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            fault: Mutex::new(None),
        })
    }

    fn timing(&self) -> Result<(Arc<ScanParameters>, DerivedTiming)> {
        let params = self.params.snapshot()?;
        let timing = DerivedTiming::compute(&params, self.sample_rate);
        Ok((params, timing))
    }

    fn check_refresh_size(&self, timing: &DerivedTiming) -> Result<usize> {
        let expected = self.refresh_samples.load(Ordering::Acquire);
        if timing.samples_per_refresh != expected {
            return Err(ScanError::ShapeMismatch {
                expected,
                actual: timing.samples_per_refresh,
            });
        }
        Ok(expected)
    }

    fn refill(&self, writer: &mut dyn SampleWriter) -> Result<()> {
        let (params, timing) = self.timing()?;
        self.check_refresh_size(&timing)?;
        let buffer = synthesize(&params, &timing, self.output_range);
        writer.write_many(&buffer.channels(), self.write_timeout)?;
        self.refills.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Queues `oversize` freshly synthesized buffers ahead of a start.
    fn prime(&self, output: &mut dyn OutputStream, oversize: usize) -> Result<()> {
        let (params, timing) = self.timing()?;
        self.check_refresh_size(&timing)?;
        let buffer = synthesize(&params, &timing, self.output_range);
        for _ in 0..oversize {
            output.write_many(&buffer.channels(), self.write_timeout)?;
        }
        Ok(())
    }

    fn acquire(&self, reader: &mut dyn SampleReader, samples: usize) -> Result<()> {
        let (_, timing) = self.timing()?;
        let index = self.acquisitions.load(Ordering::Acquire);

        let frames = {
            let mut buffers = lock(&self.read_buffer, "input buffer")?;
            reader.read_many(&mut buffers, samples, self.read_timeout)?;
            buffers
                .iter()
                .enumerate()
                .map(|(channel, raw)| reassemble(raw, timing.grid, channel, index))
                .collect::<Result<Vec<_>>>()?
        };

        if let Some(sink) = lock(&self.sink, "frame sink")?.as_ref() {
            for frame in &frames {
                sink.deliver(frame);
            }
        }
        let mut log = lock(&self.frames, "frame log")?;
        for frame in frames {
            log.push(frame);
        }
        self.acquisitions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Remembers the first fault of a session and converts it for the backend.
    fn record_fault(&self, err: ScanError) -> BackendError {
        error!(%err, "scan aborted on the acquisition path");
        let reply = match &err {
            ScanError::Hardware(inner) => inner.clone(),
            other => BackendError::Handler(other.to_string()),
        };
        self.notify(&format!("fault: {err}"));
        if let Ok(mut slot) = self.fault.lock() {
            slot.get_or_insert(err);
        }
        reply
    }

    fn notify(&self, message: &str) {
        if let Ok(sink) = self.sink.lock() {
            if let Some(sink) = sink.as_ref() {
                sink.status(message);
            }
        }
    }

    fn reset_counters(&self) {
        self.refills.store(0, Ordering::Release);
        self.acquisitions.store(0, Ordering::Release);
    }
}

impl OutputDrainHandler for ScanCore {
    fn on_output_drained(&self, writer: &mut dyn SampleWriter, _samples: usize) -> BackendResult {
        self.refill(writer).map_err(|err| self.record_fault(err))
    }
}

impl InputFillHandler for ScanCore {
    fn on_input_filled(&self, reader: &mut dyn SampleReader, samples: usize) -> BackendResult {
        self.acquire(reader, samples)
            .map_err(|err| self.record_fault(err))
    }
}

impl fmt::Debug for ScanCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCore")
            .field("sample_rate", &self.sample_rate)
            .field("refresh_samples", &self.refresh_samples)
            .field("refills", &self.refills)
            .field("acquisitions", &self.acquisitions)
            .finish()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| ScanError::msg(format!("{what} has been poisoned")))
}

struct Streams {
    output: Box<dyn OutputStream>,
    input: Box<dyn InputStream>,
    timing: DerivedTiming,
}

/// Galvo scan session over a [`DaqBackend`].
///
/// State machine: `Idle -> configure -> Configured -> start -> Running ->
/// stop -> Stopped -> start -> Running ... -> close -> Idle`.
pub struct ScanEngine<B: DaqBackend> {
    backend: B,
    config: ScanConfig,
    device: DeviceInfo,
    core: Arc<ScanCore>,
    state: EngineState,
    streams: Option<Streams>,
}

impl<B: DaqBackend> ScanEngine<B> {
    pub fn new(backend: B, config: ScanConfig) -> Result<Self> {
        config.validate()?;
        let device = backend.device_info()?;
        info!(
            device = %config.device.name,
            product = %device.product_type,
            "connecting to device"
        );
        if !device.supports_rate(config.device.sample_rate) {
            return Err(ScanError::config(format!(
                "sample rate {} Hz is outside the device range [{}, {}]",
                config.device.sample_rate, device.ao_min_rate, device.ao_max_rate
            )));
        }

        let core = Arc::new(ScanCore::new(&config)?);
        Ok(Self {
            backend,
            config,
            device,
            core,
            state: EngineState::Idle,
            streams: None,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn parameters(&self) -> Result<ScanParameters> {
        Ok(*self.core.params.snapshot()?)
    }

    /// Publishes new scan parameters.
    ///
    /// Amplitude and offset changes take effect at the next buffer boundary.
    /// While running, a change that alters the pixel grid is rejected: the
    /// hardware buffers are sized for the current grid.
    pub fn set_parameters(&mut self, params: ScanParameters) -> Result<()> {
        params.validate()?;
        if self.state == EngineState::Running {
            let next = DerivedTiming::compute(&params, self.config.device.sample_rate);
            if let Some(streams) = &self.streams {
                if next.grid != streams.timing.grid {
                    return Err(ScanError::state("change the pixel grid", self.state));
                }
            }
        }
        let version = self.core.params.publish(params)?;
        debug!(version, ?params, "scan parameters updated");
        Ok(())
    }

    /// Applies `update` to a copy of the current parameters and publishes it.
    pub fn update_parameters(&mut self, update: impl FnOnce(&mut ScanParameters)) -> Result<()> {
        let mut params = self.parameters()?;
        update(&mut params);
        self.set_parameters(params)
    }

    /// Timing derived from the current parameters.
    pub fn timing(&self) -> Result<DerivedTiming> {
        Ok(self.core.timing()?.1)
    }

    pub fn fps(&self) -> Result<f64> {
        Ok(self.timing()?.fps)
    }

    pub fn pixels_y(&self) -> Result<usize> {
        Ok(self.timing()?.pixels_y())
    }

    pub fn timebase(&self) -> Result<Vec<f64>> {
        Ok(self.timing()?.timebase())
    }

    /// Allocates and primes the hardware streams. A no-op when already
    /// configured or stopped.
    pub fn configure(&mut self) -> Result<()> {
        match self.state {
            EngineState::Idle => {}
            EngineState::Configured | EngineState::Stopped => return Ok(()),
            EngineState::Running => return Err(ScanError::state("configure", self.state)),
        }

        let (_, timing) = self.core.timing()?;
        let streams = self.allocate(timing)?;
        self.streams = Some(streams);
        self.state = EngineState::Configured;
        Ok(())
    }

    fn allocate(&self, timing: DerivedTiming) -> Result<Streams> {
        let refresh = timing.samples_per_refresh;
        let oversize = self.config.buffer_oversize;
        let input_channels = self.config.input.channels.len();
        let sample_rate = self.config.device.sample_rate;

        let mut input = self.backend.create_input(&InputStreamSpec {
            channels: self.config.input_channel_names(),
            range: self.config.input.range,
            terminal: self.config.input.terminal,
            sample_rate,
            trigger: StartTrigger::OutputStart,
        })?;
        let mut output = match self.backend.create_output(&self.output_spec()) {
            Ok(output) => output,
            Err(err) => {
                release_input(input.as_mut());
                return Err(err.into());
            }
        };

        let primed = (|| -> Result<()> {
            input.set_buffer_size(refresh * input_channels * oversize)?;
            output.set_buffer_size(refresh * self.config.output.channels.len() * oversize)?;

            self.core.refresh_samples.store(refresh, Ordering::Release);
            *lock(&self.core.read_buffer, "input buffer")? =
                vec![Vec::with_capacity(refresh); input_channels];

            self.core.prime(output.as_mut(), oversize)?;

            let drain: Arc<dyn OutputDrainHandler> = self.core.clone();
            let fill: Arc<dyn InputFillHandler> = self.core.clone();
            input.register_every_n_samples(refresh, fill)?;
            output.register_every_n_samples(refresh, drain)?;
            Ok(())
        })();

        if let Err(err) = primed {
            release_input(input.as_mut());
            release_output(output.as_mut());
            return Err(err);
        }

        info!(
            samples_per_refresh = refresh,
            pixels_x = timing.grid.pixels_x,
            pixels_y = timing.grid.pixels_y,
            fps = timing.fps,
            oversize,
            "hardware streams configured"
        );
        Ok(Streams {
            output,
            input,
            timing,
        })
    }

    /// Starts streaming, configuring first if needed.
    ///
    /// The input is started before the output so that it is armed when the
    /// output issues its start trigger.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            EngineState::Running => return Err(ScanError::state("start", self.state)),
            EngineState::Idle => self.configure()?,
            EngineState::Configured => self.reallocate_if_stale()?,
            EngineState::Stopped => {
                self.reallocate_if_stale()?;
                if self.state == EngineState::Stopped {
                    self.reprime()?;
                }
            }
        }

        let Some(streams) = self.streams.as_mut() else {
            return Err(ScanError::state("start", self.state));
        };
        let started = streams
            .input
            .start()
            .and_then(|()| streams.output.start());
        if let Err(err) = started {
            error!(%err, "failed to start streaming");
            self.abort();
            return Err(err.into());
        }

        if let Ok(mut fault) = self.core.fault.lock() {
            fault.take();
        }
        self.state = EngineState::Running;
        info!("scanning");
        self.core.notify("scanning");
        Ok(())
    }

    /// Refills the output stream, emptied by the last stop, so the restarted
    /// scan begins on a buffer boundary.
    fn reprime(&mut self) -> Result<()> {
        let Some(streams) = self.streams.as_mut() else {
            return Err(ScanError::state("start", self.state));
        };
        if let Err(err) = self
            .core
            .prime(streams.output.as_mut(), self.config.buffer_oversize)
        {
            error!(%err, "failed to prime the output for restart");
            self.abort();
            return Err(err);
        }
        debug!(buffers = self.config.buffer_oversize, "output re-primed");
        Ok(())
    }

    /// Rebuilds the streams when the grid changed while they sat idle.
    fn reallocate_if_stale(&mut self) -> Result<()> {
        let current = self.timing()?;
        let stale = self
            .streams
            .as_ref()
            .is_some_and(|s| s.timing.samples_per_refresh != current.samples_per_refresh
                || s.timing.grid != current.grid);
        if stale {
            info!(
                pixels_x = current.grid.pixels_x,
                pixels_y = current.grid.pixels_y,
                "pixel grid changed; reallocating streams"
            );
            self.close()?;
            self.configure()?;
        }
        Ok(())
    }

    /// Halts both streams and resets the session counters. Resources stay
    /// allocated so the next [`start`](Self::start) is cheap; samples still
    /// queued for output are discarded and re-synthesized on restart.
    pub fn stop(&mut self) -> Result<()> {
        let mut result = Ok(());
        let running = self.state == EngineState::Running;
        if let Some(streams) = self.streams.as_mut().filter(|_| running) {
            if let Err(err) = streams.output.stop() {
                result = Err(err.into());
            }
            if let Err(err) = streams.input.stop() {
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
            self.state = EngineState::Stopped;
            info!("scan stopped");
            self.core.notify("stopped");
        }
        self.core.reset_counters();
        result
    }

    /// Releases all hardware resources. Safe from any state.
    pub fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(mut streams) = self.streams.take() {
            if self.state == EngineState::Running {
                let _ = streams.output.stop();
                let _ = streams.input.stop();
            }
            if let Err(err) = streams.input.close() {
                result = Err(err.into());
            }
            if let Err(err) = streams.output.close() {
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
            debug!("hardware streams released");
        }
        self.core.reset_counters();
        self.core.refresh_samples.store(0, Ordering::Release);
        self.state = EngineState::Idle;
        result
    }

    /// Stops and closes, swallowing errors, after a fatal fault.
    fn abort(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "error while releasing streams after a fault");
        }
        self.core.notify("stopped");
    }

    /// Surfaces any fault raised on the real-time path since the last check.
    ///
    /// A fault ends the session: the engine is closed before the error is
    /// returned.
    pub fn health_check(&mut self) -> Result<()> {
        let mut fault = lock(&self.core.fault, "fault slot")?.take();
        // handler faults were already announced by record_fault
        let reported = fault.is_some();
        if let Some(streams) = self.streams.as_mut() {
            let output_error = streams.output.take_error();
            let input_error = streams.input.take_error();
            if fault.is_none() {
                fault = output_error.or(input_error).map(ScanError::from);
            }
        }

        match fault {
            Some(err) => {
                error!(%err, state = %self.state, "closing faulted session");
                if !reported {
                    self.core.notify(&format!("fault: {err}"));
                }
                self.abort();
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Drives the mirrors to fixed voltages through a separate short-lived
    /// output session. Only allowed while idle: the scan streams reserve the
    /// output channels from configure until close.
    pub fn set_voltages(&mut self, voltages: &[f64]) -> Result<()> {
        if self.state != EngineState::Idle {
            return Err(ScanError::state("set voltages", self.state));
        }
        let channels = self.config.output.channels.len();
        if voltages.len() != channels {
            return Err(ScanError::config(format!(
                "expected {channels} voltages, got {}",
                voltages.len()
            )));
        }
        let range = self.config.output.range;
        if let Some(bad) = voltages.iter().find(|v| !range.contains(**v)) {
            return Err(ScanError::config(format!(
                "{bad} V is outside the output range [{}, {}]",
                range.min_val, range.max_val
            )));
        }

        self.backend
            .write_static(&self.output_spec(), voltages, self.core.write_timeout)?;
        info!(?voltages, "output voltages set");
        Ok(())
    }

    pub fn zero_output(&mut self) -> Result<()> {
        let zeros = vec![0.0; self.config.output.channels.len()];
        self.set_voltages(&zeros)
    }

    /// Parks the mirrors at a fixed position.
    pub fn park(&mut self, x_volts: f64, y_volts: f64) -> Result<()> {
        self.set_voltages(&[x_volts, y_volts])
    }

    pub fn set_frame_sink(&mut self, sink: impl FrameSink + 'static) -> Result<()> {
        *lock(&self.core.sink, "frame sink")? = Some(Box::new(sink));
        Ok(())
    }

    pub fn clear_frame_sink(&mut self) -> Result<()> {
        lock(&self.core.sink, "frame sink")?.take();
        Ok(())
    }

    /// Output buffers written by the drain callback since the last stop.
    pub fn refill_count(&self) -> u64 {
        self.core.refills.load(Ordering::Acquire)
    }

    /// Refresh buffers acquired since the last stop.
    pub fn acquisition_count(&self) -> u64 {
        self.core.acquisitions.load(Ordering::Acquire)
    }

    /// Copy of every frame captured so far. Not available while running.
    pub fn frames(&self) -> Result<Vec<Frame>> {
        self.ensure_not_running("read the frame log")?;
        Ok(lock(&self.core.frames, "frame log")?.frames().to_vec())
    }

    /// Frames of one input channel stacked for export.
    pub fn frame_stack(&self, channel: usize) -> Result<FrameStack> {
        self.ensure_not_running("read the frame log")?;
        lock(&self.core.frames, "frame log")?.stack(channel)
    }

    /// Moves the frame log out, leaving it empty.
    pub fn take_frames(&mut self) -> Result<FrameLog> {
        self.ensure_not_running("read the frame log")?;
        Ok(std::mem::take(&mut *lock(&self.core.frames, "frame log")?))
    }

    pub fn clear_frames(&mut self) -> Result<()> {
        self.ensure_not_running("clear the frame log")?;
        lock(&self.core.frames, "frame log")?.clear();
        Ok(())
    }

    fn ensure_not_running(&self, operation: &'static str) -> Result<()> {
        if self.state == EngineState::Running {
            Err(ScanError::state(operation, self.state))
        } else {
            Ok(())
        }
    }

    fn output_spec(&self) -> OutputStreamSpec {
        OutputStreamSpec {
            channels: self.config.output_channel_names(),
            range: self.config.output.range,
            sample_rate: self.config.device.sample_rate,
        }
    }
}

impl<B: DaqBackend> Drop for ScanEngine<B> {
    fn drop(&mut self) {
        if self.state != EngineState::Idle {
            if let Err(err) = self.close() {
                warn!(%err, "failed to release streams on drop");
            }
        }
    }
}

impl<B: DaqBackend> fmt::Debug for ScanEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanEngine")
            .field("device", &self.device.name)
            .field("state", &self.state)
            .field("core", &self.core)
            .finish()
    }
}

fn release_input(input: &mut dyn InputStream) {
    if let Err(err) = input.close() {
        warn!(%err, "failed to release input stream");
    }
}

fn release_output(output: &mut dyn OutputStream) {
    if let Err(err) = output.close() {
        warn!(%err, "failed to release output stream");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InputSource, SimClock, SimOp, SimulatedDaq, StreamDirection};
    use crate::sink::ChannelSink;

    /// 10 x 10 pixels, 100 samples per refresh at 20 kHz.
    fn small_config() -> ScanConfig {
        ScanConfig {
            scan: ScanParameters {
                x_amplitude_volts: 1.0,
                y_amplitude_volts: 1.0,
                pixels_x: 10,
                ..Default::default()
            },
            ..ScanConfig::default()
        }
    }

    fn build(daq: &SimulatedDaq) -> ScanEngine<SimulatedDaq> {
        ScanEngine::new(daq.clone(), small_config()).unwrap()
    }

    fn created(daq: &SimulatedDaq, direction: StreamDirection) -> usize {
        daq.count(|op| matches!(op, SimOp::Create { direction: d, .. } if *d == direction))
    }

    fn position(ops: &[SimOp], wanted: &SimOp) -> usize {
        ops.iter().position(|op| op == wanted).unwrap()
    }

    #[test]
    fn start_from_idle_configures_and_runs() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        assert_eq!(engine.state(), EngineState::Idle);

        engine.start().unwrap();

        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(created(&daq, StreamDirection::Output), 1);
        assert_eq!(created(&daq, StreamDirection::Input), 1);
        assert_eq!(daq.output_queue_len(), 600);
        assert!(daq.is_input_acquiring());

        let ops = daq.operations();
        assert!(ops.contains(&SimOp::BufferSize {
            direction: StreamDirection::Output,
            samples: 1_200
        }));
        assert!(ops.contains(&SimOp::BufferSize {
            direction: StreamDirection::Input,
            samples: 600
        }));
        assert!(ops.contains(&SimOp::RegisterEveryN {
            direction: StreamDirection::Input,
            samples: 100
        }));
        assert!(
            position(&ops, &SimOp::Start(StreamDirection::Input))
                < position(&ops, &SimOp::Start(StreamDirection::Output))
        );
    }

    #[test]
    fn configure_primes_without_streaming() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);

        engine.configure().unwrap();
        engine.configure().unwrap();
        engine.stop().unwrap();

        assert_eq!(engine.state(), EngineState::Configured);
        assert_eq!(daq.output_queue_len(), 600);
        assert_eq!(created(&daq, StreamDirection::Output), 1);
        assert!(!daq.is_output_running());
        assert_eq!(daq.advance(100).unwrap(), 0);
    }

    #[test]
    fn stop_keeps_resources_for_restart() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.start().unwrap();
        daq.advance(300).unwrap();
        assert_eq!(engine.refill_count(), 3);
        assert_eq!(engine.acquisition_count(), 3);

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.refill_count(), 0);
        assert_eq!(engine.acquisition_count(), 0);
        assert!(daq.is_output_allocated());

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(created(&daq, StreamDirection::Output), 1);
        assert_eq!(created(&daq, StreamDirection::Input), 1);

        daq.advance(200).unwrap();
        assert_eq!(engine.acquisition_count(), 2);
    }

    #[test]
    fn close_returns_to_idle_from_any_state() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);

        engine.configure().unwrap();
        engine.close().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!daq.is_output_allocated());

        engine.start().unwrap();
        engine.stop().unwrap();
        engine.close().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);

        engine.start().unwrap();
        engine.close().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!daq.is_output_running());
        assert_eq!(
            daq.count(|op| *op == SimOp::Close(StreamDirection::Output)),
            3
        );

        engine.close().unwrap();
    }

    #[test]
    fn starting_twice_is_a_state_error() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.start().unwrap();

        let err = engine.start().unwrap_err();
        assert!(matches!(
            err,
            ScanError::State {
                state: EngineState::Running,
                ..
            }
        ));
        assert_eq!(created(&daq, StreamDirection::Output), 1);
    }

    #[test]
    fn every_refresh_becomes_a_frame() {
        let daq = SimulatedDaq::loopback("Dev1").with_input_source(InputSource::Constant(0.25));
        let mut engine = build(&daq);
        engine.start().unwrap();
        daq.advance(500).unwrap();
        engine.stop().unwrap();

        let frames = engine.frames().unwrap();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index, i as u64);
            assert_eq!(frame.shape(), (10, 10));
            assert!(frame.data.iter().all(|v| *v == 0.25));
        }
    }

    #[test]
    fn frames_are_phase_locked_to_the_scan() {
        let config = ScanConfig {
            scan: ScanParameters {
                x_amplitude_volts: 1.0,
                y_amplitude_volts: 0.1,
                pixels_x: 100,
                ..Default::default()
            },
            ..ScanConfig::loopback_debug()
        };
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = ScanEngine::new(daq.clone(), config).unwrap();
        let timing = engine.timing().unwrap();
        assert_eq!(timing.samples_per_refresh, 1_000);

        engine.start().unwrap();
        daq.advance(1_000).unwrap();
        engine.stop().unwrap();

        let params = engine.parameters().unwrap();
        let drive = synthesize(&params, &timing, engine.config().output.range);
        let expected_y = reassemble(&drive.y, timing.grid, 1, 0).unwrap();

        let log = engine.take_frames().unwrap();
        let y_frame = log.channel(1).next().unwrap();
        assert_eq!(*y_frame, expected_y);

        // fast axis ramps along x between flybacks
        let x_frame = log.channel(0).next().unwrap();
        assert!(x_frame.get(56, 5).unwrap() > x_frame.get(40, 5).unwrap());
        assert!(engine.frames().unwrap().is_empty());
    }

    #[test]
    fn restart_mid_buffer_stays_phase_locked() {
        let config = ScanConfig {
            scan: ScanParameters {
                x_amplitude_volts: 1.0,
                y_amplitude_volts: 0.1,
                pixels_x: 100,
                ..Default::default()
            },
            ..ScanConfig::loopback_debug()
        };
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = ScanEngine::new(daq.clone(), config).unwrap();
        let timing = engine.timing().unwrap();

        engine.start().unwrap();
        daq.advance(1_350).unwrap();
        engine.stop().unwrap();
        assert_eq!(daq.output_queue_len(), 0);
        engine.clear_frames().unwrap();

        engine.start().unwrap();
        assert_eq!(daq.output_queue_len(), 6 * timing.samples_per_refresh);
        daq.advance(1_000).unwrap();
        engine.stop().unwrap();

        let params = engine.parameters().unwrap();
        let drive = synthesize(&params, &timing, engine.config().output.range);
        let expected_x = reassemble(&drive.x, timing.grid, 0, 0).unwrap();
        let expected_y = reassemble(&drive.y, timing.grid, 1, 0).unwrap();

        let log = engine.take_frames().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(*log.channel(0).next().unwrap(), expected_x);
        assert_eq!(*log.channel(1).next().unwrap(), expected_y);
    }

    #[test]
    fn restart_picks_up_parameters_changed_while_stopped() {
        let daq = SimulatedDaq::loopback("Dev1").with_input_source(InputSource::Constant(0.0));
        let mut engine = build(&daq);
        engine.start().unwrap();
        daq.advance(150).unwrap();
        engine.stop().unwrap();

        engine.update_parameters(|p| p.y_offset_volts = 0.5).unwrap();
        engine.start().unwrap();
        daq.advance(100).unwrap();

        assert!((daq.output_levels()[1] - 1.0).abs() < 1e-12);
        assert_eq!(created(&daq, StreamDirection::Output), 1);
    }

    #[test]
    fn live_updates_from_the_control_thread() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        let sample_rate = engine.config().device.sample_rate;
        let clock = SimClock::spawn(daq.clone(), sample_rate, Duration::from_millis(2));
        engine.start().unwrap();

        for step in 0..50u32 {
            let scale = 0.5 + f64::from(step % 10) * 0.1;
            engine
                .update_parameters(|p| {
                    p.x_amplitude_volts = scale;
                    p.y_amplitude_volts = scale;
                    p.x_offset_volts = 0.2 * scale - 0.15;
                    p.y_offset_volts = 0.15 - 0.2 * scale;
                })
                .unwrap();
            engine.health_check().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.acquisition_count() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }

        engine.health_check().unwrap();
        assert!(engine.refill_count() > 0);
        assert!(engine.acquisition_count() >= 3);
        engine.stop().unwrap();
        clock.stop();

        let frames = engine.frames().unwrap();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.shape() == (10, 10)));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn oversized_grid_is_a_configuration_error() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);

        let err = engine
            .update_parameters(|p| {
                p.pixels_x = 1_000_000;
                p.x_amplitude_volts = 1e-12;
                p.y_amplitude_volts = 10.0;
            })
            .unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
        assert_eq!(engine.pixels_y().unwrap(), 10);
    }

    #[test]
    fn frame_log_is_locked_while_running() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.start().unwrap();
        daq.advance(100).unwrap();

        assert!(matches!(engine.frames(), Err(ScanError::State { .. })));
        assert!(engine.clear_frames().is_err());
        assert!(engine.frame_stack(0).is_err());

        engine.stop().unwrap();
        assert_eq!(engine.frame_stack(0).unwrap().frames.len(), 1);
        engine.clear_frames().unwrap();
        assert!(engine.frames().unwrap().is_empty());
    }

    #[test]
    fn set_voltages_rejected_while_running() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.start().unwrap();
        let queued = daq.output_queue_len();

        let err = engine.set_voltages(&[0.0, 0.0]).unwrap_err();
        assert!(matches!(err, ScanError::State { .. }));
        assert!(engine.zero_output().is_err());
        assert_eq!(daq.static_levels(), None);
        assert_eq!(daq.output_queue_len(), queued);
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn zero_and_park_when_not_scanning() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);

        engine.zero_output().unwrap();
        assert_eq!(daq.static_levels(), Some(vec![0.0, 0.0]));

        engine.park(1.0, -1.0).unwrap();
        assert_eq!(daq.static_levels(), Some(vec![1.0, -1.0]));

        assert!(matches!(
            engine.park(8.0, 8.0),
            Err(ScanError::Configuration(_))
        ));
        assert!(matches!(
            engine.set_voltages(&[0.0]),
            Err(ScanError::Configuration(_))
        ));
        assert_eq!(daq.static_levels(), Some(vec![1.0, -1.0]));

        engine.start().unwrap();
        engine.stop().unwrap();
        assert!(matches!(
            engine.zero_output(),
            Err(ScanError::State {
                state: EngineState::Stopped,
                ..
            })
        ));
        engine.close().unwrap();
        engine.zero_output().unwrap();
        assert_eq!(daq.static_levels(), Some(vec![0.0, 0.0]));
    }

    #[test]
    fn set_voltages_waits_for_the_streams_to_close() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.configure().unwrap();

        assert!(engine.park(0.5, 0.5).is_err());
        assert_eq!(daq.static_levels(), None);

        engine.close().unwrap();
        engine.park(0.5, 0.5).unwrap();
        assert_eq!(daq.static_levels(), Some(vec![0.5, 0.5]));
    }

    #[test]
    fn pixel_grid_is_frozen_while_running() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.start().unwrap();

        let err = engine
            .update_parameters(|p| p.pixels_x = 20)
            .unwrap_err();
        assert!(matches!(err, ScanError::State { .. }));
        assert!(engine.update_parameters(|p| p.y_amplitude_volts = 2.0).is_err());
        assert!(engine
            .update_parameters(|p| p.x_amplitude_volts = 0.0)
            .is_err());
        assert_eq!(engine.parameters().unwrap().pixels_x, 10);

        engine
            .update_parameters(|p| {
                p.x_offset_volts = 0.5;
                p.y_offset_volts = -0.5;
            })
            .unwrap();
        assert_eq!(engine.parameters().unwrap().x_offset_volts, 0.5);
    }

    #[test]
    fn grid_change_while_stopped_reallocates() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.start().unwrap();
        engine.stop().unwrap();

        engine.update_parameters(|p| p.pixels_x = 20).unwrap();
        assert_eq!(engine.pixels_y().unwrap(), 20);
        engine.start().unwrap();

        assert_eq!(created(&daq, StreamDirection::Output), 2);
        assert!(daq.operations().contains(&SimOp::RegisterEveryN {
            direction: StreamDirection::Output,
            samples: 400
        }));
        daq.advance(400).unwrap();
        assert_eq!(engine.acquisition_count(), 1);
    }

    #[test]
    fn live_offset_lands_on_next_buffer() {
        let daq = SimulatedDaq::loopback("Dev1").with_input_source(InputSource::Constant(0.0));
        let mut engine = build(&daq);
        engine.start().unwrap();
        engine.update_parameters(|p| p.y_offset_volts = 0.5).unwrap();

        // six primed buffers drain first, then the first refill
        daq.advance(600).unwrap();
        assert!((daq.output_levels()[1] - 0.5).abs() < 1e-12);
        daq.advance(100).unwrap();
        assert!((daq.output_levels()[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hardware_fault_closes_the_session() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        let (sink, _frames) = ChannelSink::bounded(8);
        let (sink, status) = sink.with_status(8);
        engine.set_frame_sink(sink).unwrap();
        engine.start().unwrap();

        daq.inject_fault(BackendError::Underrun);
        assert!(daq.advance(10).is_err());
        assert!(!daq.is_output_running());

        let err = engine.health_check().unwrap_err();
        assert!(matches!(err, ScanError::Hardware(BackendError::Underrun)));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!daq.is_output_allocated());

        let messages: Vec<String> = status.try_iter().collect();
        assert_eq!(
            messages,
            vec![
                "scanning".to_string(),
                "fault: hardware fault: output buffer underrun".to_string(),
                "stopped".to_string(),
            ]
        );
        engine.health_check().unwrap();
    }

    #[test]
    fn stale_refresh_size_aborts_on_the_callback() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        engine.start().unwrap();
        engine.core.refresh_samples.store(50, Ordering::Release);

        assert!(matches!(daq.advance(100), Err(BackendError::Handler(_))));

        let err = engine.health_check().unwrap_err();
        assert!(matches!(
            err,
            ScanError::ShapeMismatch {
                expected: 50,
                actual: 100
            }
        ));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn sink_receives_frames_and_status() {
        let daq = SimulatedDaq::loopback("Dev1");
        let mut engine = build(&daq);
        let (sink, frames) = ChannelSink::bounded(16);
        let (sink, status) = sink.with_status(16);
        engine.set_frame_sink(sink).unwrap();

        engine.start().unwrap();
        daq.advance(200).unwrap();
        engine.stop().unwrap();

        let received: Vec<Frame> = frames.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].index, 1);
        assert_eq!(status.try_recv().unwrap(), "scanning");
        assert_eq!(status.try_recv().unwrap(), "stopped");

        engine.clear_frame_sink().unwrap();
        engine.start().unwrap();
        daq.advance(100).unwrap();
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn derived_values_follow_parameters() {
        let daq = SimulatedDaq::loopback("Dev1");
        let engine = ScanEngine::new(daq, ScanConfig::default()).unwrap();

        assert_eq!(engine.pixels_y().unwrap(), 50);
        assert!((engine.fps().unwrap() - 4.0).abs() < 1e-12);
        assert_eq!(engine.timebase().unwrap().len(), 5_000);
    }

    #[test]
    fn rejects_sample_rate_outside_device_limits() {
        let daq = SimulatedDaq::new(
            DeviceInfo {
                name: "Dev1".to_string(),
                product_type: "Slow DAQ".to_string(),
                ao_min_rate: 100.0,
                ao_max_rate: 10_000.0,
            },
            InputSource::Loopback,
        );
        let err = ScanEngine::new(daq, ScanConfig::default()).unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }
}
