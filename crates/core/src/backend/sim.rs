//! Software DAQ used for tests and for running the engine without hardware.
//!
//! The sample clock only advances when [`SimulatedDaq::advance`] is called,
//! either directly (deterministic tests) or from a [`SimClock`] thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    BackendError, BackendResult, DaqBackend, DeviceInfo, InputFillHandler, InputStream,
    InputStreamSpec, OutputDrainHandler, OutputStream, OutputStreamSpec, SampleReader,
    SampleWriter, StartTrigger,
};
use crate::config::VoltageRange;

/// Per-channel capacity used until a stream's buffer size is configured.
const DEFAULT_BUFFER_SAMPLES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Output,
    Input,
}

/// Operations recorded by the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    Create {
        direction: StreamDirection,
        channels: Vec<String>,
    },
    BufferSize {
        direction: StreamDirection,
        samples: usize,
    },
    RegisterEveryN {
        direction: StreamDirection,
        samples: usize,
    },
    Start(StreamDirection),
    Stop(StreamDirection),
    Close(StreamDirection),
    StaticWrite(Vec<f64>),
}

/// What the simulated input channels digitize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputSource {
    /// Input channel `n` reads output channel `n` (modulo the output count).
    Loopback,
    Constant(f64),
}

struct OutputState {
    id: u64,
    channels: usize,
    capacity: usize,
    queues: Vec<VecDeque<f64>>,
    handler: Option<(usize, Arc<dyn OutputDrainHandler>)>,
    since_event: usize,
    running: bool,
    error: Option<BackendError>,
    levels: Vec<f64>,
}

impl OutputState {
    fn queued(&self) -> usize {
        self.queues.first().map_or(0, VecDeque::len)
    }
}

impl SampleWriter for OutputState {
    fn write_many(&mut self, channels: &[&[f64]], _timeout: Duration) -> BackendResult<usize> {
        if channels.len() != self.channels {
            return Err(BackendError::Device(format!(
                "expected {} output channels, got {}",
                self.channels,
                channels.len()
            )));
        }
        let count = channels.first().map_or(0, |c| c.len());
        if channels.iter().any(|c| c.len() != count) {
            return Err(BackendError::Device(
                "output channel slices differ in length".to_string(),
            ));
        }
        // A real device would block here until space frees up; the simulated
        // clock cannot advance while we hold the lock, so this is a timeout.
        if self.queued() + count > self.capacity {
            return Err(BackendError::Timeout { operation: "write" });
        }
        for (queue, data) in self.queues.iter_mut().zip(channels) {
            queue.extend(data.iter().copied());
        }
        Ok(count)
    }
}

struct InputState {
    id: u64,
    channels: usize,
    capacity: usize,
    range: VoltageRange,
    trigger: StartTrigger,
    queues: Vec<VecDeque<f64>>,
    handler: Option<(usize, Arc<dyn InputFillHandler>)>,
    since_event: usize,
    armed: bool,
    acquiring: bool,
    error: Option<BackendError>,
}

impl InputState {
    fn queued(&self) -> usize {
        self.queues.first().map_or(0, VecDeque::len)
    }
}

impl SampleReader for InputState {
    fn read_many(
        &mut self,
        buffers: &mut [Vec<f64>],
        count: usize,
        _timeout: Option<Duration>,
    ) -> BackendResult<usize> {
        if buffers.len() != self.channels {
            return Err(BackendError::Device(format!(
                "expected {} input buffers, got {}",
                self.channels,
                buffers.len()
            )));
        }
        if self.queued() < count {
            return Err(BackendError::Timeout { operation: "read" });
        }
        for (buffer, queue) in buffers.iter_mut().zip(&mut self.queues) {
            buffer.clear();
            buffer.extend(queue.drain(..count));
        }
        Ok(count)
    }
}

struct SimState {
    ops: Vec<SimOp>,
    next_id: u64,
    source: InputSource,
    output: Option<OutputState>,
    input: Option<InputState>,
    pending_fault: Option<BackendError>,
    static_levels: Option<Vec<f64>>,
}

impl SimState {
    /// Clocks one sample. Returns `false` when the output is not running.
    fn tick(&mut self) -> BackendResult<bool> {
        let SimState {
            source,
            output,
            input,
            ..
        } = self;
        let Some(out) = output.as_mut().filter(|o| o.running) else {
            return Ok(false);
        };

        let mut levels = Vec::with_capacity(out.channels);
        for queue in &mut out.queues {
            levels.push(queue.pop_front().ok_or(BackendError::Underrun)?);
        }
        out.levels = levels;

        if let Some(inp) = input.as_mut().filter(|i| i.acquiring) {
            for (channel, queue) in inp.queues.iter_mut().enumerate() {
                let value = match *source {
                    InputSource::Loopback => out.levels[channel % out.channels],
                    InputSource::Constant(value) => value,
                };
                queue.push_back(inp.range.clip(value));
            }
            if inp.queued() > inp.capacity {
                return Err(BackendError::Overrun);
            }
        }

        out.since_event += 1;
        if let Some((every, handler)) = out.handler.as_ref().map(|(n, h)| (*n, Arc::clone(h))) {
            if out.since_event >= every {
                out.since_event = 0;
                handler.on_output_drained(&mut *out, every)?;
            }
        }

        if let Some(inp) = input.as_mut().filter(|i| i.acquiring) {
            inp.since_event += 1;
            if let Some((every, handler)) = inp.handler.as_ref().map(|(n, h)| (*n, Arc::clone(h))) {
                if inp.since_event >= every {
                    inp.since_event = 0;
                    handler.on_input_filled(&mut *inp, every)?;
                }
            }
        }

        Ok(true)
    }

    fn halt(&mut self, err: BackendError) {
        warn!(%err, "simulated device halted streaming");
        if let Some(out) = self.output.as_mut() {
            out.running = false;
            out.error = Some(err.clone());
        }
        if let Some(inp) = self.input.as_mut() {
            inp.armed = false;
            inp.acquiring = false;
            inp.error = Some(err);
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn lock(state: &Mutex<SimState>) -> BackendResult<MutexGuard<'_, SimState>> {
    state
        .lock()
        .map_err(|_| BackendError::Device("simulated device state has been poisoned".to_string()))
}

/// In-process stand-in for an analog I/O card.
#[derive(Clone)]
pub struct SimulatedDaq {
    info: DeviceInfo,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDaq {
    pub fn new(info: DeviceInfo, source: InputSource) -> Self {
        Self {
            info,
            state: Arc::new(Mutex::new(SimState {
                ops: Vec::new(),
                next_id: 0,
                source,
                output: None,
                input: None,
                pending_fault: None,
                static_levels: None,
            })),
        }
    }

    /// Loopback device with generous rate limits.
    pub fn loopback(name: impl Into<String>) -> Self {
        Self::new(
            DeviceInfo {
                name: name.into(),
                product_type: "Simulated DAQ".to_string(),
                ao_min_rate: 1.0,
                ao_max_rate: 1_000_000.0,
            },
            InputSource::Loopback,
        )
    }

    pub fn with_input_source(self, source: InputSource) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.source = source;
        }
        self
    }

    /// Clocks up to `samples` samples through the running streams, invoking
    /// handlers as their thresholds are crossed. Returns the number clocked.
    pub fn advance(&self, samples: usize) -> BackendResult<usize> {
        let mut state = lock(&self.state)?;
        let running = state.output.as_ref().is_some_and(|o| o.running);
        if running {
            if let Some(err) = state.pending_fault.take() {
                state.halt(err.clone());
                return Err(err);
            }
        }

        let mut clocked = 0;
        for _ in 0..samples {
            match state.tick() {
                Ok(true) => clocked += 1,
                Ok(false) => break,
                Err(err) => {
                    state.halt(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(clocked)
    }

    /// Makes the next `advance` on a running output fail with `err`.
    pub fn inject_fault(&self, err: BackendError) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_fault = Some(err);
        }
    }

    pub fn operations(&self) -> Vec<SimOp> {
        self.state
            .lock()
            .map(|s| s.ops.clone())
            .unwrap_or_default()
    }

    pub fn count<F: Fn(&SimOp) -> bool>(&self, f: F) -> usize {
        self.operations().iter().filter(|op| f(op)).count()
    }

    pub fn is_output_allocated(&self) -> bool {
        self.state.lock().is_ok_and(|s| s.output.is_some())
    }

    pub fn is_output_running(&self) -> bool {
        self.state
            .lock()
            .is_ok_and(|s| s.output.as_ref().is_some_and(|o| o.running))
    }

    pub fn is_input_acquiring(&self) -> bool {
        self.state
            .lock()
            .is_ok_and(|s| s.input.as_ref().is_some_and(|i| i.acquiring))
    }

    /// Samples per channel waiting in the output buffer.
    pub fn output_queue_len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.output.as_ref().map_or(0, OutputState::queued))
            .unwrap_or(0)
    }

    /// Levels of the most recently generated output sample.
    pub fn output_levels(&self) -> Vec<f64> {
        self.state
            .lock()
            .map(|s| s.output.as_ref().map(|o| o.levels.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Values of the last static write, if any.
    pub fn static_levels(&self) -> Option<Vec<f64>> {
        self.state.lock().ok().and_then(|s| s.static_levels.clone())
    }
}

impl std::fmt::Debug for SimulatedDaq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDaq")
            .field("info", &self.info)
            .finish()
    }
}

impl DaqBackend for SimulatedDaq {
    fn device_info(&self) -> BackendResult<DeviceInfo> {
        Ok(self.info.clone())
    }

    fn create_output(&self, spec: &OutputStreamSpec) -> BackendResult<Box<dyn OutputStream>> {
        if spec.channels.is_empty() {
            return Err(BackendError::Device("no output channels requested".to_string()));
        }
        let mut state = lock(&self.state)?;
        if state.output.is_some() {
            return Err(BackendError::Resource(
                "output channels are already reserved".to_string(),
            ));
        }
        let id = state.next_id();
        let channels = spec.channels.len();
        state.output = Some(OutputState {
            id,
            channels,
            capacity: DEFAULT_BUFFER_SAMPLES,
            queues: vec![VecDeque::new(); channels],
            handler: None,
            since_event: 0,
            running: false,
            error: None,
            levels: vec![0.0; channels],
        });
        state.ops.push(SimOp::Create {
            direction: StreamDirection::Output,
            channels: spec.channels.clone(),
        });
        debug!(channels = ?spec.channels, "simulated output stream created");
        Ok(Box::new(SimOutputStream {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    fn create_input(&self, spec: &InputStreamSpec) -> BackendResult<Box<dyn InputStream>> {
        if spec.channels.is_empty() {
            return Err(BackendError::Device("no input channels requested".to_string()));
        }
        let mut state = lock(&self.state)?;
        if state.input.is_some() {
            return Err(BackendError::Resource(
                "input channels are already reserved".to_string(),
            ));
        }
        let id = state.next_id();
        let channels = spec.channels.len();
        state.input = Some(InputState {
            id,
            channels,
            capacity: DEFAULT_BUFFER_SAMPLES,
            range: spec.range,
            trigger: spec.trigger,
            queues: vec![VecDeque::new(); channels],
            handler: None,
            since_event: 0,
            armed: false,
            acquiring: false,
            error: None,
        });
        state.ops.push(SimOp::Create {
            direction: StreamDirection::Input,
            channels: spec.channels.clone(),
        });
        debug!(channels = ?spec.channels, "simulated input stream created");
        Ok(Box::new(SimInputStream {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    fn write_static(
        &self,
        spec: &OutputStreamSpec,
        voltages: &[f64],
        _timeout: Duration,
    ) -> BackendResult {
        if voltages.len() != spec.channels.len() {
            return Err(BackendError::Device(format!(
                "expected {} voltages, got {}",
                spec.channels.len(),
                voltages.len()
            )));
        }
        let mut state = lock(&self.state)?;
        if state.output.is_some() {
            return Err(BackendError::Resource(
                "output channels are reserved by a streaming task".to_string(),
            ));
        }
        state.ops.push(SimOp::StaticWrite(voltages.to_vec()));
        state.static_levels = Some(voltages.to_vec());
        Ok(())
    }
}

struct SimOutputStream {
    id: u64,
    state: Arc<Mutex<SimState>>,
}

impl SimOutputStream {
    fn with<R>(
        &self,
        f: impl FnOnce(&mut OutputState, &mut Option<InputState>, &mut Vec<SimOp>) -> BackendResult<R>,
    ) -> BackendResult<R> {
        let mut guard = lock(&self.state)?;
        let SimState {
            output, input, ops, ..
        } = &mut *guard;
        let out = output
            .as_mut()
            .filter(|o| o.id == self.id)
            .ok_or_else(|| BackendError::Resource("output stream has been closed".to_string()))?;
        f(out, input, ops)
    }
}

impl SampleWriter for SimOutputStream {
    fn write_many(&mut self, channels: &[&[f64]], timeout: Duration) -> BackendResult<usize> {
        self.with(|out, _, _| out.write_many(channels, timeout))
    }
}

impl OutputStream for SimOutputStream {
    fn set_buffer_size(&mut self, samples: usize) -> BackendResult {
        self.with(|out, _, ops| {
            out.capacity = (samples / out.channels).max(1);
            ops.push(SimOp::BufferSize {
                direction: StreamDirection::Output,
                samples,
            });
            Ok(())
        })
    }

    fn register_every_n_samples(
        &mut self,
        samples: usize,
        handler: Arc<dyn OutputDrainHandler>,
    ) -> BackendResult {
        if samples == 0 {
            return Err(BackendError::Device("event interval must be positive".to_string()));
        }
        self.with(|out, _, ops| {
            out.handler = Some((samples, handler));
            ops.push(SimOp::RegisterEveryN {
                direction: StreamDirection::Output,
                samples,
            });
            Ok(())
        })
    }

    fn start(&mut self) -> BackendResult {
        self.with(|out, input, ops| {
            if out.queued() == 0 {
                return Err(BackendError::Device(
                    "no samples written to the output buffer before start".to_string(),
                ));
            }
            out.running = true;
            out.since_event = 0;
            ops.push(SimOp::Start(StreamDirection::Output));
            if let Some(inp) = input
                .as_mut()
                .filter(|i| i.armed && i.trigger == StartTrigger::OutputStart)
            {
                inp.acquiring = true;
            }
            Ok(())
        })
    }

    fn stop(&mut self) -> BackendResult {
        self.with(|out, _, ops| {
            out.running = false;
            out.since_event = 0;
            out.queues.iter_mut().for_each(VecDeque::clear);
            ops.push(SimOp::Stop(StreamDirection::Output));
            Ok(())
        })
    }

    fn close(&mut self) -> BackendResult {
        let mut state = lock(&self.state)?;
        if state.output.as_ref().is_some_and(|o| o.id == self.id) {
            state.output = None;
            state.ops.push(SimOp::Close(StreamDirection::Output));
        }
        Ok(())
    }

    fn take_error(&mut self) -> Option<BackendError> {
        self.with(|out, _, _| Ok(out.error.take())).ok().flatten()
    }
}

struct SimInputStream {
    id: u64,
    state: Arc<Mutex<SimState>>,
}

impl SimInputStream {
    fn with<R>(
        &self,
        f: impl FnOnce(&mut InputState, &mut Vec<SimOp>) -> BackendResult<R>,
    ) -> BackendResult<R> {
        let mut guard = lock(&self.state)?;
        let SimState { input, ops, .. } = &mut *guard;
        let inp = input
            .as_mut()
            .filter(|i| i.id == self.id)
            .ok_or_else(|| BackendError::Resource("input stream has been closed".to_string()))?;
        f(inp, ops)
    }
}

impl InputStream for SimInputStream {
    fn set_buffer_size(&mut self, samples: usize) -> BackendResult {
        self.with(|inp, ops| {
            inp.capacity = (samples / inp.channels).max(1);
            ops.push(SimOp::BufferSize {
                direction: StreamDirection::Input,
                samples,
            });
            Ok(())
        })
    }

    fn register_every_n_samples(
        &mut self,
        samples: usize,
        handler: Arc<dyn InputFillHandler>,
    ) -> BackendResult {
        if samples == 0 {
            return Err(BackendError::Device("event interval must be positive".to_string()));
        }
        self.with(|inp, ops| {
            inp.handler = Some((samples, handler));
            ops.push(SimOp::RegisterEveryN {
                direction: StreamDirection::Input,
                samples,
            });
            Ok(())
        })
    }

    fn start(&mut self) -> BackendResult {
        self.with(|inp, ops| {
            inp.armed = true;
            inp.acquiring = inp.trigger == StartTrigger::Immediate;
            inp.since_event = 0;
            ops.push(SimOp::Start(StreamDirection::Input));
            Ok(())
        })
    }

    fn stop(&mut self) -> BackendResult {
        self.with(|inp, ops| {
            inp.armed = false;
            inp.acquiring = false;
            inp.since_event = 0;
            inp.queues.iter_mut().for_each(VecDeque::clear);
            ops.push(SimOp::Stop(StreamDirection::Input));
            Ok(())
        })
    }

    fn close(&mut self) -> BackendResult {
        let mut state = lock(&self.state)?;
        if state.input.as_ref().is_some_and(|i| i.id == self.id) {
            state.input = None;
            state.ops.push(SimOp::Close(StreamDirection::Input));
        }
        Ok(())
    }

    fn take_error(&mut self) -> Option<BackendError> {
        self.with(|inp, _| Ok(inp.error.take())).ok().flatten()
    }
}

/// Background thread that clocks a [`SimulatedDaq`] in real time.
pub struct SimClock {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimClock {
    /// Advances `daq` by `sample_rate * tick` samples every `tick`.
    pub fn spawn(daq: SimulatedDaq, sample_rate: f64, tick: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let samples_per_tick = ((sample_rate * tick.as_secs_f64()).round() as usize).max(1);
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(tick);
                if let Err(err) = daq.advance(samples_per_tick) {
                    warn!(%err, "simulated clock tick failed");
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("simulated clock thread panicked");
            }
        }
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}
