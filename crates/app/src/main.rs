use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use galvo_scan_core::{
    ChannelSink, InputSource, ScanConfig, ScanEngine, ScanError, SimClock, SimulatedDaq,
};
use tracing_subscriber::EnvFilter;

const CLOCK_TICK: Duration = Duration::from_millis(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> galvo_scan_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ScanConfig::from_json_file(path)?,
        None if cli.loopback => ScanConfig::loopback_debug(),
        None => ScanConfig::default(),
    };
    if let Some(device) = &cli.device {
        config.device.name = device.clone();
    }
    cli.scan.apply(&mut config)?;

    match cli.command {
        Commands::Scan { duration, output } => {
            run_scan(config, cli.loopback, duration, output.as_deref())
        }
        Commands::Timing => show_timing(config),
        Commands::Zero => open_engine(config, cli.loopback)?.zero_output(),
        Commands::Park { x, y } => open_engine(config, cli.loopback)?.park(x, y),
    }
}

fn open_engine(
    config: ScanConfig,
    loopback: bool,
) -> galvo_scan_core::Result<ScanEngine<SimulatedDaq>> {
    let daq = SimulatedDaq::loopback(config.device.name.clone());
    let daq = if loopback {
        daq
    } else {
        daq.with_input_source(InputSource::Constant(0.0))
    };
    ScanEngine::new(daq, config)
}

fn run_scan(
    config: ScanConfig,
    loopback: bool,
    duration: f64,
    output: Option<&Path>,
) -> galvo_scan_core::Result<()> {
    let sample_rate = config.device.sample_rate;
    let mut engine = open_engine(config, loopback)?;
    let timing = engine.timing()?;
    println!("# Y Pixels: {}", timing.pixels_y());
    println!("Frames per second: {:0.2}", timing.fps);

    let (sink, frames) = ChannelSink::bounded(64);
    let (sink, status) = sink.with_status(16);
    engine.set_frame_sink(sink)?;

    let clock = SimClock::spawn(engine.backend().clone(), sample_rate, CLOCK_TICK);
    engine.start()?;
    tracing::info!(duration, "scan running");

    let deadline = Instant::now() + Duration::from_secs_f64(duration);
    let mut outcome = Ok(());
    while Instant::now() < deadline {
        std::thread::sleep(POLL_INTERVAL);
        for frame in frames.try_iter() {
            tracing::debug!(index = frame.index, channel = frame.channel, "frame received");
        }
        for message in status.try_iter() {
            println!("{message}");
        }
        if let Err(err) = engine.health_check() {
            outcome = Err(err);
            break;
        }
    }

    engine.stop()?;
    clock.stop();
    for message in status.try_iter() {
        println!("{message}");
    }

    finish_scan(&mut engine, outcome, output)
}

/// Exports the frame log, then reports the session outcome. A faulted
/// session still keeps what it captured before the fault.
fn finish_scan(
    engine: &mut ScanEngine<SimulatedDaq>,
    outcome: galvo_scan_core::Result<()>,
    output: Option<&Path>,
) -> galvo_scan_core::Result<()> {
    let log = engine.take_frames()?;
    tracing::info!(frames = log.len(), "scan finished");
    if let Some(path) = output {
        export_frames(engine, &log, path)?;
    }
    outcome?;
    engine.close()
}

fn export_frames(
    engine: &ScanEngine<SimulatedDaq>,
    log: &galvo_scan_core::FrameLog,
    path: &Path,
) -> galvo_scan_core::Result<()> {
    let stacks = (0..engine.config().input.channels.len())
        .map(|channel| log.stack(channel))
        .collect::<galvo_scan_core::Result<Vec<_>>>()?;
    let file = std::fs::File::create(path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), &stacks)?;
    tracing::info!(?path, channels = stacks.len(), "frame stacks written");
    Ok(())
}

fn show_timing(config: ScanConfig) -> galvo_scan_core::Result<()> {
    let timing = galvo_scan_core::DerivedTiming::compute(&config.scan, config.device.sample_rate);
    println!("# Y Pixels: {}", timing.pixels_y());
    println!("Frames per second: {:0.2}", timing.fps);
    println!("Samples per refresh: {}", timing.samples_per_refresh);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Galvo scan control", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Device name, overriding the configuration.
    #[arg(short, long, global = true)]
    device: Option<String>,
    /// Digitize the output channels instead of the detector.
    #[arg(long, global = true)]
    loopback: bool,
    #[command(flatten)]
    scan: ScanArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Live-tunable scan parameters; unset values keep the configured ones.
#[derive(Args, Debug)]
struct ScanArgs {
    /// X amplitude (V).
    #[arg(long, global = true)]
    x_amp: Option<f64>,
    /// X offset (V).
    #[arg(long, global = true, allow_negative_numbers = true)]
    x_offset: Option<f64>,
    /// Y amplitude (V).
    #[arg(long, global = true)]
    y_amp: Option<f64>,
    /// Y offset (V).
    #[arg(long, global = true, allow_negative_numbers = true)]
    y_offset: Option<f64>,
    /// Number of X pixels.
    #[arg(long, global = true)]
    pixels_x: Option<usize>,
    #[arg(long, global = true)]
    samples_per_pixel: Option<usize>,
}

impl ScanArgs {
    fn apply(&self, config: &mut ScanConfig) -> Result<(), ScanError> {
        let scan = &mut config.scan;
        if let Some(v) = self.x_amp {
            scan.x_amplitude_volts = v;
        }
        if let Some(v) = self.x_offset {
            scan.x_offset_volts = v;
        }
        if let Some(v) = self.y_amp {
            scan.y_amplitude_volts = v;
        }
        if let Some(v) = self.y_offset {
            scan.y_offset_volts = v;
        }
        if let Some(v) = self.pixels_x {
            scan.pixels_x = v;
        }
        if let Some(v) = self.samples_per_pixel {
            scan.samples_per_pixel = v;
        }
        config.validate()
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan for a fixed time and optionally save the frames.
    Scan {
        /// Seconds to scan for.
        #[arg(short = 't', long, default_value_t = 4.0)]
        duration: f64,
        /// Where to write the frame stacks as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the derived pixel grid and frame rate.
    Timing,
    /// Drive both mirrors to 0 V.
    Zero,
    /// Park the mirrors at fixed voltages.
    Park {
        #[arg(long, allow_negative_numbers = true)]
        x: f64,
        #[arg(long, allow_negative_numbers = true)]
        y: f64,
    },
}
