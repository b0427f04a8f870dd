use std::{
    io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use spectrum_lights_core::{
    AnsiSink, FeatureRecorder, FrameSource, LatestFrameSink, NullSink, OutputSink, Paced, Pipeline,
    PipelineConfig, PipelineDriver, Result, RunReport, ToneSource, WavSource,
};
use tracing_subscriber::EnvFilter;

/// Width of the terminal preview in character cells.
const PREVIEW_COLUMNS: usize = 72;

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Analyze {
            input,
            output,
            config,
        } => analyze(&input, &output, config.as_deref()),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&PipelineConfig::default())?);
            Ok(())
        }
        Commands::Devices => list_devices(),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    let report = if args.preview {
        let mut sink = LatestFrameSink::spawn(AnsiSink::new(io::stdout(), PREVIEW_COLUMNS))?;
        let report = drive(&args, config, &mut sink);
        let replaced = sink.replaced();
        let finished = sink.finish();
        println!();
        tracing::debug!(replaced, "preview frames replaced before display");
        finished?;
        report?
    } else {
        drive(&args, config, NullSink)?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn drive<K: OutputSink>(args: &RunArgs, mut config: PipelineConfig, sink: K) -> Result<RunReport> {
    let source = &args.source;

    if let Some(path) = &source.input {
        let wav = WavSource::open(path, config.audio.block_len)?.looping(args.looping);
        tracing::info!(
            input = %path.display(),
            sample_rate = wav.sample_rate(),
            duration_seconds = wav.duration_seconds(),
            "playing file"
        );
        config.audio.sample_rate = wav.sample_rate();
        let driver = PipelineDriver::new(&config)?;
        stop_after(&driver, args.seconds);
        return driver.run(Paced::new(wav), sink);
    }

    if let Some(frequency_hz) = source.tone {
        tracing::info!(frequency_hz, "generating test tone");
        let tone = ToneSource::new(
            config.audio.sample_rate,
            config.audio.block_len,
            frequency_hz,
            0.5,
        );
        let driver = PipelineDriver::new(&config)?;
        stop_after(&driver, args.seconds);
        return driver.run(Paced::new(tone), sink);
    }

    run_live(&config, args.device.as_deref(), args.seconds, sink)
}

#[cfg(feature = "live")]
fn run_live<K: OutputSink>(
    config: &PipelineConfig,
    device: Option<&str>,
    seconds: Option<f64>,
    sink: K,
) -> Result<RunReport> {
    let driver = PipelineDriver::new(config)?;
    let capture = spectrum_lights_core::LiveCapture::start(device, &config.audio, driver.producer())?;
    tracing::info!(device = capture.device_name(), "capturing live input");
    stop_after(&driver, seconds);

    let report = driver.consume(sink);
    drop(capture);
    report
}

#[cfg(not(feature = "live"))]
fn run_live<K: OutputSink>(
    _config: &PipelineConfig,
    _device: Option<&str>,
    _seconds: Option<f64>,
    _sink: K,
) -> Result<RunReport> {
    Err(spectrum_lights_core::LightsError::msg(
        "live capture is not available in this build (enable the `live` feature)",
    ))
}

#[cfg(feature = "live")]
fn list_devices() -> Result<()> {
    let names = spectrum_lights_core::input_device_names()?;
    if names.is_empty() {
        tracing::warn!("no input devices found");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

#[cfg(not(feature = "live"))]
fn list_devices() -> Result<()> {
    Err(spectrum_lights_core::LightsError::msg(
        "device listing is not available in this build (enable the `live` feature)",
    ))
}

fn stop_after(driver: &PipelineDriver, seconds: Option<f64>) {
    let Some(seconds) = seconds.filter(|s| s.is_finite() && *s > 0.0) else {
        return;
    };
    let handle = driver.shutdown_handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs_f64(seconds));
        tracing::info!(seconds, "run time elapsed, shutting down");
        handle.shutdown();
    });
}

fn analyze(input: &Path, output: &Path, config: Option<&Path>) -> Result<()> {
    tracing::info!(?input, ?output, "recording features");

    let mut config = load_config(config)?;
    let mut source = WavSource::open(input, config.audio.block_len)?;
    config.audio.sample_rate = source.sample_rate();

    let mut pipeline = Pipeline::new(&config)?;
    let mut recorder = FeatureRecorder::create(output)?;
    while let Some(block) = source.next_block()? {
        pipeline.process(&block)?;
        recorder.record(block.sequence(), block.start_seconds(), pipeline.features())?;
    }

    let records = recorder.records();
    recorder.finish()?;
    tracing::info!(
        records,
        zero_guard_hits = pipeline.zero_guard_hits(),
        gated_blocks = pipeline.gated_blocks(),
        "feature recording written"
    );
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => {
            tracing::info!(config = %path.display(), "loading configuration");
            PipelineConfig::from_json_file(path)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive light strip driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the lights from a file, a test tone or live input.
    Run(RunArgs),
    /// Record the smoothed features of a WAV file as JSON lines.
    Analyze {
        /// WAV file to analyse.
        input: PathBuf,
        /// Destination of the feature recording.
        output: PathBuf,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as JSON.
    Config,
    /// List the input devices available for live capture.
    Devices,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Restart the file when it ends.
    #[arg(long = "loop", requires = "input")]
    looping: bool,
    /// Input device name for live capture.
    #[arg(long, requires = "live")]
    device: Option<String>,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Draw frames in the terminal.
    #[arg(long)]
    preview: bool,
    /// Stop after this many seconds.
    #[arg(long)]
    seconds: Option<f64>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// WAV file to play.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Sine frequency in Hz for a synthetic test tone.
    #[arg(long)]
    tone: Option<f32>,
    /// Capture from an input device.
    #[arg(long)]
    live: bool,
}
