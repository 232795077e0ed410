use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod audio;
mod demod;
mod display;
mod error;
mod input;
mod scheduler;
mod spectrum;
mod state;
mod tuner;

use audio::{AudioSink, NullAudioSink, WavRecorder};
use demod::Demodulator;
use display::{run_display, DisplayPublisher, LogDisplay};
use input::stream::RtlTcpConfig;
use input::synthetic::{SyntheticConfig, ToneModulation};
use input::{RtlTcpSource, SampleSource, StreamFormat, SyntheticSource, TunableRange, WavFileSource};
use scheduler::{with_controller, Pipeline, SchedulerConfig, UpdateScheduler};
use spectrum::{SpectralAnalyzer, SpectrumMode, Window};
use state::{JsonStateFile, NoPersistence, StateStore};
use tuner::{mhz_to_hz, Band, FrequencyController, StartupActions, TunerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// rtl_tcp server (or plain IQ TCP feed)
    RtlTcp,
    /// Built-in tone generator, no hardware needed
    Synthetic,
    /// Loop an IQ WAV recording
    Wav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BandArg {
    Am,
    Sw,
    Fm,
}

impl From<BandArg> for Band {
    fn from(arg: BandArg) -> Self {
        match arg {
            BandArg::Am => Band::Am,
            BandArg::Sw => Band::Sw,
            BandArg::Fm => Band::Fm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Real,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WindowArg {
    None,
    Blackman,
}

/// Tune an SDR, demodulate FM audio and watch the spectrum
#[derive(Parser, Debug)]
#[command(name = "wave-radio")]
#[command(version, about, long_about = None)]
struct Args {
    /// Where IQ samples come from
    #[arg(long, value_enum, default_value = "synthetic")]
    source: SourceKind,

    /// rtl_tcp server address
    #[arg(short, long, value_name = "HOST:PORT", default_value = "127.0.0.1:1234")]
    connect: String,

    /// IQ WAV recording for --source wav
    #[arg(long, value_name = "FILE")]
    wav: Option<PathBuf>,

    /// Stream format: uint8 (rtl_tcp), int8, int16, int32, float32
    #[arg(long, default_value = "uint8")]
    format: String,

    /// IQ sample rate (Hz)
    #[arg(short = 'r', long, default_value = "2400000")]
    sample_rate: u32,

    /// Manual tuner gain in dB (AGC when omitted)
    #[arg(short, long)]
    gain: Option<f32>,

    /// Read timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout: u64,

    /// Lowest frequency the tuner accepts (MHz)
    #[arg(long)]
    min_mhz: Option<f64>,

    /// Highest frequency the tuner accepts (MHz)
    #[arg(long)]
    max_mhz: Option<f64>,

    /// Synthetic carrier offset from center (Hz)
    #[arg(long, default_value = "1000")]
    tone_offset: f64,

    /// Synthetic noise level (standard deviation per component)
    #[arg(long, default_value = "0")]
    noise: f32,

    /// FM-modulate the synthetic carrier with a 1 kHz tone
    #[arg(long)]
    modulate: bool,

    /// IQ samples read per refresh
    #[arg(short, long, default_value = "16384")]
    batch_size: usize,

    /// Audio output rate (Hz)
    #[arg(long, default_value_t = demod::AUDIO_RATE)]
    audio_rate: u32,

    /// FFT length for the spectrum display
    #[arg(long, default_value = "1024")]
    frame_size: usize,

    /// Upper bound of display values
    #[arg(long, default_value = "100")]
    display_max: f32,

    /// Transform the in-phase component only or the full complex sample
    #[arg(long, value_enum, default_value = "real")]
    mode: ModeArg,

    #[arg(long, value_enum, default_value = "none")]
    window: WindowArg,

    /// Display refresh period in milliseconds
    #[arg(long, default_value = "800")]
    refresh_ms: u64,

    /// Scan step period in milliseconds
    #[arg(long, default_value = "1000")]
    scan_ms: u64,

    /// Persisted tuner state
    #[arg(long, default_value = "config.json")]
    state: PathBuf,

    /// Do not read or write the state file
    #[arg(long)]
    no_persist: bool,

    /// Record demodulated audio as WAV files into this directory
    #[arg(long, value_name = "DIR")]
    record_dir: Option<PathBuf>,

    /// Record float32 WAV instead of int16
    #[arg(long)]
    float32: bool,

    /// Tune to this frequency at startup (MHz)
    #[arg(short, long)]
    tune: Option<f64>,

    /// Jump to a band preset at startup
    #[arg(long, value_enum)]
    band: Option<BandArg>,

    /// Move by this many 0.1 MHz steps after startup tuning
    #[arg(long, allow_hyphen_values = true)]
    nudge: Option<i32>,

    /// Bookmark the frequency after startup tuning
    #[arg(long)]
    bookmark: bool,

    /// Remove a saved bookmark (MHz)
    #[arg(long, value_name = "MHZ")]
    unbookmark: Option<f64>,

    /// Start scanning upward immediately
    #[arg(long)]
    scan: bool,

    /// Switch the saved theme to dark
    #[arg(long, conflicts_with = "light")]
    dark: bool,

    /// Switch the saved theme to light
    #[arg(long)]
    light: bool,

    /// Exit after this many seconds (default: run until Ctrl+C)
    #[arg(long)]
    duration: Option<u64>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long)]
    log_level: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Initialize logging with optional level. Falls back to INFO if level is None or invalid.
fn init_logging(log_level: Option<&str>, verbose: bool) {
    let level = log_level
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(if verbose { Level::DEBUG } else { Level::INFO });

    FmtSubscriber::builder()
        .with_target(false)
        .with_max_level(level)
        .init();
}

fn tunable_range(args: &Args) -> TunableRange {
    TunableRange {
        min_hz: args.min_mhz.map(mhz_to_hz).unwrap_or(0),
        max_hz: args.max_mhz.map(mhz_to_hz).unwrap_or(u64::MAX),
    }
}

/// Pick the receiver once, from configuration
fn build_source(args: &Args, center_freq_hz: u64) -> Result<Box<dyn SampleSource>, Box<dyn std::error::Error>> {
    let source: Box<dyn SampleSource> = match args.source {
        SourceKind::RtlTcp => {
            let format = StreamFormat::parse(&args.format).ok_or_else(|| {
                format!(
                    "Invalid format '{}'. Use: uint8, int8, int16, int32, float32",
                    args.format
                )
            })?;
            Box::new(RtlTcpSource::connect(RtlTcpConfig {
                addr: args.connect.clone(),
                format,
                sample_rate: args.sample_rate,
                center_freq_hz,
                gain_db: args.gain,
                read_timeout: Duration::from_millis(args.timeout),
                range: tunable_range(args),
            })?)
        }
        SourceKind::Synthetic => Box::new(SyntheticSource::new(SyntheticConfig {
            sample_rate: args.sample_rate,
            center_freq_hz,
            tone_offset_hz: args.tone_offset,
            modulation: args.modulate.then_some(ToneModulation {
                audio_hz: 1_000.0,
                deviation_hz: 5_000.0,
            }),
            noise_amplitude: args.noise,
            range: tunable_range(args),
            ..SyntheticConfig::default()
        })?),
        SourceKind::Wav => {
            let path = args.wav.as_ref().ok_or("--source wav needs --wav <FILE>")?;
            Box::new(WavFileSource::open(path, center_freq_hz)?)
        }
    };
    info!("Using source: {} at {} Hz", source.name(), source.sample_rate());
    Ok(source)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref(), args.verbose);

    let store: Box<dyn StateStore> = if args.no_persist {
        Box::new(NoPersistence)
    } else {
        let file = JsonStateFile::new(&args.state);
        info!("State file: {}", file.path().display());
        Box::new(file)
    };
    let restored = TunerState::from_persisted(store.load_or_default());

    let source = input::shared(build_source(&args, mhz_to_hz(restored.frequency_mhz))?);
    let controller = Arc::new(Mutex::new(FrequencyController::restore(
        source.clone(),
        store,
        restored,
    )));

    let audio: Box<dyn AudioSink> = match &args.record_dir {
        Some(dir) => {
            let mhz = controller.lock().unwrap_or_else(|e| e.into_inner()).frequency_mhz();
            Box::new(WavRecorder::create(dir, mhz, args.audio_rate, args.float32)?)
        }
        None => Box::new(NullAudioSink::default()),
    };
    let pipeline = Pipeline {
        demodulator: Demodulator::new(args.audio_rate),
        analyzer: SpectralAnalyzer::new(
            args.frame_size,
            args.display_max,
            match args.mode {
                ModeArg::Real => SpectrumMode::Real,
                ModeArg::Complex => SpectrumMode::Complex,
            },
            match args.window {
                WindowArg::None => Window::Rectangular,
                WindowArg::Blackman => Window::Blackman,
            },
        )?,
        audio,
    };

    let display = DisplayPublisher::new();
    let display_task = tokio::spawn(run_display(display.subscribe(), LogDisplay::default()));

    let mut scheduler = UpdateScheduler::start(
        SchedulerConfig {
            refresh_interval: Duration::from_millis(args.refresh_ms),
            scan_interval: Duration::from_millis(args.scan_ms),
            batch_size: args.batch_size,
        },
        source,
        controller.clone(),
        pipeline,
        display.clone(),
    );

    let actions = StartupActions {
        band: args.band.map(Band::from),
        tune_mhz: args.tune,
        nudge: args.nudge,
        bookmark: args.bookmark,
        unbookmark_mhz: args.unbookmark,
        dark: if args.dark {
            Some(true)
        } else if args.light {
            Some(false)
        } else {
            None
        },
    };
    let failures = with_controller(&controller, &display, move |ctl| actions.apply(ctl)).await;
    for e in failures {
        warn!("{}", e);
        display.status(format!("⚠ {}", e));
    }

    if args.scan {
        scheduler.start_scan().await;
    }

    match args.duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutting down");
    scheduler.close().await;
    drop(scheduler);
    drop(display);
    if tokio::time::timeout(Duration::from_secs(1), display_task).await.is_err() {
        warn!("Display did not drain in time");
    }

    Ok(())
}
