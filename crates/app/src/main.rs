mod capture;
mod serial;

use std::{
    fs::OpenOptions,
    io::BufRead,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use lightshow_core::{AppConfig, ClickTrack, Lightshow, SerialSink, WriteSink};
use tracing_subscriber::EnvFilter;

use crate::{capture::InputDevice, serial::SerialPortSink};

fn main() -> lightshow_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_show(args),
        Commands::CheckConfig { config } => check_config(&config),
        Commands::WriteConfig { output } => write_config(&output),
    }
}

fn load_config(path: Option<&Path>) -> lightshow_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => {
            tracing::info!("no configuration given, using live defaults");
            Ok(AppConfig::live_defaults())
        }
    }
}

fn run_show(args: RunArgs) -> lightshow_core::Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    // The live device decides the capture format.
    let device = match args.synthetic {
        Some(_) => None,
        None => {
            let device = InputDevice::open_default()?;
            let format = device.format();
            config.audio.sample_rate = format.sample_rate;
            config.audio.channels = format.channels;
            Some(device)
        }
    };

    let baud_rate = config.dmx.baud_rate;
    let mut show = Lightshow::with_seed(config, args.seed)?;

    if let Some(path) = args.serial.as_deref() {
        match open_sink(path, args.byte_stream, baud_rate) {
            Ok(sink) => {
                if let Err(err) = show.attach_sink(sink) {
                    tracing::warn!(%err, "serial sink unusable");
                }
            }
            Err(err) => {
                tracing::warn!(?path, %err, "could not open serial device, running in simulation mode")
            }
        }
    }

    if let Some(mode) = args.mode.as_deref() {
        show.set_mode_by_name(mode);
    }
    if let Some(palette) = args.palette.as_deref() {
        show.set_palette(palette);
    }

    let capture = show.capture_handle();
    let mut click_track = None;
    let _stream = match (device, args.synthetic) {
        (Some(device), _) => Some(device.start(capture)?),
        (None, Some(bpm)) => {
            tracing::info!(bpm, "using synthetic click track");
            let track = ClickTrack::new(capture.sample_rate(), bpm);
            click_track = Some(track.spawn(capture, show.stop_flag())?);
            None
        }
        (None, None) => None,
    };

    show.start()?;

    let quit = Arc::new(AtomicBool::new(false));
    watch_stdin(Arc::clone(&quit));
    tracing::info!("lightshow running, press Enter to stop");

    let started = Instant::now();
    let status_interval = Duration::from_secs_f64(args.status_interval.max(0.1));
    let mut last_status = Instant::now();
    while !quit.load(Ordering::Relaxed) {
        if args.duration.is_some_and(|limit| started.elapsed().as_secs_f64() >= limit) {
            break;
        }
        thread::sleep(Duration::from_millis(50));

        if last_status.elapsed() >= status_interval {
            last_status = Instant::now();
            show.log_performance();
            if args.json_status {
                println!("{}", serde_json::to_string(&show.status())?);
            }
        }
    }

    show.stop()?;
    if let Some(handle) = click_track {
        if handle.join().is_err() {
            tracing::warn!("click track thread panicked");
        }
    }
    Ok(())
}

/// A UART driven with break and 8N2 framing, or a plain writer for
/// interfaces that frame DMX themselves.
fn open_sink(
    path: &Path,
    byte_stream: bool,
    baud_rate: u32,
) -> std::io::Result<Box<dyn SerialSink>> {
    if byte_stream {
        let device = OpenOptions::new().write(true).open(path)?;
        Ok(Box::new(WriteSink::new(device)))
    } else {
        Ok(Box::new(SerialPortSink::open(path, baud_rate)?))
    }
}

fn watch_stdin(quit: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let mut line = String::new();
            // EOF (no terminal) keeps the show running until --duration.
            if let Ok(read) = std::io::stdin().lock().read_line(&mut line) {
                if read > 0 {
                    quit.store(true, Ordering::Relaxed);
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(%err, "stdin watcher unavailable");
    }
}

fn check_config(path: &Path) -> lightshow_core::Result<()> {
    let config = AppConfig::load(path)?;
    for fixture in &config.fixtures {
        tracing::info!(
            fixture = %fixture.name,
            dmx_address = fixture.dmx_address,
            channels = ?fixture.channels,
            "fixture"
        );
    }
    let palettes: Vec<&str> = config.effects.palettes.keys().map(String::as_str).collect();
    tracing::info!(?palettes, mode = %config.effects.initial_mode, "configuration is valid");
    Ok(())
}

fn write_config(output: &Path) -> lightshow_core::Result<()> {
    AppConfig::live_defaults().save(output)?;
    tracing::info!(?output, "wrote default configuration");
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
#[command(author, version, about = "Audio-reactive DMX lightshow", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the show from the default input device or a click track.
    Run(RunArgs),
    /// Load and validate a configuration file.
    CheckConfig {
        /// Path to the JSON configuration.
        config: PathBuf,
    },
    /// Write the default configuration as JSON.
    WriteConfig {
        /// Destination path.
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file; live defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Drive the show from a synthetic click track at this tempo instead of
    /// the default input device.
    #[arg(long, value_name = "BPM")]
    synthetic: Option<f64>,
    /// Serial device of the DMX interface, opened at the configured baud
    /// rate with 8N2 framing.
    #[arg(short, long)]
    serial: Option<PathBuf>,
    /// Write frames to the serial device as a plain byte stream, for
    /// interfaces that generate the break and line settings themselves.
    #[arg(long, requires = "serial")]
    byte_stream: bool,
    /// Initial effect mode.
    #[arg(short, long)]
    mode: Option<String>,
    /// Pin a color palette.
    #[arg(short, long)]
    palette: Option<String>,
    /// Stop after this many seconds.
    #[arg(short, long)]
    duration: Option<f64>,
    /// Seconds between status reports.
    #[arg(long, default_value_t = 10.0)]
    status_interval: f64,
    /// Also print each status report as a JSON line on stdout.
    #[arg(long)]
    json_status: bool,
    /// Seed for the effects engine's random choices.
    #[arg(long)]
    seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn run_args(args: &[&str]) -> Result<RunArgs, clap::Error> {
        let argv = ["lightshow", "run"].iter().chain(args);
        match Cli::try_parse_from(argv)?.command {
            Commands::Run(run) => Ok(run),
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serial_defaults_to_uart_framing() {
        let args = run_args(&["--serial", "/dev/ttyUSB0"]).unwrap();
        assert_eq!(args.serial, Some(PathBuf::from("/dev/ttyUSB0")));
        assert!(!args.byte_stream);
    }

    #[test]
    fn byte_stream_needs_a_serial_device() {
        assert!(run_args(&["--byte-stream"]).is_err());
        let args = run_args(&["--serial", "/dev/ttyUSB0", "--byte-stream"]).unwrap();
        assert!(args.byte_stream);
    }

    #[test]
    fn missing_uart_reports_an_error() {
        let path = Path::new("/dev/lightshow-no-such-port");
        assert!(open_sink(path, false, 250_000).is_err());
        assert!(open_sink(path, true, 250_000).is_err());
    }
}
