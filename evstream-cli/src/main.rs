//! evstream CLI application.
//!
//! Receives bit-plane frames from a camera server over TCP and writes the
//! decoded events to CSV or binary files, or plays the camera side for testing.

mod logging;
mod replay;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evstream_core::output::{self, EventSink, OutputError};
use evstream_core::{BitOrder, Config, Converter, Event, FieldOrder, FrameReceiver, StopReason};
use indicatif::{ProgressBar, ProgressStyle};
use logging::{LogFormat, LogLevel};
use replay::{FrameSource, ReplayOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bit-plane frame receiver and event decoder for event-camera streams.
#[derive(Parser, Debug)]
#[command(name = "evstream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "EVSTREAM_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log verbosity
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a camera server and decode frames into an event file
    Receive(ReceiveArgs),
    /// Serve frames to one receiver, acting as the camera
    Replay(ReplayArgs),
}

/// Settings that override the configuration file.
#[derive(Args, Debug)]
struct StreamArgs {
    /// Sensor width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Sensor height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Bytes preceding each frame payload
    #[arg(long)]
    header_size: Option<usize>,

    /// Pixel order within bytes: msb-first or lsb-first
    #[arg(long)]
    bit_order: Option<String>,
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    #[command(flatten)]
    stream: StreamArgs,

    /// Camera server host
    #[arg(long)]
    host: Option<String>,

    /// Camera server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Timestamp units per frame
    #[arg(long)]
    interval: Option<u64>,

    /// Read timeout in milliseconds
    #[arg(long, value_name = "MS")]
    read_timeout_ms: Option<u64>,

    /// Output file path (.csv, .bin)
    ///
    /// The output format is determined by the file extension:
    /// - .csv: Comma-separated values (human-readable)
    /// - .bin: Binary format (efficient, for programmatic access)
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Field order for CSV output.
    ///
    /// Comma-separated field names (x, y, p, t), e.g. "x,y,p,t" or "t,x,y,p".
    #[arg(short, long, default_value = "x,y,p,t")]
    format: String,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    max_frames: Option<u64>,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[command(flatten)]
    stream: StreamArgs,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    listen: SocketAddr,

    /// Raw dump of concatenated frame payloads; a sweeping bar is generated if omitted
    #[arg(short, long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Frames per second (0 = as fast as possible)
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Restart the dump file when it runs out
    #[arg(long)]
    repeat: bool,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    max_frames: Option<u64>,
}

impl StreamArgs {
    fn apply(&self, mut config: Config) -> Result<Config> {
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(header_size) = self.header_size {
            config.header_size = header_size;
        }
        if let Some(order) = &self.bit_order {
            config.bit_order = BitOrder::from_str(order).map_err(anyhow::Error::msg)?;
        }
        Ok(config)
    }
}

/// Forwards events to the file sink and keeps the spinner current.
struct ProgressSink {
    inner: Box<dyn EventSink>,
    progress: ProgressBar,
    frames: u64,
    events: u64,
}

impl EventSink for ProgressSink {
    fn append_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        self.inner.append_events(events)?;
        self.frames += 1;
        self.events += events.len() as u64;
        if self.frames % 16 == 0 {
            self.progress.set_message(format!(
                "{} frames, {} events",
                self.frames, self.events
            ));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        self.inner.flush()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let progress = match &cli.command {
        Command::Receive(_) if !cli.quiet => spinner()?,
        _ => ProgressBar::hidden(),
    };
    logging::init_logging(cli.log_format, cli.log_level, cli.quiet, progress.clone());

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    // Ctrl-C also ends a receive blocked on a silent camera, so the
    // output is always flushed on the way out.
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::Relaxed))
        .context("Failed to install Ctrl-C handler")?;

    match &cli.command {
        Command::Receive(args) => receive(config, args, cli.quiet, progress, &stop),
        Command::Replay(args) => replay(config, args, &stop),
    }
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    Ok(pb)
}

/// Connects to the camera and only then creates the output file, so a
/// failed connection leaves nothing behind.
fn open_stream(
    config: Arc<Config>,
    output: &Path,
    field_order: FieldOrder,
) -> Result<(Converter, Box<dyn EventSink>)> {
    let receiver = FrameReceiver::new(config.clone()).context("Failed to initialize sockets")?;
    let mut converter = Converter::new(receiver);
    converter
        .receiver_mut()
        .connect()
        .with_context(|| format!("Failed to connect to {}", config.endpoint()))?;

    let sink = output::create_file_sink(output, config.resolution(), field_order)
        .with_context(|| format!("Failed to create {:?}", output))?;
    Ok((converter, sink))
}

fn receive(
    config: Config,
    args: &ReceiveArgs,
    quiet: bool,
    progress: ProgressBar,
    stop: &AtomicBool,
) -> Result<()> {
    let field_order = FieldOrder::from_str(&args.format)
        .context("Invalid field format. Use comma-separated: x,y,p,t")?;

    let mut config = args.stream.apply(config)?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(interval) = args.interval {
        config.timestamp_interval = interval;
    }
    if let Some(ms) = args.read_timeout_ms {
        config.read_timeout = Some(Duration::from_millis(ms));
    }
    config.validate().context("Invalid configuration")?;
    let config = Arc::new(config);

    progress.enable_steady_tick(Duration::from_millis(100));
    progress.set_message(format!("Connecting to {}...", config.endpoint()));

    let (mut converter, file_sink) = open_stream(config.clone(), &args.output, field_order)?;
    let mut sink = ProgressSink {
        inner: file_sink,
        progress: progress.clone(),
        frames: 0,
        events: 0,
    };

    let start_time = Instant::now();
    let reason = converter
        .run(&mut sink, args.max_frames, stop)
        .with_context(|| format!("Conversion from {} failed", config.endpoint()))?;
    let duration = start_time.elapsed();
    let stats = converter.stats();

    let ending = match &reason {
        StopReason::FrameLimit => "frame limit reached".to_string(),
        StopReason::Stopped => "interrupted".to_string(),
        StopReason::Disconnected(err) => format!("stream ended: {}", err),
    };
    progress.finish_with_message(format!(
        "Done! {} frames, {} events in {:.2}s ({})",
        stats.frames,
        stats.events,
        duration.as_secs_f64(),
        ending
    ));

    if !quiet {
        let secs = duration.as_secs_f64().max(f64::EPSILON);
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Server:       {}", config.endpoint());
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Sensor:       {}", config.resolution());
        eprintln!("  Frames:       {}", stats.frames);
        eprintln!("  Skipped:      {}", stats.skipped_frames);
        eprintln!("  Events:       {}", stats.events);
        eprintln!("  Bytes:        {}", stats.bytes);
        eprintln!("  Duration:     {:.3}s", secs);
        eprintln!("  Frame rate:   {:.1} frames/s", stats.frames as f64 / secs);
        eprintln!("  Throughput:   {:.0} events/s", stats.events as f64 / secs);
    }

    Ok(())
}

fn replay(config: Config, args: &ReplayArgs, stop: &AtomicBool) -> Result<()> {
    let config = args.stream.apply(config)?;
    config.validate().context("Invalid configuration")?;

    let opts = ReplayOptions {
        listen: args.listen,
        source: match &args.input {
            Some(path) => FrameSource::File(path.clone()),
            None => FrameSource::Sweep,
        },
        fps: args.fps,
        repeat: args.repeat,
        max_frames: args.max_frames,
    };

    let sent = replay::serve(Arc::new(config), &opts, stop)?;
    eprintln!("Sent {} frames", sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn config_for(listener: &TcpListener) -> Arc<Config> {
        let port = listener.local_addr().unwrap().port();
        Arc::new(Config::new(4, 2).unwrap().with_endpoint("127.0.0.1", port))
    }

    #[test]
    fn test_refused_connection_creates_no_file() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        drop(listener);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");

        assert!(open_stream(config, &path, FieldOrder::XYPT).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_output_created_after_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.bin");

        let (converter, sink) = open_stream(config, &path, FieldOrder::XYPT).unwrap();
        drop(sink);

        assert!(converter.receiver().is_connected());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 20);
    }

    #[test]
    fn test_stream_args_override_config() {
        let args = StreamArgs {
            width: Some(32),
            height: None,
            header_size: Some(4),
            bit_order: Some("lsb".to_string()),
        };
        let config = args.apply(Config::default()).unwrap();
        assert_eq!(config.width, 32);
        assert_eq!(config.height, 480);
        assert_eq!(config.header_size, 4);
        assert_eq!(config.bit_order, BitOrder::LsbFirst);
    }
}
