//! Log output setup for the CLI.

use clap::ValueEnum;
use indicatif::ProgressBar;
use std::io::{self, Write};
use tracing::level_filters::LevelFilter;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Writes log records with `progress` cleared from the terminal, so the
/// spinner is redrawn below the record instead of through it.
pub struct ProgressWriter<W> {
    progress: ProgressBar,
    inner: W,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(progress: ProgressBar, inner: W) -> Self {
        Self { progress, inner }
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = &mut self.inner;
        self.progress.suspend(|| inner.write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let inner = &mut self.inner;
        self.progress.suspend(|| inner.write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Installs a stderr subscriber that shares the terminal with `progress`.
/// Quiet mode keeps only errors.
pub fn init_logging(format: LogFormat, level: LogLevel, quiet: bool, progress: ProgressBar) {
    let level = if quiet {
        LevelFilter::ERROR
    } else {
        level.as_filter()
    };
    let make_writer = move || ProgressWriter::new(progress.clone(), io::stderr());
    let builder = tracing_subscriber::fmt()
        .with_writer(make_writer)
        .with_max_level(level)
        .with_target(false);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().with_ansi(false).try_init();
        }
    }
}
