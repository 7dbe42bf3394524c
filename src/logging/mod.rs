//! Logging module for dockgrid
//!
//! Structured logging with tracing: pretty output on a terminal, JSON
//! otherwise, and always a JSON log file.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::MakeWriterExt},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_DIRS: [&str; 2] = ["/var/log/dockgrid", "./logs"];
const LOG_FILE_NAME: &str = "dockgrid.log";

/// Map a configured level name to a tracing level, defaulting to info
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the logging/tracing system
pub fn init_logging(log_level: &str) -> Result<()> {
    let level = parse_level(log_level);

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dockgrid={}", level)));

    let log_file = Mutex::new(open_log_file()?);

    if atty::is(atty::Stream::Stdout) {
        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .pretty()
            .with_writer(std::io::stdout);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .with_writer(log_file.and(std::io::stderr.with_max_level(Level::ERROR)));

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .with_writer(log_file.and(std::io::stdout));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Open the log file in the first writable log directory
fn open_log_file() -> Result<File> {
    let mut last_error = None;

    for dir in LOG_DIRS {
        let opened = std::fs::create_dir_all(dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(dir).join(LOG_FILE_NAME))
        });
        match opened {
            Ok(file) => return Ok(file),
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => Err(e).context("Failed to open log file"),
        None => anyhow::bail!("No log directory configured"),
    }
}

/// Check if stdout is a terminal
mod atty {
    pub enum Stream {
        Stdout,
    }

    pub fn is(stream: Stream) -> bool {
        #[cfg(unix)]
        {
            let fd = match stream {
                Stream::Stdout => libc::STDOUT_FILENO,
            };
            unsafe { libc::isatty(fd) != 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = stream;
            false
        }
    }
}
