//! Logging init for the `rebound` binary: stderr by default, or appended to a
//! log file. The library only emits events; it never installs a subscriber.

use std::fs;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::{ClientError, Result};

const DEFAULT_FILTER: &str = "info,rebound=debug";
const VERBOSE_FILTER: &str = "debug,rebound=trace";

/// Writer that is either a file or stderr (used when file clone fails).
enum FileOrStderr {
    File(fs::File),
    Stderr,
}

impl io::Write for FileOrStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.write(buf),
            Self::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(f) => f.flush(),
            Self::Stderr => io::stderr().lock().flush(),
        }
    }
}

struct FileMakeWriter(fs::File);

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileOrStderr;

    fn make_writer(&'a self) -> Self::Writer {
        self.0.try_clone().map(FileOrStderr::File).unwrap_or(FileOrStderr::Stderr)
    }
}

/// `RUST_LOG` if set, otherwise the default (or verbose) filter
fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
    })
}

/// Build the writer: append to `log_file` when given, otherwise stderr
fn make_writer(log_file: Option<&Path>) -> Result<BoxMakeWriter> {
    let Some(path) = log_file else {
        return Ok(BoxMakeWriter::new(io::stderr));
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            ClientError::config_error(format!("Could not create log directory {}: {e}", parent.display()))
        })?;
    }

    let file = fs::OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
        ClientError::config_error(format!("Could not open log file {}: {e}", path.display()))
    })?;

    Ok(BoxMakeWriter::new(FileMakeWriter(file)))
}

/// Install the global subscriber. Fails if the log file cannot be opened, so
/// the caller can decide whether to fall back to [`init_logging_stderr`].
pub fn init_logging(log_file: Option<&Path>, verbose: bool) -> Result<()> {
    let writer = make_writer(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| ClientError::config_error(format!("Could not initialize logging: {e}")))?;

    if let Some(path) = log_file {
        tracing::debug!("rebound logging to {}", path.display());
    }

    Ok(())
}

/// Log to stderr only. Used when `init_logging` fails so the CLI keeps running.
pub fn init_logging_stderr(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}
