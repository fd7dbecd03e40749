//! Renderers for enriched connection events.
//!
//! Three sinks are available, selected by [`OutputFormat`]:
//! - `table`: aligned columns on stdout, for humans
//! - `json`: one JSON object per line on stdout
//! - `logfile`: structured JSON lines in hourly rotated files

use std::{
    io::{self, Write},
    path::Path,
};

use lightmon_core::event::EnrichedEvent;
use thiserror::Error;

mod json;
mod logfile;
mod rotation;
mod table;

pub use json::JsonSink;
pub use logfile::LogFileSink;
pub use rotation::{DEFAULT_MAX_FILES, DEFAULT_ROTATION_PERIOD, LOG_FILE_PREFIX, RotatingFileWriter};
pub use table::TableSink;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("writing output failed")]
    Io(#[from] io::Error),
    #[error("error serializing event")]
    Json(#[from] serde_json::Error),
    #[error("rotation period must be at least one minute")]
    ZeroPeriod,
    #[error("at least one log file must be kept")]
    ZeroFiles,
    #[error("invalid log directory {0}")]
    InvalidDirectory(String),
}

/// Destination of enriched events.
pub trait OutputSink {
    /// Called once, before the first event.
    fn print_header(&mut self) -> Result<(), SinkError>;

    fn print_line(&mut self, event: &EnrichedEvent) -> Result<(), SinkError>;
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn print_header(&mut self) -> Result<(), SinkError> {
        (**self).print_header()
    }

    fn print_line(&mut self, event: &EnrichedEvent) -> Result<(), SinkError> {
        (**self).print_line(event)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Table,
    Json,
    #[default]
    Logfile,
}

/// Builds the sink for `format`. Console sinks write to stdout, the log file
/// sink writes into `log_dir`.
pub fn build_sink(
    format: OutputFormat,
    log_dir: &Path,
) -> Result<Box<dyn OutputSink + Send>, SinkError> {
    let sink: Box<dyn OutputSink + Send> = match format {
        OutputFormat::Table => Box::new(TableSink::new(io::stdout())),
        OutputFormat::Json => Box::new(JsonSink::new(io::stdout())),
        OutputFormat::Logfile => {
            Box::new(LogFileSink::new(RotatingFileWriter::new(log_dir)?))
        }
    };
    Ok(sink)
}

/// Writes a single line, making sure it isn't split across multiple writes
/// of the underlying target.
fn write_line<W: Write>(writer: &mut W, mut line: String) -> Result<(), SinkError> {
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}
