use std::io::Write;

use chrono::SecondsFormat;
use lightmon_core::event::EnrichedEvent;
use serde::Serialize;

use crate::{OutputSink, SinkError, rotation::RotatingFileWriter, write_line};

/// Structured records for log collectors, usually written through a
/// [`RotatingFileWriter`].
pub struct LogFileSink<W = RotatingFileWriter> {
    writer: W,
}

/// Numbers are written as strings, collectors index them as keywords.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogRecord<'a> {
    time: String,
    level: &'static str,
    user: &'a str,
    pid: String,
    proc_path: &'a str,
    proc_args: &'a str,
    ipv6: u8,
    dip: String,
    dport: String,
    container: &'a str,
}

impl<'a> From<&'a EnrichedEvent> for LogRecord<'a> {
    fn from(event: &'a EnrichedEvent) -> Self {
        Self {
            time: event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
            level: "info",
            user: &event.user,
            pid: event.pid.to_string(),
            proc_path: &event.process_path,
            proc_args: &event.process_args,
            ipv6: u8::from(event.is_ipv6()),
            dip: event.dest_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            dport: event.dest_port.to_string(),
            container: &event.container_name,
        }
    }
}

impl<W: Write> LogFileSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for LogFileSink<W> {
    fn print_header(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn print_line(&mut self, event: &EnrichedEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(&LogRecord::from(event))?;
        write_line(&mut self.writer, line)
    }
}
