use std::io::Write;

use lightmon_core::event::EnrichedEvent;

use crate::{OutputSink, SinkError, write_line};

/// Line delimited JSON, one object per event.
pub struct JsonSink<W> {
    writer: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for JsonSink<W> {
    fn print_header(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn print_line(&mut self, event: &EnrichedEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(event)?;
        write_line(&mut self.writer, line)
    }
}
