use std::io::Write;

use lightmon_core::event::{AddressFamily, EnrichedEvent};

use crate::{OutputSink, SinkError, write_line};

/// Human readable columns.
pub struct TableSink<W> {
    writer: W,
}

impl<W: Write> TableSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn row(
    time: &str,
    user: &str,
    pid: &str,
    af: &str,
    destination: &str,
    container: &str,
    process: &str,
) -> String {
    format!("{time:<9} {user:<16} {pid:<10} {af:<9} {destination:<42} {container:<20} {process}")
}

impl<W: Write> OutputSink for TableSink<W> {
    fn print_header(&mut self) -> Result<(), SinkError> {
        let header = row(
            "TIME",
            "USER",
            "PID",
            "AF",
            "DESTINATION",
            "CONTAINER",
            "PROCESS",
        );
        write_line(&mut self.writer, header)
    }

    fn print_line(&mut self, event: &EnrichedEvent) -> Result<(), SinkError> {
        let af = match event.address_family {
            AddressFamily::Inet => "ipv4",
            AddressFamily::Inet6 => "ipv6",
            AddressFamily::Other(_) => "",
        };
        let destination = match event.dest_ip {
            Some(ip) => format!("{ip} {}", event.dest_port),
            None => format!("- {}", event.dest_port),
        };
        let line = row(
            &event.timestamp.format("%H:%M:%S").to_string(),
            &event.user,
            &event.pid.to_string(),
            af,
            &destination,
            &event.container_name,
            &format!("{} {}", event.process_path, event.process_args),
        );
        write_line(&mut self.writer, line)
    }
}
