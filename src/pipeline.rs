//! Turns kernel samples into output lines: enrichment, attribution, the IPv6
//! gate and the exclusion filter, then the sink.

use std::{
    net::IpAddr,
    sync::{Mutex, PoisonError},
};

use chrono::Local;
use exclude_filter::ExcludeFilter;
use lightmon_common::procfs::{ProcFs, get_user_name};
use lightmon_core::{
    attribution::AttributionResolver,
    event::{ConnectSample, EnrichedEvent},
};
use nix::unistd::Uid;
use output_sinks::{OutputSink, SinkError};

/// What happened to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Printed,
    Excluded,
    SkippedIpv6,
}

pub struct EventPipeline<S> {
    procfs: ProcFs,
    resolver: AttributionResolver,
    filter: ExcludeFilter,
    ipv6: bool,
    sink: Mutex<S>,
}

impl<S: OutputSink> EventPipeline<S> {
    pub fn new(procfs: ProcFs, resolver: AttributionResolver, filter: ExcludeFilter, sink: S) -> Self {
        Self {
            procfs,
            resolver,
            filter,
            ipv6: false,
            sink: Mutex::new(sink),
        }
    }

    /// Print IPv6 connections too. They're dropped by default.
    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn print_header(&self) -> Result<(), SinkError> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .print_header()
    }

    /// Runs a single sample through the whole pipeline. The sink is locked
    /// only while writing the line.
    pub fn handle(&self, sample: &ConnectSample) -> Result<Outcome, SinkError> {
        let event = self.enrich(sample);

        if !self.ipv6 && event.is_ipv6() {
            return Ok(Outcome::SkippedIpv6);
        }

        if self.filter.should_exclude(&event) {
            log::trace!("excluded {event}");
            return Ok(Outcome::Excluded);
        }

        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .print_line(&event)?;
        Ok(Outcome::Printed)
    }

    pub fn enrich(&self, sample: &ConnectSample) -> EnrichedEvent {
        let pid = sample.pid;

        let user = get_user_name(Uid::from_raw(sample.uid)).unwrap_or_else(|| {
            log::warn!("no user name for uid {}, process {pid}", sample.uid);
            sample.uid.to_string()
        });

        // short lived processes are often gone by now
        let process_path = match self.procfs.process_path(pid) {
            Ok(path) => path.display().to_string(),
            Err(err) => {
                log::debug!("{err}");
                String::new()
            }
        };
        let process_args = self.procfs.process_args(pid).unwrap_or_else(|err| {
            log::debug!("{err}");
            String::new()
        });

        let container_name = self.resolver.resolve(pid).name().to_string();

        let (dest_ip, dest_port) = split_endpoint(sample.dest);
        let (src_ip, src_port) = split_endpoint(sample.src);

        EnrichedEvent {
            timestamp: Local::now(),
            address_family: sample.family,
            pid,
            process_path,
            process_args,
            user,
            comm: sample.comm.clone(),
            dest_ip,
            dest_port,
            src_ip,
            src_port,
            container_name,
        }
    }

    pub fn into_sink(self) -> S {
        self.sink.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

fn split_endpoint(endpoint: Option<(IpAddr, u16)>) -> (Option<IpAddr>, u16) {
    match endpoint {
        Some((ip, port)) => (Some(ip), port),
        None => (None, 0),
    }
}
