//! Loading of the connect probe and consumption of its event maps.
//!
//! Two probe objects are supported, selected by [`ProbeType`]:
//! - `fentry`: a `tcp_connect` fentry program writing IPv4 connects, with
//!   their local address, into the `events` ring buffer
//! - `tracepoint`: a `syscalls/sys_enter_connect` tracepoint program writing
//!   into one perf event array per address family, each read by one task per
//!   online CPU
//!
//! Every sample is handed to a [`SampleSender`] before the next one is read.

use std::{io, path::Path, sync::Arc};

use anyhow::{Result, anyhow, bail};
use aya::{
    Btf, BtfError, Ebpf, EbpfError,
    maps::{
        MapError, RingBuf,
        perf::{AsyncPerfEventArray, PerfBufferError},
    },
    programs::{FEntry, ProgramError, TracePoint},
    util::online_cpus,
};
use bytes::BytesMut;
use lightmon_common::log_error;
use lightmon_core::event::{ConnectSample, SampleError, SampleKind};
use output_sinks::OutputSink;
use thiserror::Error;
use tokio::{io::unix::AsyncFd, sync::watch};

use crate::pipeline::EventPipeline;

/// Kernel function hooked by the fentry probe, also the name of its program.
pub const FENTRY_FUNCTION: &str = "tcp_connect";
/// Ring buffer of the fentry probe.
pub const RING_BUFFER_MAP: &str = "events";

pub const PROGRAM_NAME: &str = "TraceTcpEvent";
pub const TRACEPOINT_CATEGORY: &str = "syscalls";
pub const TRACEPOINT_NAME: &str = "sys_enter_connect";

/// Event maps of the tracepoint probe and the layout of their samples.
pub const EVENT_MAPS: [(&str, SampleKind); 3] = [
    ("ipv4_events", SampleKind::Ipv4),
    ("ipv6_events", SampleKind::Ipv6),
    ("other_socket_events", SampleKind::Other),
];

/// Pages of memory (4Kb) used by each per-CPU buffer.
pub const PERF_PAGES_DEFAULT: usize = 64;

/// Samples read at once from a per-CPU buffer.
const BATCH_SIZE: usize = 16;
const BUFFER_SIZE: usize = 128;

/// The kind of program inside the probe object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ProbeType {
    #[default]
    Fentry,
    Tracepoint,
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("loading probe {path} failed")]
    Load {
        path: String,
        #[source]
        source: EbpfError,
    },
    #[error("program {0} not found")]
    ProgramNotFound(String),
    #[error("program {0} has an unexpected type")]
    ProgramType(String),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("loading kernel BTF failed")]
    Btf(#[from] BtfError),
    #[error("map {0} not found")]
    MapNotFound(String),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    PerfBuffer(#[from] PerfBufferError),
    #[error("listing online cpus failed")]
    OnlineCpus(#[source] io::Error),
    #[error("polling ring buffer failed")]
    RingBuffer(#[source] io::Error),
    #[error(transparent)]
    Sample(#[from] SampleError),
}

/// Receives the samples read from the probe.
///
/// A clone is moved into each per-CPU task.
pub trait SampleSender: Clone + Send + 'static {
    fn send(&mut self, sample: Result<ConnectSample, ProbeError>);
}

impl<S: OutputSink + Send + 'static> SampleSender for Arc<EventPipeline<S>> {
    fn send(&mut self, sample: Result<ConnectSample, ProbeError>) {
        match sample {
            Ok(sample) => {
                if let Err(err) = self.handle(&sample) {
                    log_error("Printing connection event", err);
                }
            }
            Err(err) => log_error("Reading connection event", err),
        }
    }
}

/// The loaded probe. Dropping it stops the reader tasks and detaches the
/// program.
pub struct Probe {
    ebpf: Ebpf,
    probe_type: ProbeType,
    tx_exit: watch::Sender<()>,
    perf_pages: usize,
}

impl Probe {
    pub fn load(path: &Path, probe_type: ProbeType) -> Result<Self, ProbeError> {
        let ebpf = Ebpf::load_file(path).map_err(|source| ProbeError::Load {
            path: path.display().to_string(),
            source,
        })?;
        let (tx_exit, _) = watch::channel(());

        Ok(Self {
            ebpf,
            probe_type,
            tx_exit,
            perf_pages: PERF_PAGES_DEFAULT,
        })
    }

    pub fn attach(&mut self) -> Result<(), ProbeError> {
        match self.probe_type {
            ProbeType::Fentry => {
                let btf = Btf::from_sys_fs()?;
                let program: &mut FEntry = self.program(FENTRY_FUNCTION)?;
                program.load(FENTRY_FUNCTION, &btf)?;
                program.attach()?;
                log::debug!("attached fentry/{FENTRY_FUNCTION}");
            }
            ProbeType::Tracepoint => {
                let program: &mut TracePoint = self.program(PROGRAM_NAME)?;
                program.load()?;
                program.attach(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)?;
                log::debug!("attached {PROGRAM_NAME} to {TRACEPOINT_CATEGORY}/{TRACEPOINT_NAME}");
            }
        }
        Ok(())
    }

    fn program<'a, T>(&'a mut self, name: &str) -> Result<&'a mut T, ProbeError>
    where
        T: 'a,
        &'a mut T: TryFrom<&'a mut aya::programs::Program>,
    {
        self.ebpf
            .program_mut(name)
            .ok_or_else(|| ProbeError::ProgramNotFound(name.to_string()))?
            .try_into()
            .map_err(|_| ProbeError::ProgramType(name.to_string()))
    }

    /// Starts reading every event map, forwarding samples to `sender`.
    pub fn read_events(&mut self, sender: impl SampleSender) -> Result<(), ProbeError> {
        match self.probe_type {
            ProbeType::Fentry => self.read_ring_buffer(sender),
            ProbeType::Tracepoint => self.read_perf_arrays(sender),
        }
    }

    fn read_ring_buffer(&mut self, mut sender: impl SampleSender) -> Result<(), ProbeError> {
        let map = self
            .ebpf
            .take_map(RING_BUFFER_MAP)
            .ok_or_else(|| ProbeError::MapNotFound(RING_BUFFER_MAP.to_string()))?;
        let ring_buf = RingBuf::try_from(map)?;
        let mut ring_buf = AsyncFd::new(ring_buf).map_err(ProbeError::RingBuffer)?;
        let mut rx_exit = self.tx_exit.subscribe();

        tokio::spawn(async move {
            loop {
                let mut guard = tokio::select! {
                    _ = rx_exit.changed() => return,
                    guard = ring_buf.readable_mut() => match guard {
                        Ok(guard) => guard,
                        Err(err) => return sender.send(Err(ProbeError::RingBuffer(err))),
                    },
                };
                let events = guard.get_inner_mut();
                while let Some(item) = events.next() {
                    let sample = ConnectSample::decode(SampleKind::Tcp, &item[..])
                        .map_err(ProbeError::from);
                    sender.send(sample);
                }
                guard.clear_ready();
            }
        });
        log::debug!("reading {RING_BUFFER_MAP}");

        Ok(())
    }

    fn read_perf_arrays(&mut self, sender: impl SampleSender) -> Result<(), ProbeError> {
        let cpus = online_cpus().map_err(|(_, err)| ProbeError::OnlineCpus(err))?;

        for (map_name, kind) in EVENT_MAPS {
            let map = self
                .ebpf
                .take_map(map_name)
                .ok_or_else(|| ProbeError::MapNotFound(map_name.to_string()))?;
            let mut perf_array = AsyncPerfEventArray::try_from(map)?;

            let buffers = cpus
                .iter()
                .map(|cpu_id| perf_array.open(*cpu_id, Some(self.perf_pages)))
                .collect::<Result<Vec<_>, PerfBufferError>>()?;

            for mut buf in buffers {
                let mut sender = sender.clone();
                let mut rx_exit = self.tx_exit.subscribe();
                tokio::spawn(async move {
                    let mut buffers = (0..BATCH_SIZE)
                        .map(|_| BytesMut::with_capacity(BUFFER_SIZE))
                        .collect::<Vec<_>>();
                    loop {
                        let events = tokio::select! {
                            _ = rx_exit.changed() => return,
                            events = buf.read_events(&mut buffers) => events,
                        };
                        match events {
                            Ok(events) => {
                                if events.lost > 0 {
                                    log::warn!(
                                        "{}: Lost {} events (read {})",
                                        map_name,
                                        events.lost,
                                        events.read
                                    );
                                }
                                for buffer in buffers.iter().take(events.read) {
                                    let sample = ConnectSample::decode(kind, &buffer[..])
                                        .map_err(ProbeError::from);
                                    sender.send(sample);
                                }
                            }
                            Err(err) => return sender.send(Err(err.into())),
                        }
                    }
                });
            }
            log::debug!("reading {map_name} on {} cpus", cpus.len());
        }

        Ok(())
    }

    /// Stops the reader tasks.
    pub fn stop(&self) {
        // receivers may be gone already
        let _ = self.tx_exit.send(());
    }
}

/// Bumps the rlimit for memlock up to full capacity.
/// This is required to load eBPF maps until kernel 5.11.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(anyhow!(io::Error::last_os_error()).context("Failed to increase rlimit"))
    }
    Ok(())
}
