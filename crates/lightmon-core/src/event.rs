//! Connection events: the raw samples emitted by the connect probe and the
//! enriched records handed to the output sinks.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use bytes::Buf;
use chrono::{DateTime, Local};
use lightmon_common::Pid;
use serde::{Serialize, Serializer};
use thiserror::Error;

pub const TASK_COMM_LEN: usize = 16;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// ts_us, pid, uid, af, comm
const HEADER_LEN: usize = 8 + 4 + 4 + 2 + TASK_COMM_LEN;

/// comm, pid, uid, sport, dport, saddr, daddr, padding, ts_us
const TCP_LEN: usize = TASK_COMM_LEN + 4 + 4 + 2 + 2 + 4 + 4 + 4 + 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SampleError {
    #[error("{kind} sample too short: {len} bytes, expected at least {expected}")]
    Truncated {
        kind: SampleKind,
        len: usize,
        expected: usize,
    },
}

/// The event map a sample was read from. Each one has its own layout.
///
/// `Ipv4`, `Ipv6` and `Other` come from the `sys_enter_connect` tracepoint,
/// `Tcp` from the `tcp_connect` fentry program, which only reports IPv4
/// sockets but knows their local address too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SampleKind {
    Ipv4,
    Ipv6,
    Other,
    Tcp,
}

impl SampleKind {
    /// Size of a sample of this kind, including trailing padding.
    pub const fn sample_len(self) -> usize {
        match self {
            SampleKind::Ipv4 => HEADER_LEN + 4 + 2 + 2,
            SampleKind::Ipv6 => HEADER_LEN + 16 + 2 + 2,
            SampleKind::Other => HEADER_LEN + 2,
            SampleKind::Tcp => TCP_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(u16),
}

impl From<u16> for AddressFamily {
    fn from(af: u16) -> Self {
        match af {
            AF_INET => AddressFamily::Inet,
            AF_INET6 => AddressFamily::Inet6,
            other => AddressFamily::Other(other),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "AF_INET"),
            AddressFamily::Inet6 => write!(f, "AF_INET6"),
            AddressFamily::Other(af) => write!(f, "AF_{af}"),
        }
    }
}

impl Serialize for AddressFamily {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A connect attempt as captured by the kernel probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSample {
    /// Kernel monotonic time in microseconds.
    pub ts_us: u64,
    pub pid: Pid,
    pub uid: u32,
    pub family: AddressFamily,
    pub comm: String,
    pub dest: Option<(IpAddr, u16)>,
    /// Only known to the fentry probe.
    pub src: Option<(IpAddr, u16)>,
}

impl ConnectSample {
    /// Decodes a packed little-endian sample read from the event map `kind`.
    pub fn decode(kind: SampleKind, mut buf: impl Buf) -> Result<Self, SampleError> {
        if buf.remaining() < kind.sample_len() {
            return Err(SampleError::Truncated {
                kind,
                len: buf.remaining(),
                expected: kind.sample_len(),
            });
        }

        if kind == SampleKind::Tcp {
            return Ok(Self::decode_tcp(buf));
        }

        let ts_us = buf.get_u64_le();
        let pid = Pid::from_raw(buf.get_u32_le() as i32);
        let uid = buf.get_u32_le();
        let family = AddressFamily::from(buf.get_u16_le());
        let mut comm = [0u8; TASK_COMM_LEN];
        buf.copy_to_slice(&mut comm);

        // addresses are in network order, ports were converted by the probe
        let dest = match kind {
            SampleKind::Ipv4 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Some((IpAddr::V4(Ipv4Addr::from(octets)), buf.get_u16_le()))
            }
            SampleKind::Ipv6 => {
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Some((IpAddr::V6(Ipv6Addr::from(octets)), buf.get_u16_le()))
            }
            SampleKind::Other => None,
            SampleKind::Tcp => unreachable!("handled by decode_tcp above"),
        };

        Ok(Self {
            ts_us,
            pid,
            uid,
            family,
            comm: comm_to_string(&comm),
            dest,
            src: None,
        })
    }

    /// The fentry layout: ports and addresses are both in network order.
    fn decode_tcp(mut buf: impl Buf) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        buf.copy_to_slice(&mut comm);
        let pid = Pid::from_raw(buf.get_u32_le() as i32);
        let uid = buf.get_u32_le();
        let sport = buf.get_u16();
        let dport = buf.get_u16();
        let mut saddr = [0u8; 4];
        buf.copy_to_slice(&mut saddr);
        let mut daddr = [0u8; 4];
        buf.copy_to_slice(&mut daddr);
        buf.advance(4);
        let ts_us = buf.get_u64_le();

        Self {
            ts_us,
            pid,
            uid,
            family: AddressFamily::Inet,
            comm: comm_to_string(&comm),
            dest: Some((IpAddr::V4(Ipv4Addr::from(daddr)), dport)),
            src: Some((IpAddr::V4(Ipv4Addr::from(saddr)), sport)),
        }
    }
}

fn comm_to_string(comm: &[u8]) -> String {
    let len = comm.iter().position(|b| *b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..len]).into_owned()
}

/// A connect attempt enriched with process and container identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedEvent {
    #[serde(rename = "uTime")]
    pub timestamp: DateTime<Local>,
    pub address_family: AddressFamily,
    #[serde(serialize_with = "serialize_pid")]
    pub pid: Pid,
    pub process_path: String,
    pub process_args: String,
    pub user: String,
    pub comm: String,
    #[serde(rename = "dip")]
    pub dest_ip: Option<IpAddr>,
    #[serde(rename = "dport")]
    pub dest_port: u16,
    #[serde(rename = "sip")]
    pub src_ip: Option<IpAddr>,
    #[serde(rename = "sport")]
    pub src_port: u16,
    pub container_name: String,
}

impl EnrichedEvent {
    pub fn is_ipv6(&self) -> bool {
        self.address_family == AddressFamily::Inet6
    }
}

fn serialize_pid<S: Serializer>(pid: &Pid, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i32(pid.as_raw())
}

impl fmt::Display for EnrichedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] ", self.pid, self.process_path)?;
        match self.dest_ip {
            Some(ip) => write!(f, "connect -> {ip}:{}", self.dest_port)?,
            None => write!(f, "connect ({})", self.address_family)?,
        }
        write!(f, " container: {}", self.container_name)
    }
}
