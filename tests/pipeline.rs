//! Runs synthetic connect samples through the whole pipeline, from container
//! discovery to the JSON output.

use std::{
    io::{self, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::{Arc, Mutex},
};

use exclude_filter::ExcludeFilter;
use lightmon::pipeline::{EventPipeline, Outcome};
use lightmon_common::{
    Pid,
    containers::ContainerMetadataReader,
    procfs::HOST_INIT_PID,
    test_utils::{FakeDocker, FakeProc},
};
use lightmon_core::{
    attribution::{AttributionCache, AttributionResolver, ContainerLoader, ResolveMode},
    event::{AddressFamily, ConnectSample, SampleKind},
};
use output_sinks::JsonSink;
use serde_json::Value;

const SHIM: Pid = Pid::from_raw(1000);
const INIT: Pid = Pid::from_raw(1001);
const WORKER: Pid = Pid::from_raw(1002);
const LATE: Pid = Pid::from_raw(1003);
const HOST: Pid = Pid::from_raw(2000);

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn lines(&self) -> Vec<Value> {
        let data = self.0.lock().unwrap();
        String::from_utf8_lossy(&data)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A host running a `web` container (shim -> init -> worker) and a plain
/// host process.
struct Host {
    proc: FakeProc,
    docker: FakeDocker,
    cache: AttributionCache,
}

impl Host {
    fn new() -> Self {
        let proc = FakeProc::new();
        proc.process(SHIM, HOST_INIT_PID);
        proc.process(INIT, SHIM);
        proc.process(WORKER, INIT);
        proc.children(SHIM, &[INIT]);
        proc.children(INIT, &[WORKER]);
        proc.children(WORKER, &[]);
        proc.exe(WORKER, "/usr/bin/curl");
        proc.cmdline(WORKER, &["curl", "-s", "https://example.com"]);

        proc.process(HOST, HOST_INIT_PID);
        proc.exe(HOST, "/usr/bin/wget");
        proc.cmdline(HOST, &["wget", "-q", "https://example.com"]);

        let docker = FakeDocker::new();
        docker.container("5f0c1e2d3c4b5a69788796a5b4c3d2e1f0", INIT, "/web");

        let host = Self {
            proc,
            docker,
            cache: AttributionCache::new(),
        };
        let reader = ContainerMetadataReader::new(
            host.docker.runtime_root(),
            host.docker.data_root(),
            host.proc.procfs(),
        );
        assert_eq!(ContainerLoader::new(reader, host.cache.clone()).load().unwrap(), 1);
        host
    }

    fn pipeline(&self, exclude: &str, ipv6: bool) -> (EventPipeline<JsonSink<SharedBuffer>>, SharedBuffer) {
        let output = SharedBuffer::default();
        let resolver =
            AttributionResolver::new(self.cache.clone(), self.proc.procfs(), ResolveMode::Docker);
        let pipeline = EventPipeline::new(
            self.proc.procfs(),
            resolver,
            ExcludeFilter::parse(exclude),
            JsonSink::new(output.clone()),
        )
        .with_ipv6(ipv6);
        (pipeline, output)
    }
}

fn sample(pid: Pid, ip: IpAddr, port: u16) -> ConnectSample {
    ConnectSample {
        ts_us: 42,
        pid,
        uid: 4_000_321,
        family: match ip {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        },
        comm: "curl".to_string(),
        dest: Some((ip, port)),
        src: None,
    }
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

#[test]
fn container_and_host_connections() {
    let host = Host::new();
    let (pipeline, output) = host.pipeline("", false);
    pipeline.print_header().unwrap();

    assert_eq!(pipeline.handle(&sample(WORKER, v4(10, 0, 0, 1), 80)).unwrap(), Outcome::Printed);
    assert_eq!(pipeline.handle(&sample(HOST, v4(1, 1, 1, 1), 443)).unwrap(), Outcome::Printed);

    let lines = output.lines();
    assert_eq!(lines.len(), 2);

    assert_eq!(lines[0]["pid"], 1002);
    assert_eq!(lines[0]["containerName"], "web");
    assert_eq!(lines[0]["processPath"], "/usr/bin/curl");
    assert_eq!(lines[0]["processArgs"], "-s https://example.com");
    assert_eq!(lines[0]["user"], "4000321");
    assert_eq!(lines[0]["dip"], "10.0.0.1");
    assert_eq!(lines[0]["dport"], 80);

    assert_eq!(lines[1]["containerName"], "unknown");
    assert_eq!(lines[1]["processPath"], "/usr/bin/wget");
}

#[test]
fn process_started_after_refresh() {
    let host = Host::new();
    host.proc.process(LATE, WORKER);
    host.proc.exe(LATE, "/bin/sh");
    let (pipeline, output) = host.pipeline("", false);

    pipeline.handle(&sample(LATE, v4(10, 0, 0, 2), 5432)).unwrap();

    let lines = output.lines();
    assert_eq!(lines[0]["containerName"], "web");
    assert_eq!(lines[0]["processPath"], "/bin/sh");
}

#[test]
fn exclusion_rules() {
    let host = Host::new();
    let (pipeline, output) = host.pipeline(
        "dport=53; dip='10.0.0.0/8' && container=web; keyword=wget",
        false,
    );

    let outcomes: Vec<Outcome> = [
        sample(WORKER, v4(8, 8, 8, 8), 53),
        sample(WORKER, v4(10, 1, 2, 3), 443),
        sample(WORKER, v4(192, 168, 1, 1), 443),
        sample(HOST, v4(10, 1, 2, 3), 443),
    ]
    .iter()
    .map(|sample| pipeline.handle(sample).unwrap())
    .collect();

    assert_eq!(
        outcomes,
        [Outcome::Excluded, Outcome::Excluded, Outcome::Printed, Outcome::Excluded]
    );
    let lines = output.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["dip"], "192.168.1.1");
}

#[test]
fn ipv6_connections() {
    let host = Host::new();
    let dest = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));

    let (pipeline, output) = host.pipeline("", false);
    assert_eq!(pipeline.handle(&sample(WORKER, dest, 443)).unwrap(), Outcome::SkippedIpv6);
    assert!(output.lines().is_empty());

    let (pipeline, output) = host.pipeline("", true);
    assert_eq!(pipeline.handle(&sample(WORKER, dest, 443)).unwrap(), Outcome::Printed);
    let lines = output.lines();
    assert_eq!(lines[0]["addressFamily"], "AF_INET6");
    assert_eq!(lines[0]["dip"], "fd00::1");
    assert_eq!(lines[0]["containerName"], "web");
}

#[test]
fn exited_process_keeps_its_attribution() {
    let host = Host::new();
    let (pipeline, output) = host.pipeline("", false);

    pipeline.handle(&sample(WORKER, v4(10, 0, 0, 1), 80)).unwrap();
    host.proc.remove(WORKER);
    pipeline.handle(&sample(WORKER, v4(10, 0, 0, 1), 80)).unwrap();

    let lines = output.lines();
    assert_eq!(lines[1]["containerName"], "web");
    assert_eq!(lines[1]["processPath"], "");
}

#[test]
fn fentry_sample_reports_both_endpoints() {
    let host = Host::new();
    let (pipeline, output) = host.pipeline("", false);

    let mut data = Vec::new();
    let mut comm = [0u8; 16];
    comm[..4].copy_from_slice(b"curl");
    data.extend_from_slice(&comm);
    data.extend_from_slice(&(WORKER.as_raw() as u32).to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&48_000u16.to_be_bytes());
    data.extend_from_slice(&8080u16.to_be_bytes());
    data.extend_from_slice(&[172, 17, 0, 2]);
    data.extend_from_slice(&[10, 0, 0, 7]);
    data.extend_from_slice(&[0; 4]);
    data.extend_from_slice(&99u64.to_le_bytes());

    let sample = ConnectSample::decode(SampleKind::Tcp, data.as_slice()).unwrap();
    assert_eq!(pipeline.handle(&sample).unwrap(), Outcome::Printed);

    let lines = output.lines();
    assert_eq!(lines[0]["addressFamily"], "AF_INET");
    assert_eq!(lines[0]["sip"], "172.17.0.2");
    assert_eq!(lines[0]["sport"], 48000);
    assert_eq!(lines[0]["dip"], "10.0.0.7");
    assert_eq!(lines[0]["dport"], 8080);
    assert_eq!(lines[0]["user"], "root");
    assert_eq!(lines[0]["containerName"], "web");
}
