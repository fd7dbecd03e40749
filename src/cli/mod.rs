use std::{env, ffi::OsString, path::PathBuf};

use clap::{Parser, Subcommand};
use output_sinks::OutputFormat;

use crate::probe::ProbeType;

pub const NAME: &str = "lightmon";

pub const DEFAULT_CONFIG_FILE: &str = "/etc/lightmon/lightmon.ini";

/// Command line options. Unset values fall back to the configuration file,
/// then to built-in defaults.
#[derive(Parser, Debug, Clone, Default)]
#[clap(name = NAME)]
#[clap(version = crate::metadata::VERSION)]
#[clap(about = "Outbound TCP connection monitor with container attribution")]
pub struct LightmonOpts {
    /// INI configuration file [default: /etc/lightmon/lightmon.ini]
    #[clap(short = 'c', long = "config")]
    pub config_file: Option<PathBuf>,

    /// Print IPv6 connections
    #[clap(long)]
    pub ipv6: bool,

    /// Use the Kubernetes process layout to find container processes
    #[clap(long)]
    pub k8s: bool,

    /// Output format: table, json or logfile [default: logfile]
    #[clap(short = 'f', long)]
    pub format: Option<OutputFormat>,

    /// Directory of the rotated log files [default: /data/lightmon/logs]
    #[clap(long)]
    pub log_path: Option<PathBuf>,

    /// Docker runtime directory [default: /run/docker]
    #[clap(long)]
    pub docker_runtime: Option<PathBuf>,

    /// Docker data directory [default: /data/docker]
    #[clap(long)]
    pub docker_data: Option<PathBuf>,

    /// Exclusion rules, e.g. "dport=53; dip='10.0.0.0/8' && keyword=curl"
    #[clap(long)]
    pub exclude: Option<String>,

    /// Compiled eBPF probe [default: /usr/share/lightmon/probe.bpf.o]
    #[clap(long)]
    pub probe: Option<PathBuf>,

    /// Program inside the probe: fentry or tracepoint [default: fentry]
    #[clap(long)]
    pub probe_type: Option<ProbeType>,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List the running containers and exit
    Containers,
}

impl LightmonOpts {
    pub fn override_log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> LightmonOpts {
    parse_from(env::args_os())
}

pub fn parse_from<I, T>(args: I) -> LightmonOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<LightmonOpts, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    LightmonOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::LevelFilter {
    match num {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // NB: This shows one error: even for multiple causes and backtraces etc,
    // rather than one per cause, and one for the backtrace.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
