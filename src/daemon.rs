use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, ensure};
use exclude_filter::ExcludeFilter;
use lightmon_common::{containers::ContainerMetadataReader, log_error, procfs::ProcFs};
use lightmon_core::attribution::{
    AttributionCache, AttributionResolver, ContainerLoader, RefreshScheduler, spawn_sweeper,
};
use nix::unistd::geteuid;
use output_sinks::build_sink;
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    config::LightmonConfig,
    pipeline::EventPipeline,
    probe::{self, FENTRY_FUNCTION, Probe, ProbeType, TRACEPOINT_CATEGORY, TRACEPOINT_NAME},
    term_print::TermPrintable,
};

const TRACEFS_EVENTS: &str = "/sys/kernel/debug/tracing/events";

/// Checks the host has what the daemon needs before anything is loaded.
pub fn verify_runtime(config: &LightmonConfig, tracefs_events: &Path, procfs: &ProcFs) -> Result<()> {
    match config.probe_type {
        ProbeType::Fentry => {
            let exported = procfs
                .kernel_symbol_exists(FENTRY_FUNCTION)
                .context("Error reading kernel symbols")?;
            ensure!(
                exported,
                "Kernel function {FENTRY_FUNCTION} not available, try --probe-type tracepoint"
            );
        }
        ProbeType::Tracepoint => {
            let tracepoint = tracefs_events.join(TRACEPOINT_CATEGORY).join(TRACEPOINT_NAME);
            ensure!(
                tracepoint.exists(),
                "Tracepoint {} not available, is tracefs mounted?",
                tracepoint.display()
            );
        }
    }
    ensure!(
        config.docker_runtime.is_dir(),
        "Docker runtime directory {} not found, set it with --docker-runtime",
        config.docker_runtime.display()
    );
    ensure!(
        config.docker_data.is_dir(),
        "Docker data directory {} not found, set it with --docker-data",
        config.docker_data.display()
    );
    Ok(())
}

fn container_reader(config: &LightmonConfig) -> ContainerMetadataReader {
    ContainerMetadataReader::new(
        config.docker_runtime.clone(),
        config.docker_data.clone(),
        ProcFs::default(),
    )
}

/// Prints the running containers once.
pub fn list_containers(config: &LightmonConfig) -> Result<()> {
    let records = container_reader(config)
        .read_all()
        .context("Error listing running containers")?;
    records.term_print()?;
    Ok(())
}

pub async fn lightmon_daemon_run(config: LightmonConfig) -> Result<()> {
    log::trace!("Lightmon configuration: {:?}", config);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    verify_runtime(&config, Path::new(TRACEFS_EVENTS), &ProcFs::default())?;

    probe::bump_memlock_rlimit()?;

    let attribution = &config.attribution;
    let cache = AttributionCache::new();
    let sweeper = spawn_sweeper(cache.clone(), attribution.sweep_interval);

    let loader = ContainerLoader::new(container_reader(&config), cache.clone())
        .with_ttl(attribution.container_ttl);
    match loader.load() {
        Ok(count) => log::info!("Found {count} container processes"),
        Err(err) => log_error("Loading containers", err),
    }
    let refresher = RefreshScheduler::new(attribution.refresh_interval)
        .with_max_failures(attribution.max_refresh_failures)
        .spawn(move || loader.load());

    let resolver = AttributionResolver::new(cache, ProcFs::default(), config.mode)
        .with_name_ttl(attribution.name_ttl)
        .with_negative_ttl(attribution.negative_ttl);

    let filter = ExcludeFilter::parse(&config.exclude);
    if !filter.is_empty() {
        log::info!("Excluding connections matching {filter}");
    }

    let sink = build_sink(config.format, &config.log_path)
        .with_context(|| format!("Error creating {} output", config.format))?;

    let pipeline = Arc::new(
        EventPipeline::new(ProcFs::default(), resolver, filter, sink).with_ipv6(config.ipv6),
    );
    pipeline.print_header().context("Error printing header")?;

    let mut probe = Probe::load(&config.probe, config.probe_type)?;
    probe.attach()?;
    probe.read_events(pipeline)?;
    log::info!(
        "Monitoring connections ({} probe, {} mode)",
        config.probe_type,
        config.mode
    );

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
    }

    log::info!("Terminating Lightmon...");
    probe.stop();
    refresher.abort();
    sweeper.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use lightmon_common::test_utils::FakeProc;

    use super::*;

    struct Host {
        dir: tempfile::TempDir,
        proc: FakeProc,
        config: LightmonConfig,
    }

    impl Host {
        fn new(probe_type: ProbeType) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = LightmonConfig::default();
            config.docker_runtime = dir.path().join("run/docker");
            config.docker_data = dir.path().join("data/docker");
            config.probe_type = probe_type;
            Self {
                dir,
                proc: FakeProc::new(),
                config,
            }
        }

        fn verify(&self) -> Result<()> {
            verify_runtime(&self.config, &self.tracefs(), &self.proc.procfs())
        }

        fn tracefs(&self) -> PathBuf {
            self.dir.path().join("tracing/events")
        }

        fn create_all(&self) {
            self.proc.kallsyms(&["ffffffff81a3c2d0 T tcp_connect"]);
            fs::create_dir_all(self.tracefs().join("syscalls/sys_enter_connect")).unwrap();
            fs::create_dir_all(&self.config.docker_runtime).unwrap();
            fs::create_dir_all(&self.config.docker_data).unwrap();
        }
    }

    #[test]
    fn runtime_ready() {
        for probe_type in [ProbeType::Fentry, ProbeType::Tracepoint] {
            let host = Host::new(probe_type);
            host.create_all();
            host.verify().unwrap();
        }
    }

    #[test]
    fn missing_tracepoint() {
        let host = Host::new(ProbeType::Tracepoint);
        host.create_all();
        fs::remove_dir(host.tracefs().join("syscalls/sys_enter_connect")).unwrap();
        let err = host.verify().unwrap_err();
        assert!(err.to_string().contains("sys_enter_connect"));
    }

    #[test]
    fn fentry_needs_kernel_symbol() {
        let host = Host::new(ProbeType::Fentry);
        host.create_all();
        // the tracepoint is not needed by the fentry probe
        fs::remove_dir(host.tracefs().join("syscalls/sys_enter_connect")).unwrap();
        host.verify().unwrap();

        host.proc.kallsyms(&["ffffffff81a3c000 T tcp_connect_init"]);
        let err = host.verify().unwrap_err();
        assert!(err.to_string().contains("tcp_connect not available"));
    }

    #[test]
    fn missing_docker_dirs() {
        let host = Host::new(ProbeType::Fentry);
        host.create_all();
        fs::remove_dir(&host.config.docker_data).unwrap();
        let err = host.verify().unwrap_err();
        assert!(err.to_string().contains("--docker-data"));

        fs::remove_dir(&host.config.docker_runtime).unwrap();
        let err = host.verify().unwrap_err();
        assert!(err.to_string().contains("--docker-runtime"));
    }
}
