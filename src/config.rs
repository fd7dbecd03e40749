//! Daemon configuration: an optional INI file, overridden by command line flags.
//!
//! ```ini
//! [general]
//! ipv6 = false
//! k8s = false
//! format = logfile
//! log_path = /data/lightmon/logs
//! docker_runtime = /run/docker
//! docker_data = /data/docker
//! exclude = dport=53
//! probe = /usr/share/lightmon/probe.bpf.o
//! probe_type = fentry
//!
//! [attribution]
//! container_cache_ttl_secs = 300
//! name_cache_ttl_secs = 300
//! negative_cache_ttl_secs = 60
//! refresh_interval_secs = 10
//! sweep_interval_secs = 600
//! max_refresh_failures = 5
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use lightmon_common::containers::{DEFAULT_DATA_ROOT, DEFAULT_RUNTIME_ROOT};
use lightmon_core::{
    attribution::{
        DEFAULT_CONTAINER_TTL, DEFAULT_NAME_TTL, DEFAULT_REFRESH_INTERVAL,
        DEFAULT_SWEEP_INTERVAL, MAX_REFRESH_FAILURES, ResolveMode,
    },
    config::{ConfigError, SectionConfig},
};
use output_sinks::OutputFormat;

use crate::{
    cli::{DEFAULT_CONFIG_FILE, LightmonOpts},
    probe::ProbeType,
};

pub const GENERAL_SECTION: &str = "general";
pub const ATTRIBUTION_SECTION: &str = "attribution";

pub const DEFAULT_LOG_PATH: &str = "/data/lightmon/logs";
pub const DEFAULT_PROBE_PATH: &str = "/usr/share/lightmon/probe.bpf.o";

#[derive(Debug, Clone, PartialEq)]
pub struct LightmonConfig {
    pub ipv6: bool,
    pub mode: ResolveMode,
    pub format: OutputFormat,
    pub log_path: PathBuf,
    pub docker_runtime: PathBuf,
    pub docker_data: PathBuf,
    pub exclude: String,
    pub probe: PathBuf,
    pub probe_type: ProbeType,
    pub attribution: AttributionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionConfig {
    pub container_ttl: Duration,
    pub name_ttl: Duration,
    /// Unset keeps unknown attributions forever.
    pub negative_ttl: Option<Duration>,
    pub refresh_interval: Duration,
    pub sweep_interval: Duration,
    pub max_refresh_failures: usize,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            container_ttl: DEFAULT_CONTAINER_TTL,
            name_ttl: DEFAULT_NAME_TTL,
            negative_ttl: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_refresh_failures: MAX_REFRESH_FAILURES,
        }
    }
}

impl TryFrom<&SectionConfig> for AttributionConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let defaults = Self::default();
        let secs = |field: &str, default: Duration| -> Result<Duration, ConfigError> {
            let secs = config.with_default(field, default.as_secs())?;
            positive(field, secs).map(Duration::from_secs)
        };

        Ok(Self {
            container_ttl: secs("container_cache_ttl_secs", defaults.container_ttl)?,
            name_ttl: secs("name_cache_ttl_secs", defaults.name_ttl)?,
            negative_ttl: config
                .optional::<u64>("negative_cache_ttl_secs")?
                .map(|secs| positive("negative_cache_ttl_secs", secs))
                .transpose()?
                .map(Duration::from_secs),
            refresh_interval: secs("refresh_interval_secs", defaults.refresh_interval)?,
            sweep_interval: secs("sweep_interval_secs", defaults.sweep_interval)?,
            max_refresh_failures: config
                .with_default("max_refresh_failures", defaults.max_refresh_failures)?,
        })
    }
}

fn positive(field: &str, secs: u64) -> Result<u64, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: secs.to_string(),
            err: "must be greater than zero".to_string(),
        });
    }
    Ok(secs)
}

impl Default for LightmonConfig {
    fn default() -> Self {
        Self {
            ipv6: false,
            mode: ResolveMode::default(),
            format: OutputFormat::default(),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            docker_runtime: PathBuf::from(DEFAULT_RUNTIME_ROOT),
            docker_data: PathBuf::from(DEFAULT_DATA_ROOT),
            exclude: String::new(),
            probe: PathBuf::from(DEFAULT_PROBE_PATH),
            probe_type: ProbeType::default(),
            attribution: AttributionConfig::default(),
        }
    }
}

impl LightmonConfig {
    /// Loads the configuration file named on the command line, or the default
    /// one if present, then applies the command line overrides.
    pub fn load(opts: &LightmonOpts) -> Result<Self> {
        let sections = match &opts.config_file {
            Some(config_file) => {
                if !config_file.exists() {
                    bail!("Configuration file {} not found", config_file.display());
                }
                load_sections(config_file)?
            }
            None => {
                let config_file = Path::new(DEFAULT_CONFIG_FILE);
                if config_file.exists() {
                    load_sections(config_file)?
                } else {
                    log::debug!("{DEFAULT_CONFIG_FILE} not found, using defaults");
                    HashMap::new()
                }
            }
        };

        Self::from_sections(&sections, opts)
    }

    fn from_sections(sections: &HashMap<String, SectionConfig>, opts: &LightmonOpts) -> Result<Self> {
        let empty = SectionConfig::default();
        let general = sections.get(GENERAL_SECTION).unwrap_or(&empty);
        let attribution = sections.get(ATTRIBUTION_SECTION).unwrap_or(&empty);

        let mode = if opts.k8s || general.with_default("k8s", false)? {
            ResolveMode::K8s
        } else {
            ResolveMode::Docker
        };

        let pick = |flag: &Option<PathBuf>, field: &str, default: &str| -> Result<PathBuf> {
            Ok(match flag {
                Some(value) => value.clone(),
                None => general.with_default(field, PathBuf::from(default))?,
            })
        };

        Ok(Self {
            ipv6: opts.ipv6 || general.with_default("ipv6", false)?,
            mode,
            format: match opts.format {
                Some(format) => format,
                None => general.with_default("format", OutputFormat::default())?,
            },
            log_path: pick(&opts.log_path, "log_path", DEFAULT_LOG_PATH)?,
            docker_runtime: pick(&opts.docker_runtime, "docker_runtime", DEFAULT_RUNTIME_ROOT)?,
            docker_data: pick(&opts.docker_data, "docker_data", DEFAULT_DATA_ROOT)?,
            exclude: match &opts.exclude {
                Some(exclude) => exclude.clone(),
                None => general.with_default("exclude", String::new())?,
            },
            probe: pick(&opts.probe, "probe", DEFAULT_PROBE_PATH)?,
            probe_type: match opts.probe_type {
                Some(probe_type) => probe_type,
                None => general.with_default("probe_type", ProbeType::default())?,
            },
            attribution: AttributionConfig::try_from(attribution)
                .context("Invalid attribution configuration")?,
        })
    }
}

fn load_sections(config_file: &Path) -> Result<HashMap<String, SectionConfig>> {
    let mut sections: HashMap<String, SectionConfig> = HashMap::new();

    let conf = ini::Ini::load_from_file(config_file)
        .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

    for (section, prop) in &conf {
        if let Some(section) = section {
            let config = sections.entry(section.to_string()).or_default();
            for (key, value) in prop.iter() {
                log::debug!("{}.{}={}", section, key, value);
                config.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(sections)
}
